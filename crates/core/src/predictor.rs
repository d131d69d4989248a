use crate::callbacks::{payload, CallbackEventType, CallbackManager};
use crate::error::LlmError;
use crate::llm::{count_tokens, CompletionStream, Llm, LlmMetadata};
use crate::prompts::{PromptArgs, PromptTemplate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait LlmPredictor: Send + Sync {
    fn metadata(&self) -> LlmMetadata;

    async fn predict(&self, prompt: &PromptTemplate, args: &PromptArgs) -> Result<String, LlmError>;

    async fn stream(
        &self,
        prompt: &PromptTemplate,
        args: &PromptArgs,
    ) -> Result<CompletionStream, LlmError>;
}

#[async_trait]
impl<P: LlmPredictor + ?Sized> LlmPredictor for Arc<P> {
    fn metadata(&self) -> LlmMetadata {
        (**self).metadata()
    }

    async fn predict(&self, prompt: &PromptTemplate, args: &PromptArgs) -> Result<String, LlmError> {
        (**self).predict(prompt, args).await
    }

    async fn stream(
        &self,
        prompt: &PromptTemplate,
        args: &PromptArgs,
    ) -> Result<CompletionStream, LlmError> {
        (**self).stream(prompt, args).await
    }
}

/// Formats prompts, forwards them to an [`Llm`] and reports each call to
/// the callback manager.
pub struct Predictor<L> {
    llm: L,
    callback_manager: CallbackManager,
}

impl<L: Llm> Predictor<L> {
    pub fn new(llm: L) -> Self {
        Self {
            llm,
            callback_manager: CallbackManager::default(),
        }
    }

    pub fn with_callback_manager(mut self, callback_manager: CallbackManager) -> Self {
        self.callback_manager = callback_manager;
        self
    }

    pub fn llm(&self) -> &L {
        &self.llm
    }

    fn log_start(&self, prompt: &PromptTemplate, args: &PromptArgs) -> String {
        let mut llm_payload = args
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect::<Map<String, Value>>();
        llm_payload.insert(
            payload::TEMPLATE.to_string(),
            Value::String(prompt.template().to_string()),
        );

        self.callback_manager
            .on_event_start(CallbackEventType::Llm, Some(Value::Object(llm_payload)))
    }

    fn log_end(&self, event_id: &str, output: &str, formatted_prompt: &str) {
        let prompt_tokens = count_tokens(formatted_prompt);
        let prediction_tokens = count_tokens(output);

        let mut end_payload = Map::new();
        end_payload.insert(payload::RESPONSE.to_string(), Value::from(output));
        end_payload.insert(payload::PROMPT.to_string(), Value::from(formatted_prompt));
        end_payload.insert(payload::PROMPT_TOKENS.to_string(), Value::from(prompt_tokens));
        end_payload.insert(
            payload::PREDICTION_TOKENS.to_string(),
            Value::from(prediction_tokens),
        );
        end_payload.insert(
            payload::TOTAL_TOKENS.to_string(),
            Value::from(prompt_tokens + prediction_tokens),
        );

        self.callback_manager.on_event_end(
            CallbackEventType::Llm,
            Some(Value::Object(end_payload)),
            event_id,
        );
    }
}

#[async_trait]
impl<L: Llm> LlmPredictor for Predictor<L> {
    fn metadata(&self) -> LlmMetadata {
        self.llm.metadata()
    }

    async fn predict(&self, prompt: &PromptTemplate, args: &PromptArgs) -> Result<String, LlmError> {
        let event_id = self.log_start(prompt, args);

        let formatted_prompt = prompt.format(args)?;
        let output = self.llm.complete(&formatted_prompt).await?.text;

        debug!(output = %output, "llm prediction");
        self.log_end(&event_id, &output, &formatted_prompt);

        Ok(output)
    }

    async fn stream(
        &self,
        prompt: &PromptTemplate,
        args: &PromptArgs,
    ) -> Result<CompletionStream, LlmError> {
        let formatted_prompt = prompt.format(args)?;
        self.llm.stream_complete(&formatted_prompt).await
    }
}
