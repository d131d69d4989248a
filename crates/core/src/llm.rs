use crate::chunking::{Tokenizer, WhitespaceTokenizer};
use crate::error::LlmError;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_CONTEXT_WINDOW: usize = 3_900;
pub const DEFAULT_NUM_OUTPUT: usize = 256;

/// Text deltas of a completion, in arrival order.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmMetadata {
    pub context_window: usize,
    pub num_output: usize,
    pub model_name: String,
}

impl Default for LlmMetadata {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            num_output: DEFAULT_NUM_OUTPUT,
            model_name: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub raw: Option<Value>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raw: None,
        }
    }
}

#[async_trait]
pub trait Llm: Send + Sync {
    fn metadata(&self) -> LlmMetadata;

    async fn complete(&self, prompt: &str) -> Result<CompletionResponse, LlmError>;

    async fn stream_complete(&self, prompt: &str) -> Result<CompletionStream, LlmError> {
        let response = self.complete(prompt).await?;
        Ok(Box::pin(stream::once(async move { Ok(response.text) })))
    }
}

#[async_trait]
impl<L: Llm + ?Sized> Llm for Box<L> {
    fn metadata(&self) -> LlmMetadata {
        (**self).metadata()
    }

    async fn complete(&self, prompt: &str) -> Result<CompletionResponse, LlmError> {
        (**self).complete(prompt).await
    }

    async fn stream_complete(&self, prompt: &str) -> Result<CompletionStream, LlmError> {
        (**self).stream_complete(prompt).await
    }
}

pub fn count_tokens(text: &str) -> usize {
    WhitespaceTokenizer.count(text)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiCompatibleConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub context_window: usize,
    pub num_output: usize,
}

impl Default for OpenAiCompatibleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            model: "gpt-3.5-turbo-instruct".to_string(),
            api_key: None,
            temperature: 0.0,
            context_window: DEFAULT_CONTEXT_WINDOW,
            num_output: DEFAULT_NUM_OUTPUT,
        }
    }
}

/// Completion client for servers exposing the `/v1/completions` route.
pub struct OpenAiCompatibleLlm {
    config: OpenAiCompatibleConfig,
    completions_url: Url,
    client: Client,
}

impl OpenAiCompatibleLlm {
    pub fn new(config: OpenAiCompatibleConfig) -> Result<Self, LlmError> {
        let completions_url = Url::parse(&format!(
            "{}/v1/completions",
            config.endpoint.trim_end_matches('/')
        ))?;

        Ok(Self {
            config,
            completions_url,
            client: Client::new(),
        })
    }

    fn request_body(&self, prompt: &str, stream: bool) -> Value {
        json!({
            "model": self.config.model,
            "prompt": prompt,
            "max_tokens": self.config.num_output,
            "temperature": self.config.temperature,
            "stream": stream,
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .client
            .post(self.completions_url.clone())
            .json(&self.request_body(prompt, stream));
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), url = %self.completions_url, "completion request failed");
            return Err(LlmError::Status {
                provider: self.config.endpoint.clone(),
                status: status.as_u16(),
                details,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Llm for OpenAiCompatibleLlm {
    fn metadata(&self) -> LlmMetadata {
        LlmMetadata {
            context_window: self.config.context_window,
            num_output: self.config.num_output,
            model_name: self.config.model.clone(),
        }
    }

    async fn complete(&self, prompt: &str) -> Result<CompletionResponse, LlmError> {
        let body: Value = self.send(prompt, false).await?.json().await?;
        let text = completion_text(&body)
            .ok_or_else(|| LlmError::EmptyResponse(self.config.endpoint.clone()))?;

        debug!(model = %self.config.model, chars = text.len(), "completion received");
        Ok(CompletionResponse {
            text,
            raw: Some(body),
        })
    }

    async fn stream_complete(&self, prompt: &str) -> Result<CompletionStream, LlmError> {
        let response = self.send(prompt, true).await?;
        let deltas = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => parse_stream_event(&event.data),
                    Err(error) => Some(Err(LlmError::StreamParse(error.to_string()))),
                }
            });
        Ok(Box::pin(deltas))
    }
}

fn completion_text(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

fn parse_stream_event(data: &str) -> Option<Result<String, LlmError>> {
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(chunk) => completion_text(&chunk)
            .filter(|delta| !delta.is_empty())
            .map(Ok),
        Err(error) => Some(Err(LlmError::StreamParse(format!(
            "failed to parse stream data: {error}"
        )))),
    }
}

/// Answers every prompt with the prompt itself.
#[derive(Debug, Clone, Default)]
pub struct EchoLlm {
    pub metadata: LlmMetadata,
}

#[async_trait]
impl Llm for EchoLlm {
    fn metadata(&self) -> LlmMetadata {
        self.metadata.clone()
    }

    async fn complete(&self, prompt: &str) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse::text(prompt))
    }
}

/// Replays queued responses, then falls back to a fixed answer.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    pub metadata: LlmMetadata,
    pub default_response: String,
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: LlmMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn metadata(&self) -> LlmMetadata {
        self.metadata.clone()
    }

    async fn complete(&self, prompt: &str) -> Result<CompletionResponse, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        Ok(CompletionResponse::text(
            next.unwrap_or_else(|| self.default_response.clone()),
        ))
    }
}
