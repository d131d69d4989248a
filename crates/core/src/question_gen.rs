use crate::callbacks::{payload, CallbackEventType, CallbackManager};
use crate::error::QueryError;
use crate::models::QueryBundle;
use crate::predictor::LlmPredictor;
use crate::prompts::{prompt_args, PromptTemplate};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubQuestion {
    pub sub_question: String,
    pub tool_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProgramOutput {
    List(Vec<SubQuestion>),
    Wrapped { sub_questions: Vec<SubQuestion> },
}

impl ProgramOutput {
    fn into_sub_questions(self) -> Vec<SubQuestion> {
        match self {
            ProgramOutput::List(items) => items,
            ProgramOutput::Wrapped { sub_questions } => sub_questions,
        }
    }
}

/// Tool descriptions as a pretty-printed `name -> description` JSON object.
pub fn build_tools_text(tools: &[ToolMetadata]) -> Result<String, QueryError> {
    let tools = tools
        .iter()
        .map(|tool| (tool.name.clone(), Value::from(tool.description.as_str())))
        .collect::<Map<String, Value>>();
    Ok(serde_json::to_string_pretty(&Value::Object(tools))?)
}

#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(
        &self,
        tools: &[ToolMetadata],
        query: &QueryBundle,
    ) -> Result<Vec<SubQuestion>, QueryError>;
}

/// Asks the model for a JSON list of sub-questions, each routed to one of
/// the given tools.
pub struct LlmQuestionGenerator<P> {
    predictor: P,
    prompt: PromptTemplate,
    verbose: bool,
    callback_manager: CallbackManager,
}

impl<P: LlmPredictor> LlmQuestionGenerator<P> {
    pub fn new(predictor: P) -> Self {
        Self {
            predictor,
            prompt: PromptTemplate::sub_question(),
            verbose: false,
            callback_manager: CallbackManager::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_callback_manager(mut self, callback_manager: CallbackManager) -> Self {
        self.callback_manager = callback_manager;
        self
    }
}

#[async_trait]
impl<P: LlmPredictor> QuestionGenerator for LlmQuestionGenerator<P> {
    async fn generate(
        &self,
        tools: &[ToolMetadata],
        query: &QueryBundle,
    ) -> Result<Vec<SubQuestion>, QueryError> {
        let event_id = self.callback_manager.on_event_start(
            CallbackEventType::SubQuestions,
            Some(json!({ "query_str": query.query_str })),
        );

        let tools_str = build_tools_text(tools)?;
        let args = prompt_args([
            ("tools_str", tools_str.as_str()),
            ("query_str", query.query_str.as_str()),
        ]);
        let output = self.predictor.predict(&self.prompt, &args).await?;
        let sub_questions = parse_sub_questions(&output)?;

        if let Some(unknown) = sub_questions
            .iter()
            .find(|item| !tools.iter().any(|tool| tool.name == item.tool_name))
        {
            warn!(tool = %unknown.tool_name, "sub-question routed to unknown tool");
            return Err(QueryError::UnknownTool(unknown.tool_name.clone()));
        }

        if self.verbose {
            for item in &sub_questions {
                info!(tool = %item.tool_name, sub_question = %item.sub_question, "generated sub-question");
            }
        }

        let mut end_payload = Map::new();
        end_payload.insert(
            payload::SUB_QUESTIONS.to_string(),
            serde_json::to_value(&sub_questions)?,
        );
        self.callback_manager.on_event_end(
            CallbackEventType::SubQuestions,
            Some(Value::Object(end_payload)),
            &event_id,
        );

        Ok(sub_questions)
    }
}

/// Reads sub-questions from model output: a fenced ```json block when there
/// is one, otherwise everything from the first `[` or `{`.
pub fn parse_sub_questions(output: &str) -> Result<Vec<SubQuestion>, QueryError> {
    let fenced = Regex::new(r"(?s)```(?:json)?\s*(.*?)```")
        .map_err(|error| QueryError::ProgramOutput(error.to_string()))?;

    let candidate = match fenced.captures(output).and_then(|capture| capture.get(1)) {
        Some(block) => block.as_str().trim(),
        None => {
            let start = output
                .find(['[', '{'])
                .ok_or_else(|| QueryError::ProgramOutput("no JSON found".to_string()))?;
            output[start..].trim()
        }
    };

    let parsed = serde_json::Deserializer::from_str(candidate)
        .into_iter::<ProgramOutput>()
        .next()
        .ok_or_else(|| QueryError::ProgramOutput("empty JSON output".to_string()))?
        .map_err(|error| QueryError::ProgramOutput(error.to_string()))?;

    Ok(parsed.into_sub_questions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::EventRecorder;
    use crate::llm::ScriptedLlm;
    use crate::predictor::Predictor;
    use std::sync::Arc;

    fn tools() -> Vec<ToolMetadata> {
        vec![
            ToolMetadata::new("uber_10k", "Provides information about Uber financials"),
            ToolMetadata::new("lyft_10k", "Provides information about Lyft financials"),
        ]
    }

    #[test]
    fn tools_text_maps_names_to_descriptions() {
        let text = build_tools_text(&tools()).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["uber_10k"], "Provides information about Uber financials");
        assert!(text.contains('\n'));
    }

    #[test]
    fn parses_fenced_array() {
        let output = "Here you go:\n```json\n[{\"sub_question\": \"Revenue of Uber\", \"tool_name\": \"uber_10k\"}]\n```\nDone.";
        let parsed = parse_sub_questions(output).unwrap();
        assert_eq!(
            parsed,
            vec![SubQuestion {
                sub_question: "Revenue of Uber".to_string(),
                tool_name: "uber_10k".to_string(),
            }]
        );
    }

    #[test]
    fn parses_wrapped_object_with_trailing_text() {
        let output = "{\"sub_questions\": [{\"sub_question\": \"EBITDA of Lyft\", \"tool_name\": \"lyft_10k\"}]} trailing words";
        let parsed = parse_sub_questions(output).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].tool_name, "lyft_10k");
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(matches!(
            parse_sub_questions("I cannot help with that."),
            Err(QueryError::ProgramOutput(_))
        ));
        assert!(matches!(
            parse_sub_questions("[{\"question\": 1}]"),
            Err(QueryError::ProgramOutput(_))
        ));
    }

    #[tokio::test]
    async fn generate_prompts_with_tools_and_query() {
        let predictor = Arc::new(Predictor::new(ScriptedLlm::with_responses([concat!(
            "```json\n[\n",
            "{\"sub_question\": \"What is the revenue growth of Uber\", \"tool_name\": \"uber_10k\"},\n",
            "{\"sub_question\": \"What is the revenue growth of Lyft\", \"tool_name\": \"lyft_10k\"}\n",
            "]\n```"
        )])));
        let recorder = Arc::new(EventRecorder::default());
        let mut manager = CallbackManager::default();
        manager.add_handler(recorder.clone());

        let generator = LlmQuestionGenerator::new(predictor.clone())
            .verbose(true)
            .with_callback_manager(manager);
        let sub_questions = generator
            .generate(
                &tools(),
                &QueryBundle::new("Compare revenue growth of Uber and Lyft"),
            )
            .await
            .unwrap();

        assert_eq!(sub_questions.len(), 2);
        assert_eq!(sub_questions[1].tool_name, "lyft_10k");

        let prompts = predictor.llm().prompts();
        assert!(prompts[0].contains("\"lyft_10k\": \"Provides information about Lyft financials\""));
        assert!(prompts[0].contains("<User Question>\nCompare revenue growth of Uber and Lyft\n"));

        let events = recorder.events_of(CallbackEventType::SubQuestions);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].payload.clone().unwrap()["sub_questions"][0]["tool_name"],
            "uber_10k"
        );
    }

    #[tokio::test]
    async fn generate_rejects_unknown_tools() {
        let predictor = Predictor::new(ScriptedLlm::with_responses([
            "[{\"sub_question\": \"Revenue of Tesla\", \"tool_name\": \"tesla_10k\"}]",
        ]));
        let result = LlmQuestionGenerator::new(predictor)
            .generate(&tools(), &QueryBundle::new("Tesla revenue"))
            .await;
        assert!(matches!(result, Err(QueryError::UnknownTool(name)) if name == "tesla_10k"));
    }
}
