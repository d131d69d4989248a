use crate::callbacks::{payload, CallbackEventType, CallbackManager};
use crate::error::QueryError;
use crate::llm::count_tokens;
use crate::models::{CitationNode, Metadata, QueryBundle, Response};
use crate::predictor::LlmPredictor;
use crate::prompts::{prompt_args, PromptTemplate};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

#[async_trait]
pub trait ResponseSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        query: &QueryBundle,
        nodes: Vec<CitationNode>,
    ) -> Result<Response, QueryError>;
}

/// Packs citation nodes into as few prompts as the model's context window
/// allows: the first pack is answered with the QA template, each later pack
/// refines the previous answer.
pub struct CompactAndRefine<P> {
    predictor: P,
    text_qa_template: PromptTemplate,
    refine_template: PromptTemplate,
    callback_manager: CallbackManager,
}

impl<P: LlmPredictor> CompactAndRefine<P> {
    pub fn new(predictor: P) -> Self {
        Self {
            predictor,
            text_qa_template: PromptTemplate::citation_qa(),
            refine_template: PromptTemplate::citation_refine(),
            callback_manager: CallbackManager::default(),
        }
    }

    pub fn with_templates(mut self, text_qa: PromptTemplate, refine: PromptTemplate) -> Self {
        self.text_qa_template = text_qa;
        self.refine_template = refine;
        self
    }

    pub fn with_callback_manager(mut self, callback_manager: CallbackManager) -> Self {
        self.callback_manager = callback_manager;
        self
    }

    fn context_budget(&self) -> Result<usize, QueryError> {
        let metadata = self.predictor.metadata();
        let template_tokens = count_tokens(&self.text_qa_template.format_empty()?)
            .max(count_tokens(&self.refine_template.format_empty()?));

        Ok(metadata
            .context_window
            .saturating_sub(metadata.num_output)
            .saturating_sub(template_tokens)
            .max(1))
    }

    async fn answer(&self, query: &QueryBundle, packs: &[String]) -> Result<String, QueryError> {
        let mut answer = String::new();

        for (index, context) in packs.iter().enumerate() {
            answer = if index == 0 {
                let args = prompt_args([
                    ("context_str", context.as_str()),
                    ("query_str", query.query_str.as_str()),
                ]);
                self.predictor.predict(&self.text_qa_template, &args).await?
            } else {
                let args = prompt_args([
                    ("existing_answer", answer.as_str()),
                    ("context_msg", context.as_str()),
                    ("query_str", query.query_str.as_str()),
                ]);
                debug!(pack = index, "refining answer");
                self.predictor.predict(&self.refine_template, &args).await?
            };
        }

        Ok(answer.trim().to_string())
    }
}

#[async_trait]
impl<P: LlmPredictor> ResponseSynthesizer for CompactAndRefine<P> {
    async fn synthesize(
        &self,
        query: &QueryBundle,
        nodes: Vec<CitationNode>,
    ) -> Result<Response, QueryError> {
        let event_id = self.callback_manager.on_event_start(
            CallbackEventType::Synthesize,
            Some(json!({ "query_str": query.query_str })),
        );

        let budget = self.context_budget()?;
        let packs = pack_context(nodes.iter().map(|node| node.text.as_str()), budget);
        let response = self.answer(query, &packs).await?;

        info!(
            nodes = nodes.len(),
            llm_calls = packs.len(),
            budget,
            "synthesized citation response"
        );

        let mut metadata = Metadata::new();
        metadata.insert("llm_calls".to_string(), Value::from(packs.len()));

        let mut end_payload = serde_json::Map::new();
        end_payload.insert(payload::RESPONSE.to_string(), Value::from(response.as_str()));
        self.callback_manager.on_event_end(
            CallbackEventType::Synthesize,
            Some(Value::Object(end_payload)),
            &event_id,
        );

        Ok(Response {
            response,
            source_nodes: nodes,
            metadata,
        })
    }
}

/// Concatenates texts in order into packs of at most `budget` tokens; a text
/// larger than the budget becomes a pack of its own.
pub fn pack_context<'a, I>(texts: I, budget: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut packs = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for text in texts {
        let tokens = count_tokens(text);
        if !current.is_empty() && current_tokens + tokens > budget {
            packs.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push_str(text);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        packs.push(current);
    }

    packs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::EventRecorder;
    use crate::citation::format_source_label;
    use crate::llm::{LlmMetadata, ScriptedLlm};
    use crate::models::{Metadata, Relationships};
    use crate::predictor::Predictor;
    use std::sync::Arc;

    fn node(number: usize, chunk: &str) -> CitationNode {
        CitationNode {
            node_id: format!("n{number}"),
            citation_number: number,
            text: format_source_label(number, chunk),
            score: Some(1.0),
            metadata: Metadata::new(),
            relationships: Relationships::new(),
        }
    }

    #[test]
    fn packs_respect_budget_and_order() {
        let packs = pack_context(["a b", "c d", "e f g h i", "j"], 4);
        assert_eq!(packs, vec!["a bc d", "e f g h i", "j"]);
    }

    #[test]
    fn everything_fits_in_one_pack() {
        let packs = pack_context(
            ["Source 1:\nThe sky is red.\n", "Source 2:\nWater is wet.\n"],
            100,
        );
        assert_eq!(
            packs,
            vec!["Source 1:\nThe sky is red.\nSource 2:\nWater is wet.\n"]
        );
    }

    #[tokio::test]
    async fn single_pack_uses_the_qa_template() {
        let predictor = Arc::new(Predictor::new(ScriptedLlm::with_responses([
            " The sky is red [1]. ",
        ])));
        let synthesizer = CompactAndRefine::new(predictor.clone());

        let response = synthesizer
            .synthesize(
                &QueryBundle::new("What color is the sky?"),
                vec![node(1, "The sky is red."), node(2, "Water is wet.")],
            )
            .await
            .unwrap();

        assert_eq!(response.response, "The sky is red [1].");
        assert_eq!(response.source_nodes.len(), 2);
        assert_eq!(response.metadata["llm_calls"], 1);

        let prompts = predictor.llm().prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Source 1:\nThe sky is red.\nSource 2:\nWater is wet.\n"));
        assert!(prompts[0].ends_with("Query: What color is the sky?\nAnswer: "));
    }

    #[tokio::test]
    async fn overflowing_context_is_refined() {
        let template_tokens = count_tokens(&PromptTemplate::citation_qa().format_empty().unwrap())
            .max(count_tokens(
                &PromptTemplate::citation_refine().format_empty().unwrap(),
            ));
        let metadata = LlmMetadata {
            context_window: template_tokens + 10 + 6,
            num_output: 10,
            model_name: "tiny".to_string(),
        };
        let predictor = Arc::new(Predictor::new(
            ScriptedLlm::with_responses(["draft [1]", "final [1][2]"]).with_metadata(metadata),
        ));
        let synthesizer = CompactAndRefine::new(predictor.clone());

        let response = synthesizer
            .synthesize(
                &QueryBundle::new("sky?"),
                vec![node(1, "one two three"), node(2, "four five six")],
            )
            .await
            .unwrap();

        assert_eq!(response.response, "final [1][2]");
        assert_eq!(response.cited_sources(), vec![1, 2]);

        let prompts = predictor.llm().prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("We have provided an existing answer: draft [1]"));
        assert!(prompts[1].contains("Source 2:\nfour five six\n"));
        assert!(!prompts[1].contains("Source 1:\none two three"));
    }

    #[tokio::test]
    async fn no_nodes_gives_empty_answer_without_model_calls() {
        let recorder = Arc::new(EventRecorder::default());
        let mut manager = CallbackManager::default();
        manager.add_handler(recorder.clone());

        let predictor = Arc::new(Predictor::new(ScriptedLlm::default()));
        let synthesizer = CompactAndRefine::new(predictor.clone()).with_callback_manager(manager);

        let response = synthesizer
            .synthesize(&QueryBundle::new("anything"), Vec::new())
            .await
            .unwrap();

        assert_eq!(response.response, "");
        assert!(predictor.llm().prompts().is_empty());
        assert_eq!(recorder.events_of(CallbackEventType::Synthesize).len(), 2);
    }
}
