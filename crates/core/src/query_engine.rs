use crate::callbacks::{payload, CallbackEventType, CallbackManager};
use crate::chunking::TokenTextSplitter;
use crate::citation::citation_nodes_with;
use crate::error::{QueryError, SplitError};
use crate::models::{CitationNode, CitationOptions, Passage, QueryBundle, Response};
use crate::retriever::Retriever;
use crate::synthesizer::ResponseSynthesizer;
use serde_json::{Map, Value};
use tracing::info;

/// Retrieves passages, relabels them as numbered sources and hands them to
/// a synthesizer that cites those numbers.
pub struct CitationQueryEngine<R, S>
where
    R: Retriever,
    S: ResponseSynthesizer,
{
    retriever: R,
    synthesizer: S,
    splitter: TokenTextSplitter,
    callback_manager: CallbackManager,
}

impl<R, S> CitationQueryEngine<R, S>
where
    R: Retriever,
    S: ResponseSynthesizer,
{
    pub fn new(retriever: R, synthesizer: S, options: CitationOptions) -> Result<Self, SplitError> {
        Ok(Self {
            retriever,
            synthesizer,
            splitter: TokenTextSplitter::from_options(options)?,
            callback_manager: CallbackManager::default(),
        })
    }

    pub fn with_callback_manager(mut self, callback_manager: CallbackManager) -> Self {
        self.callback_manager = callback_manager;
        self
    }

    pub fn create_citation_nodes(&self, passages: &[Passage]) -> Vec<CitationNode> {
        citation_nodes_with(&self.splitter, passages)
    }

    pub async fn synthesize(
        &self,
        query: &QueryBundle,
        passages: &[Passage],
    ) -> Result<Response, QueryError> {
        let nodes = self.create_citation_nodes(passages);
        self.synthesizer.synthesize(query, nodes).await
    }

    pub async fn query(&self, query: &QueryBundle) -> Result<Response, QueryError> {
        if query.query_str.trim().is_empty() {
            return Err(QueryError::EmptyQuery);
        }

        let query_id = self.callback_manager.on_event_start(
            CallbackEventType::Query,
            Some(single_entry(payload::QUERY_STR, Value::from(query.query_str.as_str()))),
        );

        let retrieve_id = self
            .callback_manager
            .on_event_start(CallbackEventType::Retrieve, None);
        let passages = self.retriever.retrieve(query).await?;
        let nodes = self.create_citation_nodes(&passages);
        self.callback_manager.on_event_end(
            CallbackEventType::Retrieve,
            Some(single_entry(payload::NODES, serde_json::to_value(&nodes)?)),
            &retrieve_id,
        );

        info!(
            query = %query.query_str,
            passages = passages.len(),
            sources = nodes.len(),
            "citation sources prepared"
        );

        let response = self.synthesizer.synthesize(query, nodes).await?;

        self.callback_manager.on_event_end(
            CallbackEventType::Query,
            Some(single_entry(payload::RESPONSE, serde_json::to_value(&response)?)),
            &query_id,
        );
        Ok(response)
    }
}

fn single_entry(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{EventPhase, EventRecorder};
    use crate::llm::ScriptedLlm;
    use crate::models::TokenizerKind;
    use crate::predictor::Predictor;
    use crate::retriever::InMemoryRetriever;
    use crate::synthesizer::CompactAndRefine;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedRetriever {
        passages: Vec<Passage>,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<Passage>, QueryError> {
            Ok(self.passages.clone())
        }
    }

    struct FailingRetriever;

    #[async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<Passage>, QueryError> {
            Err(QueryError::Retrieval("index offline".to_string()))
        }
    }

    /// Answers with the citation numbers it was given.
    struct ListingSynthesizer;

    #[async_trait]
    impl ResponseSynthesizer for ListingSynthesizer {
        async fn synthesize(
            &self,
            _query: &QueryBundle,
            nodes: Vec<CitationNode>,
        ) -> Result<Response, QueryError> {
            let response = nodes
                .iter()
                .map(|node| format!("[{}]", node.citation_number))
                .collect::<Vec<_>>()
                .join(" ");
            Ok(Response {
                response,
                source_nodes: nodes,
                metadata: Default::default(),
            })
        }
    }

    fn long_text(count: usize) -> String {
        (0..count)
            .map(|index| format!("token{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[tokio::test]
    async fn query_numbers_sources_across_passages() {
        let retriever = FixedRetriever {
            passages: vec![
                Passage::new("The sky is red.").with_score(0.9),
                Passage::new(long_text(600)).with_score(0.3),
            ],
        };
        let engine =
            CitationQueryEngine::new(retriever, ListingSynthesizer, CitationOptions::default())
                .unwrap();

        let response = engine
            .query(&QueryBundle::new("What color is the sky?"))
            .await
            .unwrap();

        assert_eq!(response.response, "[1] [2] [3] [4]");
        assert_eq!(response.source_nodes[0].text, "Source 1:\nThe sky is red.\n");
        assert_eq!(response.source_nodes[0].score, Some(0.9));
        assert!(response.source_nodes[1..]
            .iter()
            .all(|node| node.score == Some(0.3)));
    }

    #[tokio::test]
    async fn query_emits_nested_query_and_retrieve_events() {
        let recorder = Arc::new(EventRecorder::default());
        let mut manager = CallbackManager::default();
        manager.add_handler(recorder.clone());

        let retriever = FixedRetriever {
            passages: vec![Passage::new("Water is wet.")],
        };
        let engine =
            CitationQueryEngine::new(retriever, ListingSynthesizer, CitationOptions::default())
                .unwrap()
                .with_callback_manager(manager);

        engine.query(&QueryBundle::new("Is water wet?")).await.unwrap();

        let events = recorder.events();
        let sequence: Vec<(CallbackEventType, EventPhase)> = events
            .iter()
            .map(|event| (event.event_type, event.phase))
            .collect();
        assert_eq!(
            sequence,
            vec![
                (CallbackEventType::Query, EventPhase::Start),
                (CallbackEventType::Retrieve, EventPhase::Start),
                (CallbackEventType::Retrieve, EventPhase::End),
                (CallbackEventType::Query, EventPhase::End),
            ]
        );

        let retrieved = events[2].payload.clone().unwrap();
        assert_eq!(retrieved["nodes"][0]["text"], "Source 1:\nWater is wet.\n");
        assert_eq!(events[0].payload.clone().unwrap()["query_str"], "Is water wet?");
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let engine = CitationQueryEngine::new(
            FixedRetriever {
                passages: Vec::new(),
            },
            ListingSynthesizer,
            CitationOptions::default(),
        )
        .unwrap();

        let result = engine.query(&QueryBundle::new("   ")).await;
        assert!(matches!(result, Err(QueryError::EmptyQuery)));
    }

    #[tokio::test]
    async fn retrieval_failures_propagate() {
        let engine =
            CitationQueryEngine::new(FailingRetriever, ListingSynthesizer, CitationOptions::default())
                .unwrap();
        let result = engine.query(&QueryBundle::new("sky")).await;
        assert!(matches!(result, Err(QueryError::Retrieval(_))));
    }

    #[test]
    fn invalid_splitter_options_fail_construction() {
        let options = CitationOptions {
            chunk_size: 4,
            chunk_overlap: 8,
            tokenizer: TokenizerKind::Whitespace,
        };
        let result = CitationQueryEngine::new(FailingRetriever, ListingSynthesizer, options);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn synthesize_relabels_given_passages() {
        let engine = CitationQueryEngine::new(
            FailingRetriever,
            ListingSynthesizer,
            CitationOptions::default(),
        )
        .unwrap();

        let response = engine
            .synthesize(
                &QueryBundle::new("anything"),
                &[Passage::new("a"), Passage::new(""), Passage::new("b")],
            )
            .await
            .unwrap();
        assert_eq!(response.response, "[1] [2]");
    }

    #[tokio::test]
    async fn end_to_end_with_llm_synthesizer() {
        let passages = vec![
            Passage::new("The sky is red in the evening."),
            Passage::new("Water is wet when the sky is red."),
            Passage::new("Bananas are yellow."),
        ];
        let predictor = Arc::new(Predictor::new(ScriptedLlm::with_responses([
            "Water is wet when the sky is red [1], which happens in the evening [2].",
        ])));
        let engine = CitationQueryEngine::new(
            InMemoryRetriever::new(passages, 2),
            CompactAndRefine::new(predictor.clone()),
            CitationOptions::default(),
        )
        .unwrap();

        let response = engine
            .query(&QueryBundle::new("When is the sky red?"))
            .await
            .unwrap();

        let cited: Vec<&str> = response
            .cited_nodes()
            .into_iter()
            .map(|node| node.source_text())
            .collect();
        assert_eq!(
            cited,
            vec![
                "Water is wet when the sky is red.",
                "The sky is red in the evening."
            ]
        );

        let prompts = predictor.llm().prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Source 1:\nWater is wet when the sky is red.\n"));
        assert!(!prompts[0].contains("Bananas"));
    }
}
