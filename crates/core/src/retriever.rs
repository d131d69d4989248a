use crate::error::QueryError;
use crate::models::{Passage, QueryBundle};
use async_trait::async_trait;

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Passage>, QueryError>;
}

/// Ranks a fixed set of passages by the share of query terms they contain.
#[derive(Debug, Clone)]
pub struct InMemoryRetriever {
    passages: Vec<Passage>,
    top_k: usize,
}

impl InMemoryRetriever {
    pub fn new(passages: Vec<Passage>, top_k: usize) -> Self {
        Self { passages, top_k }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Passage>, QueryError> {
        let terms = query.terms();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Passage> = self
            .passages
            .iter()
            .filter_map(|passage| {
                let score = term_overlap(&passage.text, &terms);
                (score > 0.0).then(|| passage.clone().with_score(score))
            })
            .collect();

        scored.sort_by(|left, right| {
            right
                .score
                .unwrap_or_default()
                .total_cmp(&left.score.unwrap_or_default())
        });
        scored.truncate(self.top_k);
        Ok(scored)
    }
}

fn term_overlap(text: &str, terms: &[String]) -> f64 {
    let lowered = text.to_lowercase();
    let matched = terms
        .iter()
        .filter(|term| lowered.contains(term.as_str()))
        .count();
    matched as f64 / terms.len() as f64
}
