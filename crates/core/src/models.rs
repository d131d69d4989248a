use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const DEFAULT_CITATION_CHUNK_SIZE: usize = 256;
pub const DEFAULT_CITATION_CHUNK_OVERLAP: usize = 20;

static CITATION_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").ok());

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRelationship {
    Source,
    Previous,
    Next,
    Parent,
    Child,
}

pub type Relationships = BTreeMap<NodeRelationship, String>;

/// A retrieved unit of text together with its relevance score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Passage {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub relationships: Relationships,
}

impl Passage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// One labelled chunk of a passage, numbered across the whole query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationNode {
    pub node_id: String,
    pub citation_number: usize,
    pub text: String,
    pub score: Option<f64>,
    pub metadata: Metadata,
    pub relationships: Relationships,
}

impl CitationNode {
    /// The chunk text without its `Source n:` label.
    pub fn source_text(&self) -> &str {
        let body = self
            .text
            .split_once(":\n")
            .map(|(_, body)| body)
            .unwrap_or(&self.text);
        body.strip_suffix('\n').unwrap_or(body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueryBundle {
    pub query_str: String,
}

impl QueryBundle {
    pub fn new(query_str: impl Into<String>) -> Self {
        Self {
            query_str: query_str.into(),
        }
    }

    pub fn terms(&self) -> Vec<String> {
        self.query_str
            .split_whitespace()
            .map(|token| {
                token
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|token| token.len() > 2)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Response {
    pub response: String,
    pub source_nodes: Vec<CitationNode>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Response {
    /// Distinct `[n]` markers in the answer, in order of first appearance.
    pub fn cited_sources(&self) -> Vec<usize> {
        let Some(marker) = CITATION_MARKER.as_ref() else {
            return Vec::new();
        };

        let mut cited = Vec::new();
        for capture in marker.captures_iter(&self.response) {
            for part in capture[1].split(',') {
                if let Ok(number) = part.trim().parse::<usize>() {
                    if number > 0 && !cited.contains(&number) {
                        cited.push(number);
                    }
                }
            }
        }
        cited
    }

    pub fn cited_nodes(&self) -> Vec<&CitationNode> {
        self.cited_sources()
            .into_iter()
            .filter_map(|number| {
                self.source_nodes
                    .iter()
                    .find(|node| node.citation_number == number)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    #[default]
    Whitespace,
    Character,
    Bpe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CitationOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub tokenizer: TokenizerKind,
}

impl Default for CitationOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CITATION_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CITATION_CHUNK_OVERLAP,
            tokenizer: TokenizerKind::Whitespace,
        }
    }
}
