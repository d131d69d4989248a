use crate::chunking::{TokenTextSplitter, Tokenizer};
use crate::error::SplitError;
use crate::models::{CitationNode, CitationOptions, Passage};
use sha2::{Digest, Sha256};

pub fn format_source_label(citation_number: usize, chunk: &str) -> String {
    format!("Source {citation_number}:\n{}\n", chunk.trim())
}

/// Splits every passage and numbers the chunks `Source 1..=n` across the
/// whole input, in passage order then chunk order.
pub fn build_citation_nodes(
    passages: &[Passage],
    options: CitationOptions,
) -> Result<Vec<CitationNode>, SplitError> {
    let splitter = TokenTextSplitter::from_options(options)?;
    Ok(citation_nodes_with(&splitter, passages))
}

pub fn citation_nodes_with<T: Tokenizer>(
    splitter: &TokenTextSplitter<T>,
    passages: &[Passage],
) -> Vec<CitationNode> {
    passages.iter().fold(Vec::new(), |mut nodes, passage| {
        for split in splitter.split_text_with_overlaps(&passage.text) {
            let citation_number = nodes.len() + 1;
            let text = format_source_label(citation_number, &split.text_chunk);

            nodes.push(CitationNode {
                node_id: make_node_id(&passage.node_id, citation_number, &text),
                citation_number,
                text,
                score: passage.score,
                metadata: passage.metadata.clone(),
                relationships: passage.relationships.clone(),
            });
        }
        nodes
    })
}

fn make_node_id(passage_id: &str, citation_number: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passage_id.as_bytes());
    hasher.update((citation_number as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
