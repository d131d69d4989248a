use crate::error::SplitError;
use crate::models::{CitationOptions, TokenizerKind};
use std::ops::Range;
use std::sync::{LazyLock, Mutex};
use tiktoken_rs::CoreBPE;
use tracing::warn;

static CL100K: LazyLock<Option<Mutex<CoreBPE>>> = LazyLock::new(|| {
    match tiktoken_rs::cl100k_base() {
        Ok(bpe) => Some(Mutex::new(bpe)),
        Err(error) => {
            warn!(%error, "cl100k_base unavailable, falling back to whitespace tokens");
            None
        }
    }
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl From<CitationOptions> for ChunkingConfig {
    fn from(value: CitationOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), SplitError> {
        if self.chunk_size == 0 {
            return Err(SplitError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(SplitError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }

        Ok(())
    }
}

/// Byte spans of the tokens a splitter counts against its size budget.
pub trait Tokenizer {
    fn token_spans(&self, text: &str) -> Vec<Range<usize>>;

    fn count(&self, text: &str) -> usize {
        self.token_spans(text).len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn token_spans(&self, text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut start = None;

        for (index, ch) in text.char_indices() {
            match (ch.is_whitespace(), start) {
                (true, Some(begin)) => {
                    spans.push(begin..index);
                    start = None;
                }
                (false, None) => start = Some(index),
                _ => {}
            }
        }

        if let Some(begin) = start {
            spans.push(begin..text.len());
        }

        spans
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CharacterTokenizer;

impl Tokenizer for CharacterTokenizer {
    fn token_spans(&self, text: &str) -> Vec<Range<usize>> {
        text.char_indices()
            .map(|(index, ch)| index..index + ch.len_utf8())
            .collect()
    }
}

/// `cl100k_base` sub-word tokens. Falls back to whitespace tokens when the
/// encoding cannot be loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct BpeTokenizer;

impl Tokenizer for BpeTokenizer {
    fn token_spans(&self, text: &str) -> Vec<Range<usize>> {
        let Some(bpe) = CL100K.as_ref().and_then(|bpe| bpe.lock().ok()) else {
            return WhitespaceTokenizer.token_spans(text);
        };

        let mut spans = Vec::new();
        let mut pending = Vec::new();
        let mut offset = 0;

        for token in bpe.encode_ordinary(text) {
            pending.push(token);
            // A multibyte char can straddle tokens; hold them until the bytes decode.
            let Ok(piece) = bpe.decode(pending.clone()) else {
                continue;
            };
            let end = offset + piece.len();
            if text.get(offset..end) != Some(piece.as_str()) {
                continue;
            }

            spans.push(offset..end);
            spans.extend(std::iter::repeat(end..end).take(pending.len() - 1));
            offset = end;
            pending.clear();
        }

        if !pending.is_empty() {
            spans.push(offset..text.len());
            spans.extend(std::iter::repeat(text.len()..text.len()).take(pending.len() - 1));
        }

        spans
    }
}

impl Tokenizer for TokenizerKind {
    fn token_spans(&self, text: &str) -> Vec<Range<usize>> {
        match self {
            TokenizerKind::Whitespace => WhitespaceTokenizer.token_spans(text),
            TokenizerKind::Character => CharacterTokenizer.token_spans(text),
            TokenizerKind::Bpe => BpeTokenizer.token_spans(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSplit {
    pub text_chunk: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub num_token_overlap: usize,
}

/// Fixed-size token windows where each window repeats the last
/// `chunk_overlap` tokens of the previous one.
#[derive(Debug, Clone)]
pub struct TokenTextSplitter<T = TokenizerKind> {
    config: ChunkingConfig,
    tokenizer: T,
}

impl TokenTextSplitter<TokenizerKind> {
    pub fn from_options(options: CitationOptions) -> Result<Self, SplitError> {
        Self::new(ChunkingConfig::from(options), options.tokenizer)
    }
}

impl<T: Tokenizer> TokenTextSplitter<T> {
    pub fn new(config: ChunkingConfig, tokenizer: T) -> Result<Self, SplitError> {
        config.validate()?;
        Ok(Self { config, tokenizer })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_text_with_overlaps(text)
            .into_iter()
            .map(|split| split.text_chunk)
            .collect()
    }

    pub fn split_text_with_overlaps(&self, text: &str) -> Vec<TextSplit> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let leading = text.len() - text.trim_start().len();
        let spans: Vec<Range<usize>> = self
            .tokenizer
            .token_spans(trimmed)
            .into_iter()
            .map(|span| span.start + leading..span.end + leading)
            .collect();
        if spans.is_empty() {
            return Vec::new();
        }

        let ChunkingConfig {
            chunk_size,
            chunk_overlap,
        } = self.config;

        if spans.len() <= chunk_size {
            return vec![TextSplit {
                text_chunk: trimmed.to_string(),
                start_offset: leading,
                end_offset: leading + trimmed.len(),
                num_token_overlap: 0,
            }];
        }

        let step = chunk_size - chunk_overlap;
        let mut splits = Vec::new();
        let mut start = 0;

        loop {
            let end = (start + chunk_size).min(spans.len());
            let window = &text[spans[start].start..spans[end - 1].end];
            let chunk = window.trim();

            // Whitespace-only windows carry nothing to cite.
            if !chunk.is_empty() {
                let start_offset = spans[start].start + (window.len() - window.trim_start().len());
                splits.push(TextSplit {
                    text_chunk: chunk.to_string(),
                    start_offset,
                    end_offset: start_offset + chunk.len(),
                    num_token_overlap: if start == 0 { 0 } else { chunk_overlap },
                });
            }

            if end == spans.len() {
                break;
            }
            start += step;
        }

        splits
    }
}
