pub mod callbacks;
pub mod chunking;
pub mod citation;
pub mod error;
pub mod llm;
pub mod models;
pub mod predictor;
pub mod prompts;
pub mod query_engine;
pub mod question_gen;
pub mod retriever;
pub mod synthesizer;

pub use callbacks::{
    CallbackEvent, CallbackEventType, CallbackHandler, CallbackManager, EventPhase,
    EventRecorder, TracingHandler,
};
pub use chunking::{
    BpeTokenizer, CharacterTokenizer, ChunkingConfig, TextSplit, TokenTextSplitter, Tokenizer,
    WhitespaceTokenizer,
};
pub use citation::{build_citation_nodes, citation_nodes_with, format_source_label};
pub use error::{LlmError, PromptError, QueryError, SplitError};
pub use llm::{
    count_tokens, CompletionResponse, CompletionStream, EchoLlm, Llm, LlmMetadata,
    OpenAiCompatibleConfig, OpenAiCompatibleLlm, ScriptedLlm,
};
pub use models::{
    CitationNode, CitationOptions, Metadata, NodeRelationship, Passage, QueryBundle,
    Relationships, Response, TokenizerKind, DEFAULT_CITATION_CHUNK_OVERLAP,
    DEFAULT_CITATION_CHUNK_SIZE,
};
pub use predictor::{LlmPredictor, Predictor};
pub use prompts::{prompt_args, PromptArgs, PromptTemplate};
pub use query_engine::CitationQueryEngine;
pub use question_gen::{
    build_tools_text, parse_sub_questions, LlmQuestionGenerator, QuestionGenerator, SubQuestion,
    ToolMetadata,
};
pub use retriever::{InMemoryRetriever, Retriever};
pub use synthesizer::{pack_context, CompactAndRefine, ResponseSynthesizer};
