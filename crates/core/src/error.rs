use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("missing prompt variable: {0}")]
    MissingVariable(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("{provider} returned status {status}: {details}")]
    Status {
        provider: String,
        status: u16,
        details: String,
    },

    #[error("empty response from {0}")]
    EmptyResponse(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("split error: {0}")]
    Split(#[from] SplitError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("query is empty")]
    EmptyQuery,

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("could not parse program output: {0}")]
    ProgramOutput(String),

    #[error("sub-question references unknown tool: {0}")]
    UnknownTool(String),
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;
