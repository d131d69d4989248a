use anyhow::Context;
use chrono::Utc;
use citation_engine_core::llm::{DEFAULT_CONTEXT_WINDOW, DEFAULT_NUM_OUTPUT};
use citation_engine_core::{
    build_citation_nodes, CallbackHandler, CallbackManager, CitationOptions, CitationQueryEngine,
    CompactAndRefine, EchoLlm, InMemoryRetriever, Llm, LlmMetadata, LlmQuestionGenerator,
    OpenAiCompatibleConfig, OpenAiCompatibleLlm, Passage, Predictor, QueryBundle,
    QuestionGenerator, ToolMetadata, TokenizerKind, TracingHandler,
    DEFAULT_CITATION_CHUNK_OVERLAP, DEFAULT_CITATION_CHUNK_SIZE,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "citation-engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Tokens per citation source
    #[arg(long, env = "CITATION_CHUNK_SIZE", default_value_t = DEFAULT_CITATION_CHUNK_SIZE)]
    chunk_size: usize,

    /// Tokens shared by neighbouring sources of one passage
    #[arg(long, env = "CITATION_CHUNK_OVERLAP", default_value_t = DEFAULT_CITATION_CHUNK_OVERLAP)]
    chunk_overlap: usize,

    /// Token granularity used for chunking
    #[arg(long, value_enum, default_value_t = TokenizerArg::Whitespace)]
    tokenizer: TokenizerArg,

    /// Base URL of an OpenAI-compatible completions server; without it prompts are echoed
    #[arg(long, env = "LLM_ENDPOINT")]
    llm_endpoint: Option<String>,

    /// Model name sent to the completions server
    #[arg(long, env = "LLM_MODEL", default_value = "gpt-3.5-turbo-instruct")]
    llm_model: String,

    /// Bearer token for the completions server
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Model context window in tokens
    #[arg(long, default_value_t = DEFAULT_CONTEXT_WINDOW)]
    context_window: usize,

    /// Tokens reserved for the model's answer
    #[arg(long, default_value_t = DEFAULT_NUM_OUTPUT)]
    num_output: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TokenizerArg {
    Whitespace,
    Character,
    Bpe,
}

impl From<TokenizerArg> for TokenizerKind {
    fn from(value: TokenizerArg) -> Self {
        match value {
            TokenizerArg::Whitespace => TokenizerKind::Whitespace,
            TokenizerArg::Character => TokenizerKind::Character,
            TokenizerArg::Bpe => TokenizerKind::Bpe,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Split passages into numbered citation sources.
    Cite {
        /// JSON file holding an array of passages.
        #[arg(long)]
        passages: PathBuf,
        /// Print the sources as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Answer a query from a passage file with cited sources.
    Query {
        /// JSON file holding an array of passages.
        #[arg(long)]
        passages: PathBuf,
        /// Query text
        #[arg(long)]
        query: String,
        /// Number of passages to retrieve.
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
    /// Split a query into sub-questions routed to tools.
    SubQuestions {
        /// JSON file holding an array of {name, description} tools.
        #[arg(long)]
        tools: PathBuf,
        /// Query text
        #[arg(long)]
        query: String,
        /// Log each generated sub-question.
        #[arg(long, default_value_t = false)]
        verbose: bool,
    },
}

impl Cli {
    fn citation_options(&self) -> CitationOptions {
        CitationOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            tokenizer: self.tokenizer.into(),
        }
    }

    fn build_llm(&self) -> anyhow::Result<Box<dyn Llm>> {
        match &self.llm_endpoint {
            Some(endpoint) => {
                let llm = OpenAiCompatibleLlm::new(OpenAiCompatibleConfig {
                    endpoint: endpoint.clone(),
                    model: self.llm_model.clone(),
                    api_key: self.llm_api_key.clone(),
                    context_window: self.context_window,
                    num_output: self.num_output,
                    ..OpenAiCompatibleConfig::default()
                })
                .with_context(|| format!("invalid llm endpoint {endpoint}"))?;
                Ok(Box::new(llm))
            }
            None => {
                warn!("no llm endpoint configured, echoing prompts");
                Ok(Box::new(EchoLlm {
                    metadata: LlmMetadata {
                        context_window: self.context_window,
                        num_output: self.num_output,
                        model_name: "echo".to_string(),
                    },
                }))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = cli.citation_options();
    let handlers: Vec<Arc<dyn CallbackHandler>> = vec![Arc::new(TracingHandler)];
    let callback_manager = CallbackManager::new(handlers);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        chunk_size = options.chunk_size,
        chunk_overlap = options.chunk_overlap,
        "citation-engine boot"
    );

    match &cli.command {
        Command::Cite { passages, json } => {
            let passages = load_passages(passages).await?;
            let nodes = build_citation_nodes(&passages, options)?;
            info!(passages = passages.len(), sources = nodes.len(), "citation sources built");

            if *json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                for node in &nodes {
                    print!("{}", node.text);
                }
            }
        }
        Command::Query {
            passages,
            query,
            top_k,
        } => {
            let passages = load_passages(passages).await?;
            let predictor = Predictor::new(cli.build_llm()?)
                .with_callback_manager(callback_manager.clone());
            let synthesizer =
                CompactAndRefine::new(predictor).with_callback_manager(callback_manager.clone());
            let engine = CitationQueryEngine::new(
                InMemoryRetriever::new(passages, *top_k),
                synthesizer,
                options,
            )?
            .with_callback_manager(callback_manager);

            let response = engine.query(&QueryBundle::new(query.as_str())).await?;

            println!("query: {query}");
            println!("answer:\n{}", response.response);
            for node in response.cited_nodes() {
                let score = node.score.unwrap_or_default();
                println!(
                    "[{}] score={score:.4} {}",
                    node.citation_number,
                    node.source_text()
                );
                if let Some(Value::String(file_name)) = node.metadata.get("file_name") {
                    println!("  source={file_name}");
                }
            }
        }
        Command::SubQuestions {
            tools,
            query,
            verbose,
        } => {
            let tools: Vec<ToolMetadata> = load_json(tools).await?;
            let predictor = Predictor::new(cli.build_llm()?)
                .with_callback_manager(callback_manager.clone());
            let generator = LlmQuestionGenerator::new(predictor)
                .verbose(*verbose)
                .with_callback_manager(callback_manager);

            let sub_questions = generator
                .generate(&tools, &QueryBundle::new(query.as_str()))
                .await?;
            for item in sub_questions {
                println!("{}: {}", item.tool_name, item.sub_question);
            }
        }
    }

    Ok(())
}

async fn load_passages(path: &Path) -> anyhow::Result<Vec<Passage>> {
    let passages: Vec<Passage> = load_json(path).await?;
    if passages.is_empty() {
        warn!(path = %path.display(), "passage file is empty");
    }
    Ok(passages)
}

async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn chunking_flags_reach_citation_options() {
        let cli = Cli::parse_from([
            "citation-engine",
            "--chunk-size",
            "64",
            "--chunk-overlap",
            "8",
            "--tokenizer",
            "character",
            "cite",
            "--passages",
            "passages.json",
        ]);

        let options = cli.citation_options();
        assert_eq!(options.chunk_size, 64);
        assert_eq!(options.chunk_overlap, 8);
        assert_eq!(options.tokenizer, TokenizerKind::Character);

        let cli = Cli::parse_from([
            "citation-engine",
            "--tokenizer",
            "bpe",
            "cite",
            "--passages",
            "passages.json",
        ]);
        assert_eq!(cli.citation_options().tokenizer, TokenizerKind::Bpe);
    }

    #[tokio::test]
    async fn passages_load_from_json_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("passages.json");
        fs::write(
            &path,
            r#"[{"text": "The sky is red.", "score": 0.9, "metadata": {"file_name": "sky.txt"}}, {"score": 0.1}]"#,
        )?;

        let passages = load_passages(&path).await?;
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].metadata["file_name"], "sky.txt");
        assert_eq!(passages[1].text, "");

        let nodes = build_citation_nodes(&passages, CitationOptions::default())?;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].text, "Source 1:\nThe sky is red.\n");
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = load_passages(&dir.path().join("absent.json")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echo_model_answers_with_the_citation_prompt() -> Result<(), Box<dyn std::error::Error>>
    {
        let cli = Cli::parse_from(["citation-engine", "cite", "--passages", "unused.json"]);
        let predictor = Predictor::new(cli.build_llm()?);
        let engine = CitationQueryEngine::new(
            InMemoryRetriever::new(vec![Passage::new("Water is wet.")], 3),
            CompactAndRefine::new(predictor),
            cli.citation_options(),
        )?;

        let response = engine.query(&QueryBundle::new("Is water wet?")).await?;
        assert!(response.response.contains("Source 1:\nWater is wet.\n"));
        assert!(response.response.contains("Query: Is water wet?"));
        Ok(())
    }
}
