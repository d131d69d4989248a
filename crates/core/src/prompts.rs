use crate::error::PromptError;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type PromptArgs = BTreeMap<String, String>;

const PLACEHOLDER_REGEX: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)\}";

pub const CITATION_QA_TEMPLATE: &str = concat!(
    "Please provide an answer based only on the given sources. ",
    "When referencing information from a source, cite the appropriate source(s). ",
    "For example:\n",
    "Source 1:\n",
    "The sky is red.\n",
    "Source 2:\n",
    "Water is wet.\n",
    "Query: What color is the sky?\n",
    "Answer: The sky is red [1].\n",
    "Now it's your turn. Below are several numbered sources of information:",
    "\n------\n",
    "{context_str}",
    "\n------\n",
    "Query: {query_str}\n",
    "Answer: "
);

pub const CITATION_REFINE_TEMPLATE: &str = concat!(
    "Please provide an answer based only on the given sources. ",
    "When referencing information from a source, cite the appropriate source(s). ",
    "For example:\n",
    "Source 1:\n",
    "The sky is red.\n",
    "Source 2:\n",
    "Water is wet.\n",
    "Query: What color is the sky?\n",
    "Answer: The sky is red [1].\n",
    "Now it's your turn. ",
    "We have provided an existing answer: {existing_answer}\n",
    "Below are several numbered sources of information. ",
    "Use them to refine the existing answer. ",
    "If the provided sources are not helpful, repeat the existing answer.\n",
    "Begin!",
    "\n------\n",
    "{context_msg}",
    "\n------\n",
    "Query: {query_str}\n",
    "Answer: "
);

pub const SUB_QUESTION_TEMPLATE: &str = concat!(
    "Given a user question and a list of tools, output a list of relevant sub-questions ",
    "that, when answered together, fully answer the user question. ",
    "Each sub-question must name exactly one of the provided tools.\n\n",
    "# Example\n",
    "<Tools>\n",
    "```json\n",
    "{\n",
    "    \"uber_10k\": \"Provides information about Uber financials for year 2021\",\n",
    "    \"lyft_10k\": \"Provides information about Lyft financials for year 2021\"\n",
    "}\n",
    "```\n\n",
    "<User Question>\n",
    "Compare and contrast the revenue growth and EBITDA of Uber and Lyft for year 2021\n\n",
    "<Output>\n",
    "```json\n",
    "[\n",
    "    {\"sub_question\": \"What is the revenue growth of Uber\", \"tool_name\": \"uber_10k\"},\n",
    "    {\"sub_question\": \"What is the EBITDA of Uber\", \"tool_name\": \"uber_10k\"},\n",
    "    {\"sub_question\": \"What is the revenue growth of Lyft\", \"tool_name\": \"lyft_10k\"},\n",
    "    {\"sub_question\": \"What is the EBITDA of Lyft\", \"tool_name\": \"lyft_10k\"}\n",
    "]\n",
    "```\n\n",
    "# Your turn\n",
    "<Tools>\n",
    "```json\n",
    "{tools_str}\n",
    "```\n\n",
    "<User Question>\n",
    "{query_str}\n\n",
    "<Output>\n"
);

/// A prompt with `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn citation_qa() -> Self {
        Self::new(CITATION_QA_TEMPLATE)
    }

    pub fn citation_refine() -> Self {
        Self::new(CITATION_REFINE_TEMPLATE)
    }

    pub fn sub_question() -> Self {
        Self::new(SUB_QUESTION_TEMPLATE)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn variables(&self) -> Result<Vec<String>, PromptError> {
        let placeholder = Regex::new(PLACEHOLDER_REGEX)?;
        let mut variables = Vec::new();
        for capture in placeholder.captures_iter(&self.template) {
            let name = capture[1].to_string();
            if !variables.contains(&name) {
                variables.push(name);
            }
        }
        Ok(variables)
    }

    pub fn format(&self, args: &PromptArgs) -> Result<String, PromptError> {
        if let Some(missing) = self
            .variables()?
            .into_iter()
            .find(|name| !args.contains_key(name))
        {
            return Err(PromptError::MissingVariable(missing));
        }

        let placeholder = Regex::new(PLACEHOLDER_REGEX)?;
        let formatted = placeholder.replace_all(&self.template, |capture: &Captures| {
            args.get(&capture[1]).cloned().unwrap_or_default()
        });
        Ok(formatted.into_owned())
    }

    /// Formats with every variable bound to an empty string; used to size
    /// the fixed part of a prompt.
    pub fn format_empty(&self) -> Result<String, PromptError> {
        let args = self
            .variables()?
            .into_iter()
            .map(|name| (name, String::new()))
            .collect();
        self.format(&args)
    }
}

pub fn prompt_args<K, V, I>(pairs: I) -> PromptArgs
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}
