//! Code generation strategies
//!
//! A [`CodeGenerator`] produces the next candidate for a request given the
//! error chain so far. The trait is sealed; strategies are selected through
//! [`GeneratorKind`] and [`build_generator`].
//!
//! - [`LlmCodeGenerator`]: prompt from request and chain, completion through
//!   a caller-supplied [`CompletionClient`]
//! - [`StaticCodeGenerator`]: fixed code (user-supplied scripts)
//! - [`ScriptedCodeGenerator`]: replays a fixed sequence of replies

use crate::error::GenerationError;
use crate::types::{ErrorChain, ExecutionRequest};
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sealed trait - prevents external implementations
///
/// Crate-public for the workspace test utilities but hidden from docs.
#[doc(hidden)]
pub mod private {
    /// Sealed trait marker
    pub trait Sealed {}
}

/// Produces candidate code
#[async_trait::async_trait]
pub trait CodeGenerator: Send + Sync + private::Sealed {
    /// Strategy name for logs
    fn name(&self) -> &str;

    /// Next candidate for `request`, informed by every failure so far
    ///
    /// # Errors
    /// Returns `GenerationError` when no candidate can be produced; the
    /// pipeline records it and retries within the budget.
    async fn generate(&self, request: &ExecutionRequest, chain: &ErrorChain) -> Result<String, GenerationError>;
}

/// External LLM completion call
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete `prompt`, returning the raw reply
    ///
    /// # Errors
    /// Returns `GenerationError::Completion` on transport or provider errors.
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Plain prompt template settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    /// Instructions placed before the task
    pub preamble: String,
    /// Include failed code of previous attempts
    pub include_failed_code: bool,
    /// Truncate each previous error message to this many characters
    pub max_error_chars: usize,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            preamble: "Write a self-contained Python script for the task below. \
                The input context is available as the dict `context`. \
                Assign the final output to a dict named `results`. \
                Reply with a single ```python fenced code block."
                .to_string(),
            include_failed_code: true,
            max_error_chars: 2000,
        }
    }
}

/// Render the generation prompt
#[must_use]
pub fn build_prompt(request: &ExecutionRequest, chain: &ErrorChain, template: &PromptTemplate) -> String {
    let mut prompt = String::new();
    prompt.push_str(template.preamble.trim());
    prompt.push_str("\n\n## User query\n");
    prompt.push_str(request.user_query());
    prompt.push_str("\n\n## Task objective\n");
    prompt.push_str(request.task_objective());

    if let Some(expected) = request.expected_results() {
        prompt.push_str("\n\n## Expected results\n");
        prompt.push_str(expected);
    }

    if let Some(context) = request.context() {
        prompt.push_str("\n\n## Context keys\n");
        match context.as_object() {
            Some(map) => prompt.push_str(&map.keys().cloned().collect::<Vec<_>>().join(", ")),
            None => prompt.push_str("(context is not an object)"),
        }
    }

    if !chain.is_empty() {
        prompt.push_str("\n\n## Previous attempts failed\n");
        for error in chain {
            let message: String = error.message.chars().take(template.max_error_chars).collect();
            prompt.push_str(&format!(
                "\n### Attempt {} ({} stage): {}\n{}\n",
                error.attempt_number, error.stage, error.error_type, message
            ));
            if template.include_failed_code {
                if let Some(code) = &error.failed_code {
                    prompt.push_str("```python\n");
                    prompt.push_str(code.trim_end());
                    prompt.push_str("\n```\n");
                }
            }
        }
        prompt.push_str("\nFix the problems above in the new script.\n");
    }
    prompt
}

/// First fenced Python block of a reply, or the whole reply
///
/// Blocks tagged `python`, `py`, `python3` or untagged count as Python.
/// Returns `None` if the reply is blank or its Python blocks are all empty.
#[must_use]
pub fn extract_python_code(reply: &str) -> Option<String> {
    let mut in_block = false;
    let mut saw_block = false;
    let mut code = String::new();

    for event in Parser::new(reply) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let lang = info.split_whitespace().next().unwrap_or("");
                in_block = matches!(lang, "" | "python" | "py" | "python3");
                saw_block |= in_block;
                code.clear();
            }
            Event::Text(text) if in_block => code.push_str(&text),
            Event::End(TagEnd::CodeBlock) if in_block => {
                if !code.trim().is_empty() {
                    return Some(code);
                }
                in_block = false;
            }
            _ => {}
        }
    }

    if saw_block {
        return None;
    }
    let trimmed = reply.trim();
    (!trimmed.is_empty()).then(|| format!("{trimmed}\n"))
}

/// Strategy backed by an LLM
pub struct LlmCodeGenerator {
    client: Arc<dyn CompletionClient>,
    template: PromptTemplate,
}

impl LlmCodeGenerator {
    /// Create generator on `client`
    pub fn new(client: Arc<dyn CompletionClient>, template: PromptTemplate) -> Self {
        Self { client, template }
    }
}

impl std::fmt::Debug for LlmCodeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCodeGenerator")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl private::Sealed for LlmCodeGenerator {}

#[async_trait::async_trait]
impl CodeGenerator for LlmCodeGenerator {
    fn name(&self) -> &str {
        "llm"
    }

    async fn generate(&self, request: &ExecutionRequest, chain: &ErrorChain) -> Result<String, GenerationError> {
        let prompt = build_prompt(request, chain, &self.template);
        tracing::debug!(prompt_chars = prompt.len(), failures = chain.len(), "requesting completion");
        let reply = self.client.complete(&prompt).await?;
        extract_python_code(&reply).ok_or(GenerationError::EmptyResponse)
    }
}

/// Strategy returning the same code every time
#[derive(Debug, Clone)]
pub struct StaticCodeGenerator {
    code: String,
}

impl StaticCodeGenerator {
    /// Create generator for `code`
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl private::Sealed for StaticCodeGenerator {}

#[async_trait::async_trait]
impl CodeGenerator for StaticCodeGenerator {
    fn name(&self) -> &str {
        "static"
    }

    async fn generate(&self, _request: &ExecutionRequest, _chain: &ErrorChain) -> Result<String, GenerationError> {
        if self.code.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(self.code.clone())
    }
}

/// Strategy replaying a fixed sequence of replies
///
/// Records the chain length seen by every call.
#[derive(Debug)]
pub struct ScriptedCodeGenerator {
    steps: Mutex<VecDeque<Result<String, GenerationError>>>,
    total: usize,
    observed: Mutex<Vec<usize>>,
}

impl ScriptedCodeGenerator {
    /// Replay `steps` in order
    pub fn new(steps: impl IntoIterator<Item = Result<String, GenerationError>>) -> Self {
        let steps: VecDeque<_> = steps.into_iter().collect();
        Self {
            total: steps.len(),
            steps: Mutex::new(steps),
            observed: Mutex::new(Vec::new()),
        }
    }

    /// Replay candidates that all generate successfully
    pub fn from_candidates(candidates: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(candidates.into_iter().map(|c| Ok(c.into())))
    }

    /// Chain lengths seen by each call so far
    pub async fn observed_chain_lengths(&self) -> Vec<usize> {
        self.observed.lock().await.clone()
    }
}

impl private::Sealed for ScriptedCodeGenerator {}

#[async_trait::async_trait]
impl CodeGenerator for ScriptedCodeGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _request: &ExecutionRequest, chain: &ErrorChain) -> Result<String, GenerationError> {
        self.observed.lock().await.push(chain.len());
        self.steps
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(GenerationError::Exhausted(self.total)))
    }
}

/// Strategy selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorKind {
    /// LLM completion
    Llm {
        /// Prompt settings
        #[serde(default)]
        prompt: PromptTemplate,
    },
    /// Fixed code
    Static {
        /// Code returned on every call
        code: String,
    },
    /// Fixed sequence of candidates
    Scripted {
        /// Candidates in order
        candidates: Vec<String>,
    },
}

impl Default for GeneratorKind {
    fn default() -> Self {
        Self::Llm {
            prompt: PromptTemplate::default(),
        }
    }
}

/// Instantiate the configured strategy
///
/// # Errors
/// Returns `GenerationError::Unavailable` when the LLM strategy is selected
/// without a completion client.
pub fn build_generator(
    kind: &GeneratorKind,
    client: Option<Arc<dyn CompletionClient>>,
) -> Result<Arc<dyn CodeGenerator>, GenerationError> {
    Ok(match kind {
        GeneratorKind::Llm { prompt } => {
            let client = client.ok_or_else(|| {
                GenerationError::Unavailable("llm strategy requires a completion client".to_string())
            })?;
            Arc::new(LlmCodeGenerator::new(client, prompt.clone()))
        }
        GeneratorKind::Static { code } => Arc::new(StaticCodeGenerator::new(code.clone())),
        GeneratorKind::Scripted { candidates } => {
            Arc::new(ScriptedCodeGenerator::from_candidates(candidates.iter().cloned()))
        }
    })
}
