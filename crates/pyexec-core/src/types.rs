//! Core types for the pipeline

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Retry budget used when neither request nor config sets one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Unique request identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Ulid);

impl RequestId {
    /// Generate new request ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One plan step's execution request
///
/// Built once through [`ExecutionRequestBuilder`] and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    id: RequestId,
    user_query: String,
    task_objective: String,
    scope_label: String,
    approved_code: Option<String>,
    expected_results: Option<String>,
    max_attempts: u32,
    context: Option<serde_json::Value>,
}

impl ExecutionRequest {
    /// Start building a request
    pub fn builder(user_query: impl Into<String>, task_objective: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequestBuilder::new(user_query, task_objective)
    }

    /// Request id
    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Original user query
    #[inline]
    #[must_use]
    pub fn user_query(&self) -> &str {
        &self.user_query
    }

    /// Objective of this plan step
    #[inline]
    #[must_use]
    pub fn task_objective(&self) -> &str {
        &self.task_objective
    }

    /// Label used in the scope directory name
    #[inline]
    #[must_use]
    pub fn scope_label(&self) -> &str {
        &self.scope_label
    }

    /// Code approved by a human; skips generation and approval
    #[inline]
    #[must_use]
    pub fn approved_code(&self) -> Option<&str> {
        self.approved_code.as_deref()
    }

    /// Hint describing the expected `results` shape
    #[inline]
    #[must_use]
    pub fn expected_results(&self) -> Option<&str> {
        self.expected_results.as_deref()
    }

    /// Retry budget
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Input context exposed to the code as `context`
    #[inline]
    #[must_use]
    pub fn context(&self) -> Option<&serde_json::Value> {
        self.context.as_ref()
    }

    /// Derive a resume request carrying human-approved code
    #[must_use]
    pub fn approved(&self, code: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            approved_code: Some(code.into()),
            ..self.clone()
        }
    }
}

/// Builder for [`ExecutionRequest`]
#[derive(Debug, Clone)]
pub struct ExecutionRequestBuilder {
    user_query: String,
    task_objective: String,
    scope_label: Option<String>,
    approved_code: Option<String>,
    expected_results: Option<String>,
    max_attempts: u32,
    context: Option<serde_json::Value>,
}

impl ExecutionRequestBuilder {
    /// Create builder with the default budget
    pub fn new(user_query: impl Into<String>, task_objective: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            task_objective: task_objective.into(),
            scope_label: None,
            approved_code: None,
            expected_results: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            context: None,
        }
    }

    /// With scope label
    #[must_use]
    pub fn with_scope_label(mut self, label: impl Into<String>) -> Self {
        self.scope_label = Some(label.into());
        self
    }

    /// With pre-approved code
    #[must_use]
    pub fn with_approved_code(mut self, code: impl Into<String>) -> Self {
        self.approved_code = Some(code.into());
        self
    }

    /// With expected result shape
    #[must_use]
    pub fn with_expected_results(mut self, hint: impl Into<String>) -> Self {
        self.expected_results = Some(hint.into());
        self
    }

    /// With retry budget
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// With input context
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Finish the request
    #[must_use]
    pub fn build(self) -> ExecutionRequest {
        ExecutionRequest {
            id: RequestId::new(),
            scope_label: self.scope_label.unwrap_or_else(|| "execution".to_string()),
            user_query: self.user_query,
            task_objective: self.task_objective,
            approved_code: self.approved_code,
            expected_results: self.expected_results,
            max_attempts: self.max_attempts,
            context: self.context,
        }
    }
}

/// Pipeline stage where an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    /// Generator produced no candidate
    Generation,
    /// Candidate rejected before execution
    Analysis,
    /// Candidate ran and failed
    Execution,
}

impl ErrorStage {
    /// Stage name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Analysis => "analysis",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Error class (`SyntaxError`, `ZeroDivisionError`, `Timeout`, ...)
    pub error_type: String,
    /// Human-readable message
    pub message: String,
    /// Candidate that failed; absent for generation failures
    pub failed_code: Option<String>,
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Where it failed
    pub stage: ErrorStage,
}

impl ExecutionError {
    /// Create chain entry
    pub fn new(
        stage: ErrorStage,
        attempt_number: u32,
        error_type: impl Into<String>,
        message: impl Into<String>,
        failed_code: Option<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            failed_code,
            attempt_number,
            stage,
        }
    }
}

/// Append-only record of failed attempts within one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorChain {
    entries: Vec<ExecutionError>,
}

impl ErrorChain {
    /// Empty chain
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, error: ExecutionError) {
        self.entries.push(error);
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no attempt has failed yet
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry
    #[must_use]
    pub fn last(&self) -> Option<&ExecutionError> {
        self.entries.last()
    }

    /// Entries in attempt order
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionError> {
        self.entries.iter()
    }

    /// Entries as a slice
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[ExecutionError] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a ErrorChain {
    type Item = &'a ExecutionError;
    type IntoIter = std::slice::Iter<'a, ExecutionError>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// How far an attempt got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptDisposition {
    /// Generator failed
    GenerationFailed,
    /// Analyzer rejected the candidate
    Rejected,
    /// Stopped for human approval
    AwaitingApproval,
    /// Ran to success
    Succeeded,
    /// Ran and failed
    RuntimeFailure,
    /// Ran into channel limits
    SafetyViolation,
    /// Ran out of wall-clock time
    TimedOut,
}

/// Timing register entry for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// How it ended
    pub disposition: AttemptDisposition,
    /// Generation wall time
    pub generation_ms: u64,
    /// Analysis wall time
    pub analysis_ms: u64,
    /// Execution wall time, when executed
    pub execution_ms: Option<u64>,
}

impl AttemptRecord {
    /// Total wall time of the attempt
    #[must_use]
    pub fn total(&self) -> Duration {
        let ms = self
            .generation_ms
            .saturating_add(self.analysis_ms)
            .saturating_add(self.execution_ms.unwrap_or(0));
        Duration::from_millis(ms)
    }
}

/// Milliseconds, saturating
#[must_use]
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
