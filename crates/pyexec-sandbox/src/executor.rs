//! Executor
//!
//! Writes a candidate into its scope, runs it on a backend and classifies
//! the result. Exactly one [`ExecutionOutcome`] per call.

use crate::backend::ExecutionBackend;
use crate::error::SandboxError;
use crate::outcome::{classify, ExecutionOutcome};
use crate::runner::{RunnerReport, RUNNER_SOURCE};
use crate::scope::ExecutionScope;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    /// Classified outcome
    pub outcome: ExecutionOutcome,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall-clock duration
    pub elapsed: Duration,
    /// Figures saved by the runner, absolute paths
    pub figures: Vec<PathBuf>,
}

impl ExecutionRecord {
    /// Record with an outcome and no captured output
    #[must_use]
    pub fn from_outcome(outcome: ExecutionOutcome) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            figures: Vec::new(),
        }
    }
}

/// Executes one candidate inside a scope
///
/// Implement this trait to substitute execution in tests.
#[async_trait::async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Run `code` in `scope`
    ///
    /// # Errors
    /// Returns `SandboxError` only for infrastructure failures; failures of
    /// the code itself are reported through the outcome.
    async fn run(
        &self,
        code: &str,
        scope: &ExecutionScope,
        timeout: Duration,
    ) -> Result<ExecutionRecord, SandboxError>;
}

/// Backend-driven executor
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn ExecutionBackend>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Executor {
    /// Create executor on `backend`
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }

    /// Backend name
    #[inline]
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    async fn read_report(scope: &ExecutionScope) -> Result<Option<RunnerReport>, SandboxError> {
        let path = scope.report_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SandboxError::io_error(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SandboxError::MalformedReport { path, source })
    }
}

#[async_trait::async_trait]
impl CodeExecutor for Executor {
    #[tracing::instrument(skip(self, code, scope), fields(scope = %scope.id(), backend = self.backend.name()))]
    async fn run(
        &self,
        code: &str,
        scope: &ExecutionScope,
        timeout: Duration,
    ) -> Result<ExecutionRecord, SandboxError> {
        scope.write_code(code).await?;
        scope.write_runner(RUNNER_SOURCE).await?;
        scope.clear_report().await?;

        let process = self.backend.run(scope, timeout).await?;
        let report = if process.timed_out {
            None
        } else {
            Self::read_report(scope).await?
        };

        let figures = report
            .as_ref()
            .map(|r| r.figures.iter().map(|f| scope.root().join(f)).collect())
            .unwrap_or_default();
        let outcome = classify(report, &process, timeout);
        tracing::info!(
            outcome = outcome.kind(),
            elapsed_ms = u64::try_from(process.elapsed.as_millis()).unwrap_or(u64::MAX),
            "execution finished"
        );

        Ok(ExecutionRecord {
            outcome,
            stdout: process.stdout,
            stderr: process.stderr,
            elapsed: process.elapsed,
            figures,
        })
    }
}
