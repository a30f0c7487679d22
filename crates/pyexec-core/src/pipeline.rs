//! Execution pipeline
//!
//! `generate -> analyze -> approve -> execute -> classify -> decide`, one
//! attempt at a time, inside a single [`ExecutionScope`] per request.

use crate::approval::{ApprovalGate, PolicyApprovalGate};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::generator::{build_generator, CodeGenerator, CompletionClient};
use crate::notebook::write_attempt_notebook;
use crate::retry::{AttemptState, FailureReason, RetryCoordinator};
use crate::types::{
    duration_ms, AttemptDisposition, AttemptRecord, ErrorChain, ErrorStage, ExecutionError, ExecutionRequest,
    ExecutionRequestBuilder,
};
use pyexec_analysis::{AnalysisReport, AnalysisVerdict, StaticAnalyzer};
use pyexec_sandbox::{
    CodeExecutor, ExecutionOutcome, ExecutionScope, Executor, ScopeStatus, ScopeSummary,
};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Terminal result of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Code ran and produced `results`
    Succeeded {
        /// The `results` mapping
        results: serde_json::Map<String, serde_json::Value>,
        /// Files under `artifacts/`, relative to the scope directory
        artifacts: Vec<PathBuf>,
        /// Scope directory after retention; `None` if deleted
        scope_path: Option<PathBuf>,
        /// Attempts made
        attempts: u32,
        /// Failures before the success
        error_chain: ErrorChain,
        /// Per-attempt timings
        records: Vec<AttemptRecord>,
    },
    /// Budget exhausted or safety violation
    Failed {
        /// Why
        reason: FailureReason,
        /// Every recorded failure
        error_chain: ErrorChain,
        /// Scope directory after retention; `None` if deleted
        scope_path: Option<PathBuf>,
        /// Attempts made
        attempts: u32,
        /// Per-attempt timings
        records: Vec<AttemptRecord>,
    },
    /// Candidate needs human approval before it may run
    AwaitingApproval {
        /// Candidate awaiting approval
        code: String,
        /// Its analysis
        analysis: Box<AnalysisReport>,
        /// Why approval is needed
        reasoning: String,
        /// Scope directory; `None` if deleted
        scope_path: Option<PathBuf>,
        /// Attempts made, including the pending one
        attempts: u32,
        /// Failures before this candidate
        error_chain: ErrorChain,
        /// Per-attempt timings
        records: Vec<AttemptRecord>,
    },
}

impl PipelineOutcome {
    /// Whether the request succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Attempts made
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::AwaitingApproval { attempts, .. } => *attempts,
        }
    }

    /// Recorded failures
    #[must_use]
    pub fn error_chain(&self) -> &ErrorChain {
        match self {
            Self::Succeeded { error_chain, .. }
            | Self::Failed { error_chain, .. }
            | Self::AwaitingApproval { error_chain, .. } => error_chain,
        }
    }

    /// Per-attempt timings
    #[must_use]
    pub fn records(&self) -> &[AttemptRecord] {
        match self {
            Self::Succeeded { records, .. }
            | Self::Failed { records, .. }
            | Self::AwaitingApproval { records, .. } => records,
        }
    }

    /// Terminal failure reason, rendered
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Failed { reason, .. } => Some(reason.to_string()),
            _ => None,
        }
    }
}

fn disposition(outcome: &ExecutionOutcome) -> AttemptDisposition {
    match outcome {
        ExecutionOutcome::Success { .. } => AttemptDisposition::Succeeded,
        ExecutionOutcome::RuntimeFailure { .. } => AttemptDisposition::RuntimeFailure,
        ExecutionOutcome::SafetyViolation { .. } => AttemptDisposition::SafetyViolation,
        ExecutionOutcome::Timeout { .. } => AttemptDisposition::TimedOut,
    }
}

/// Attempt bookkeeping shared between the attempt loop and its caller
#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    chain: ErrorChain,
    records: Vec<AttemptRecord>,
}

/// How the attempt loop ended
enum Terminal {
    Succeeded(serde_json::Map<String, serde_json::Value>),
    Failed(FailureReason),
    AwaitingApproval {
        code: String,
        analysis: Box<AnalysisReport>,
        reasoning: String,
    },
}

/// Pipeline over one configuration
pub struct ExecutionPipeline {
    config: PipelineConfig,
    analyzer: StaticAnalyzer,
    generator: Arc<dyn CodeGenerator>,
    gate: Arc<dyn ApprovalGate>,
    executor: Arc<dyn CodeExecutor>,
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("config", &self.config)
            .field("generator", &self.generator.name())
            .finish_non_exhaustive()
    }
}

impl ExecutionPipeline {
    /// Create pipeline with `generator`; everything else from `config`
    ///
    /// # Errors
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig, generator: Arc<dyn CodeGenerator>) -> Result<Self, PipelineError> {
        config.validate()?;
        let analyzer = StaticAnalyzer::new(&config.analysis)?;
        let backend = config
            .execution
            .backend
            .build(&config.execution.env_allowlist)?;
        Ok(Self {
            gate: Arc::new(PolicyApprovalGate::new(config.approval)),
            executor: Arc::new(Executor::new(backend)),
            analyzer,
            generator,
            config,
        })
    }

    /// Create pipeline with the configured generation strategy
    ///
    /// # Errors
    /// Returns `PipelineError::Config` if the strategy cannot be built or
    /// the configuration is invalid.
    pub fn from_config(
        config: PipelineConfig,
        client: Option<Arc<dyn CompletionClient>>,
    ) -> Result<Self, PipelineError> {
        let generator = build_generator(&config.generator, client)
            .map_err(|e| ConfigError::invalid("generator.kind", e.to_string()))?;
        Self::new(config, generator)
    }

    /// Replace the executor
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replace the approval gate
    #[must_use]
    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Analyzer used for every candidate
    #[inline]
    #[must_use]
    pub fn analyzer(&self) -> &StaticAnalyzer {
        &self.analyzer
    }

    /// Request builder seeded with the configured retry budget
    pub fn request(&self, user_query: impl Into<String>, task_objective: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequest::builder(user_query, task_objective).with_max_attempts(self.config.retry.default_max_attempts)
    }

    /// Run `request` to a terminal outcome, or stop when `cancel` resolves
    ///
    /// Dropping the in-flight attempt kills its interpreter process. A
    /// cancelled scope is finished with status `cancelled` and the configured
    /// retention applied.
    ///
    /// # Errors
    /// Returns `PipelineError::Cancelled` if `cancel` wins, otherwise as
    /// [`Self::execute`].
    #[tracing::instrument(
        skip(self, request, cancel),
        fields(request = %request.id(), max_attempts = request.max_attempts(), generator = self.generator.name())
    )]
    pub async fn execute_until<F>(&self, request: &ExecutionRequest, cancel: F) -> Result<PipelineOutcome, PipelineError>
    where
        F: Future<Output = ()> + Send,
    {
        if request.approved_code().is_some_and(|c| c.trim().is_empty()) {
            return Err(PipelineError::InvalidRequest("approved code is empty".to_string()));
        }
        let scope = ExecutionScope::create(&self.config.scope.base_dir, request.scope_label()).await?;
        let request_meta = serde_json::json!({
            "id": request.id().to_string(),
            "user_query": request.user_query(),
            "task_objective": request.task_objective(),
            "expected_results": request.expected_results(),
            "max_attempts": request.max_attempts(),
        });
        let context = request.context().cloned().unwrap_or_else(|| serde_json::json!({}));
        scope.write_context(&context, &request_meta).await?;

        let mut progress = Progress::default();
        let terminal = tokio::select! {
            biased;
            () = cancel => None,
            terminal = self.run_attempts(request, &scope, &mut progress) => Some(terminal?),
        };

        let Some(terminal) = terminal else {
            tracing::warn!(attempts = progress.attempts, "request cancelled");
            let summary = ScopeSummary::new(
                ScopeStatus::Cancelled,
                progress.attempts,
                Some("cancelled by caller".to_string()),
            );
            scope.finish(&summary, self.config.scope.retention).await?;
            return Err(PipelineError::Cancelled);
        };
        self.conclude(scope, terminal, progress).await
    }

    /// Run `request` to a terminal outcome
    ///
    /// # Errors
    /// Returns `PipelineError` only for infrastructure failures (scope I/O,
    /// interpreter spawn, unreadable report). Failures of the generated code
    /// are reported through [`PipelineOutcome`].
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<PipelineOutcome, PipelineError> {
        self.execute_until(request, std::future::pending()).await
    }

    /// Attempt loop; `progress` stays readable if this future is dropped
    async fn run_attempts(
        &self,
        request: &ExecutionRequest,
        scope: &ExecutionScope,
        progress: &mut Progress,
    ) -> Result<Terminal, PipelineError> {
        let coordinator = RetryCoordinator::new(request.max_attempts());
        let timeout = self.config.execution.timeout();
        let mut state = AttemptState::Attempting(1);

        loop {
            let attempt = match state {
                AttemptState::Attempting(n) => n,
                AttemptState::Succeeded(results) => return Ok(Terminal::Succeeded(results)),
                AttemptState::Failed(reason) => return Ok(Terminal::Failed(reason)),
            };
            progress.attempts = attempt;
            debug_assert_eq!(progress.chain.len(), (attempt - 1) as usize);
            tracing::info!(attempt, "attempt started");

            let started = Instant::now();
            let preapproved = attempt == 1 && request.approved_code().is_some();
            let generated = match request.approved_code().filter(|_| preapproved) {
                Some(code) => Ok(code.to_string()),
                None => self.generator.generate(request, &progress.chain).await,
            };
            let generation_ms = duration_ms(started.elapsed());

            let code = match generated {
                Ok(code) => code,
                Err(e) => {
                    progress.records.push(AttemptRecord {
                        attempt_number: attempt,
                        disposition: AttemptDisposition::GenerationFailed,
                        generation_ms,
                        analysis_ms: 0,
                        execution_ms: None,
                    });
                    state = coordinator.record_failure(
                        ExecutionError::new(ErrorStage::Generation, attempt, e.type_name(), e.to_string(), None),
                        &mut progress.chain,
                    );
                    continue;
                }
            };
            scope.snapshot_attempt(attempt, &code).await?;

            let started = Instant::now();
            let analysis = self.analyzer.analyze_full(&code);
            let analysis_ms = duration_ms(started.elapsed());

            if let AnalysisVerdict::Rejected { error_type, reason } = &analysis.verdict {
                progress.records.push(AttemptRecord {
                    attempt_number: attempt,
                    disposition: AttemptDisposition::Rejected,
                    generation_ms,
                    analysis_ms,
                    execution_ms: None,
                });
                state = coordinator.record_failure(
                    ExecutionError::new(ErrorStage::Analysis, attempt, error_type.clone(), reason.clone(), Some(code)),
                    &mut progress.chain,
                );
                continue;
            }

            if !preapproved {
                let decision = self.gate.evaluate(&analysis);
                if decision.needs_approval {
                    tracing::warn!(attempt, reasoning = %decision.reasoning, "execution deferred for approval");
                    progress.records.push(AttemptRecord {
                        attempt_number: attempt,
                        disposition: AttemptDisposition::AwaitingApproval,
                        generation_ms,
                        analysis_ms,
                        execution_ms: None,
                    });
                    return Ok(Terminal::AwaitingApproval {
                        code,
                        analysis: Box::new(analysis),
                        reasoning: decision.reasoning,
                    });
                }
            }

            let record = self.executor.run(&code, scope, timeout).await?;
            scope
                .save_attempt_output(attempt, &record.stdout, &record.stderr)
                .await?;
            if self.config.scope.write_notebooks {
                write_attempt_notebook(scope, request, attempt, &code, &record).await?;
            }
            progress.records.push(AttemptRecord {
                attempt_number: attempt,
                disposition: disposition(&record.outcome),
                generation_ms,
                analysis_ms,
                execution_ms: Some(duration_ms(record.elapsed)),
            });

            state = coordinator.decide(attempt, record.outcome, &code, &mut progress.chain);
        }
    }

    /// Finish the scope and build the outcome
    async fn conclude(
        &self,
        scope: ExecutionScope,
        terminal: Terminal,
        progress: Progress,
    ) -> Result<PipelineOutcome, PipelineError> {
        let Progress {
            attempts,
            chain,
            records,
        } = progress;
        let retention = self.config.scope.retention;

        match terminal {
            Terminal::Succeeded(results) => {
                let artifacts = scope
                    .list_artifacts()
                    .await?
                    .into_iter()
                    .filter_map(|p| p.strip_prefix(scope.root()).ok().map(PathBuf::from))
                    .collect();
                tracing::info!(attempts, failures = chain.len(), "request succeeded");
                let summary = ScopeSummary::new(ScopeStatus::Succeeded, attempts, None);
                let scope_path = scope.finish(&summary, retention).await?;
                Ok(PipelineOutcome::Succeeded {
                    results,
                    artifacts,
                    scope_path,
                    attempts,
                    error_chain: chain,
                    records,
                })
            }
            Terminal::Failed(reason) => {
                tracing::info!(attempts, %reason, "request failed");
                let summary = ScopeSummary::new(ScopeStatus::Failed, attempts, Some(reason.to_string()));
                let scope_path = scope.finish(&summary, retention).await?;
                Ok(PipelineOutcome::Failed {
                    reason,
                    error_chain: chain,
                    scope_path,
                    attempts,
                    records,
                })
            }
            Terminal::AwaitingApproval {
                code,
                analysis,
                reasoning,
            } => {
                let summary = ScopeSummary::new(ScopeStatus::AwaitingApproval, attempts, Some(reasoning.clone()));
                let scope_path = scope.finish(&summary, retention).await?;
                Ok(PipelineOutcome::AwaitingApproval {
                    code,
                    analysis,
                    reasoning,
                    scope_path,
                    attempts,
                    error_chain: chain,
                    records,
                })
            }
        }
    }
}
