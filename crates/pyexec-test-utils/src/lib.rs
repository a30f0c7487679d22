//! Testing utilities for the pyexec workspace
//!
//! Scripted executors, recording approval gates and request fixtures.

#![allow(missing_docs)]

use pyexec_analysis::AnalysisReport;
use pyexec_core::{
    ApprovalConfig, ApprovalDecision, ApprovalGate, ApprovalMode, CodeGenerator, ExecutionPipeline, ExecutionRequest,
    PipelineConfig,
};
use pyexec_sandbox::{CodeExecutor, ExecutionOutcome, ExecutionRecord, ExecutionScope, SandboxError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Executor that returns pre-set outcomes instead of running anything
///
/// Writes the code into the scope like the real executor so scope layout
/// assertions still hold.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: impl IntoIterator<Item = ExecutionOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Code passed to `run`, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl CodeExecutor for ScriptedExecutor {
    async fn run(
        &self,
        code: &str,
        scope: &ExecutionScope,
        _timeout: Duration,
    ) -> Result<ExecutionRecord, SandboxError> {
        scope.write_code(code).await?;
        self.executed.lock().unwrap().push(code.to_string());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| runtime_failure("ScriptedExecutor has no outcome left"));
        Ok(ExecutionRecord {
            stdout: format!("scripted run {}\n", self.run_count()),
            elapsed: Duration::from_millis(5),
            ..ExecutionRecord::from_outcome(outcome)
        })
    }
}

/// Approval gate returning a fixed decision and recording what it saw
#[derive(Debug)]
pub struct RecordingApprovalGate {
    needs_approval: bool,
    seen: Mutex<Vec<AnalysisReport>>,
}

impl RecordingApprovalGate {
    pub fn approving() -> Self {
        Self {
            needs_approval: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requiring() -> Self {
        Self {
            needs_approval: true,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn evaluations(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<AnalysisReport> {
        self.seen.lock().unwrap().clone()
    }
}

impl ApprovalGate for RecordingApprovalGate {
    fn evaluate(&self, analysis: &AnalysisReport) -> ApprovalDecision {
        self.seen.lock().unwrap().push(analysis.clone());
        if self.needs_approval {
            ApprovalDecision::require("recording gate requires approval")
        } else {
            ApprovalDecision::approve("recording gate approves")
        }
    }
}

pub fn success(pairs: &[(&str, serde_json::Value)]) -> ExecutionOutcome {
    ExecutionOutcome::Success {
        results: pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect(),
    }
}

pub fn runtime_failure(message: &str) -> ExecutionOutcome {
    ExecutionOutcome::RuntimeFailure {
        message: message.to_string(),
        exception_kind: "RuntimeError".to_string(),
    }
}

pub fn missing_results() -> ExecutionOutcome {
    ExecutionOutcome::RuntimeFailure {
        message: pyexec_sandbox::outcome::MISSING_RESULTS_MESSAGE.to_string(),
        exception_kind: "MissingResults".to_string(),
    }
}

pub fn safety_violation() -> ExecutionOutcome {
    ExecutionOutcome::SafetyViolation {
        channel_address: "SR:MAG:QF1:I".to_string(),
        value: serde_json::json!(250.0),
        violation_kind: "above_max".to_string(),
        min: Some(0.0),
        max: Some(200.0),
    }
}

pub fn timeout() -> ExecutionOutcome {
    ExecutionOutcome::Timeout {
        limit: Duration::from_secs(1),
    }
}

pub fn test_request(max_attempts: u32) -> ExecutionRequest {
    ExecutionRequest::builder("summarize the beam current", "read SR:DCCT and compute statistics")
        .with_scope_label("test")
        .with_max_attempts(max_attempts)
        .with_context(serde_json::json!({"pv": "SR:DCCT"}))
        .build()
}

/// Temporary scope directory with a pipeline config pointing into it
pub struct TestWorkspace {
    dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Config for the `mock` system with approval disabled
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_scope_dir(self.dir.path())
            .with_approval(ApprovalConfig {
                mode: ApprovalMode::Disabled,
                risk_threshold: None,
            })
    }

    /// Pipeline with a scripted executor
    pub fn pipeline(
        &self,
        config: PipelineConfig,
        generator: Arc<dyn CodeGenerator>,
        executor: Arc<ScriptedExecutor>,
    ) -> ExecutionPipeline {
        ExecutionPipeline::new(config, generator)
            .unwrap()
            .with_executor(executor)
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
