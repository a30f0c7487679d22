//! End-to-end pipeline behavior with scripted generation and execution

use pyexec_core::{
    ApprovalConfig, ApprovalMode, ErrorStage, GenerationError, PipelineError, PipelineOutcome,
    ScriptedCodeGenerator,
};
use pyexec_sandbox::scope::{ARTIFACTS_DIR, ATTEMPTS_DIR, CONTEXT_FILE, METADATA_FILE};
use pyexec_sandbox::ScopeRetention;
use pyexec_test_utils::{
    missing_results, runtime_failure, safety_violation, success, test_request, timeout, RecordingApprovalGate,
    ScriptedExecutor, TestWorkspace,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::test]
async fn missing_results_then_success() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates([
        "x = 1",
        "results = {'mean': 1.0}",
    ]));
    let executor = Arc::new(ScriptedExecutor::new([
        missing_results(),
        success(&[("mean", serde_json::json!(1.0))]),
    ]));
    let pipeline = ws.pipeline(ws.config(), generator.clone(), executor.clone());

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    let PipelineOutcome::Succeeded {
        results,
        artifacts,
        scope_path,
        attempts,
        error_chain,
        records,
    } = outcome
    else {
        panic!("expected success");
    };
    let expected: serde_json::Map<_, _> = [("mean".to_string(), serde_json::json!(1.0))].into_iter().collect();
    assert_eq!(results, expected);
    assert_eq!(attempts, 2);
    assert_eq!(records.len(), 2);
    assert_eq!(error_chain.len(), 1);
    let first = &error_chain.entries()[0];
    assert_eq!(first.stage, ErrorStage::Execution);
    assert_eq!(first.error_type, "MissingResults");
    assert_eq!(first.failed_code.as_deref(), Some("x = 1"));

    assert_eq!(generator.observed_chain_lengths().await, vec![0, 1]);
    assert_eq!(executor.executed(), vec!["x = 1", "results = {'mean': 1.0}"]);
    assert_eq!(
        artifacts,
        vec![
            PathBuf::from(ARTIFACTS_DIR).join("attempt_01.ipynb"),
            PathBuf::from(ARTIFACTS_DIR).join("attempt_02.ipynb"),
        ]
    );

    let root = scope_path.unwrap();
    assert!(root.join(METADATA_FILE).exists());
    assert!(root.join(ATTEMPTS_DIR).join("attempt_01.py").exists());
    assert!(root.join(ATTEMPTS_DIR).join("attempt_02.stdout.txt").exists());
    let context: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join(CONTEXT_FILE)).unwrap()).unwrap();
    assert_eq!(context["context"]["pv"], "SR:DCCT");
}

#[tokio::test]
async fn safety_violation_stops_immediately() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates([
        "write_channel('SR:MAG:QF1:I', 250)\nresults = {}",
        "results = {}",
    ]));
    let executor = Arc::new(ScriptedExecutor::new([safety_violation(), success(&[])]));
    let pipeline = ws.pipeline(ws.config(), generator.clone(), executor.clone());

    let outcome = pipeline.execute(&test_request(5)).await.unwrap();

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts(), 1);
    assert!(outcome.error_chain().is_empty());
    assert!(outcome.failure_reason().unwrap().contains("Channel limits violation"));
    assert_eq!(executor.run_count(), 1);
    assert_eq!(generator.observed_chain_lengths().await, vec![0]);
}

#[tokio::test]
async fn safety_violation_after_failures_keeps_earlier_chain() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(["a = 1", "b = 2", "c = 3"]));
    let executor = Arc::new(ScriptedExecutor::new([runtime_failure("first"), safety_violation()]));
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    let PipelineOutcome::Failed { reason, error_chain, .. } = outcome else {
        panic!("expected failure");
    };
    assert!(reason.is_safety_violation());
    assert_eq!(error_chain.len(), 1);
    assert_eq!(executor.run_count(), 2);
}

#[tokio::test]
async fn budget_exhausted_after_two_failures() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(["a = 1", "b = 2", "c = 3"]));
    let executor = Arc::new(ScriptedExecutor::new([runtime_failure("one"), timeout()]));
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(2)).await.unwrap();

    assert_eq!(
        outcome.failure_reason().as_deref(),
        Some("Python execution failed after 2 attempts")
    );
    assert_eq!(outcome.error_chain().len(), 2);
    assert_eq!(outcome.error_chain().last().unwrap().error_type, "Timeout");
    assert_eq!(executor.run_count(), 2);
}

#[tokio::test]
async fn success_on_last_attempt() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(["a = 1", "b = 2", "results = {}"]));
    let executor = Arc::new(ScriptedExecutor::new([
        runtime_failure("one"),
        runtime_failure("two"),
        success(&[("value", serde_json::json!(42))]),
    ]));
    let pipeline = ws.pipeline(ws.config(), generator.clone(), executor);

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(outcome.error_chain().len(), 2);
    assert_eq!(generator.observed_chain_lengths().await, vec![0, 1, 2]);
}

#[tokio::test]
async fn zero_budget_allows_one_attempt() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(["a = 1", "b = 2"]));
    let executor = Arc::new(ScriptedExecutor::new([runtime_failure("one"), success(&[])]));
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(0)).await.unwrap();

    assert_eq!(
        outcome.failure_reason().as_deref(),
        Some("Python execution failed after 1 attempt")
    );
    assert_eq!(executor.run_count(), 1);
}

#[tokio::test]
async fn syntax_rejection_consumes_an_attempt_without_running() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(["def f(:\n    pass", "results = {}"]));
    let executor = Arc::new(ScriptedExecutor::new([success(&[])]));
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 2);
    let rejected = &outcome.error_chain().entries()[0];
    assert_eq!(rejected.stage, ErrorStage::Analysis);
    assert_eq!(rejected.error_type, "SyntaxError");
    assert_eq!(executor.executed(), vec!["results = {}"]);
}

#[tokio::test]
async fn security_rejection_is_fed_back() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates([
        "import subprocess\nsubprocess.run(['rm', '-rf', '/'])\nresults = {}",
        "results = {}",
    ]));
    let executor = Arc::new(ScriptedExecutor::new([success(&[])]));
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    assert!(outcome.is_success());
    let rejected = &outcome.error_chain().entries()[0];
    assert_eq!(rejected.error_type, "SecurityViolation");
    assert!(rejected.message.contains("subprocess"));
    assert_eq!(executor.run_count(), 1);
}

#[tokio::test]
async fn generation_failure_is_recorded_without_code() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::new([
        Err(GenerationError::Completion("upstream timeout".into())),
        Ok("results = {}".to_string()),
    ]));
    let executor = Arc::new(ScriptedExecutor::new([success(&[])]));
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    assert!(outcome.is_success());
    let failed = &outcome.error_chain().entries()[0];
    assert_eq!(failed.stage, ErrorStage::Generation);
    assert_eq!(failed.error_type, "CompletionError");
    assert!(failed.failed_code.is_none());
    assert_eq!(executor.run_count(), 1);
}

#[tokio::test]
async fn exhausted_generator_fails_without_running() {
    let ws = TestWorkspace::new();
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(Vec::<String>::new()));
    let executor = Arc::new(ScriptedExecutor::default());
    let pipeline = ws.pipeline(ws.config(), generator, executor.clone());

    let outcome = pipeline.execute(&test_request(2)).await.unwrap();

    assert!(!outcome.is_success());
    assert_eq!(outcome.error_chain().len(), 2);
    assert!(outcome
        .error_chain()
        .iter()
        .all(|e| e.error_type == "GeneratorExhausted"));
    assert_eq!(executor.run_count(), 0);
}

#[tokio::test]
async fn control_writes_wait_for_approval_then_resume() {
    let ws = TestWorkspace::new();
    let config = ws.config().with_approval(ApprovalConfig {
        mode: ApprovalMode::ControlWrites,
        risk_threshold: None,
    });
    let code = "write_channel('SR:MAG:QF1:I', 1.0)\nresults = {}";
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates([code]));
    let executor = Arc::new(ScriptedExecutor::new([success(&[("written", serde_json::json!(true))])]));
    let pipeline = ws.pipeline(config.clone(), generator, executor.clone());
    let request = test_request(3);

    let outcome = pipeline.execute(&request).await.unwrap();

    let PipelineOutcome::AwaitingApproval {
        code: pending,
        analysis,
        reasoning,
        attempts,
        ..
    } = outcome
    else {
        panic!("expected approval request");
    };
    assert_eq!(pending, code);
    assert!(analysis.domain.has_control_writes());
    assert!(reasoning.contains("mock_writes"));
    assert_eq!(attempts, 1);
    assert_eq!(executor.run_count(), 0);

    // Approved resume skips generation and the gate.
    let gate = Arc::new(RecordingApprovalGate::requiring());
    let resumed = ws
        .pipeline(
            config,
            Arc::new(ScriptedCodeGenerator::from_candidates(Vec::<String>::new())),
            executor.clone(),
        )
        .with_approval_gate(gate.clone());
    let outcome = resumed.execute(&request.approved(pending)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(gate.evaluations(), 0);
    assert_eq!(executor.executed(), vec![code]);
}

#[tokio::test]
async fn approving_gate_sees_every_analyzed_candidate() {
    let ws = TestWorkspace::new();
    let gate = Arc::new(RecordingApprovalGate::approving());
    let generator = Arc::new(ScriptedCodeGenerator::from_candidates(["def f(:", "a = 1", "results = {}"]));
    let executor = Arc::new(ScriptedExecutor::new([runtime_failure("one"), success(&[])]));
    let pipeline = ws
        .pipeline(ws.config(), generator, executor)
        .with_approval_gate(gate.clone());

    let outcome = pipeline.execute(&test_request(3)).await.unwrap();

    assert!(outcome.is_success());
    // The syntax rejection never reaches the gate.
    assert_eq!(gate.evaluations(), 2);
}

#[tokio::test]
async fn empty_approved_code_is_invalid() {
    let ws = TestWorkspace::new();
    let pipeline = ws.pipeline(
        ws.config(),
        Arc::new(ScriptedCodeGenerator::from_candidates(Vec::<String>::new())),
        Arc::new(ScriptedExecutor::default()),
    );

    let err = pipeline
        .execute(&test_request(1).approved("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
}

#[tokio::test]
async fn cancellation_wins_over_execution() {
    let ws = TestWorkspace::new();
    let executor = Arc::new(ScriptedExecutor::new([success(&[])]));
    let pipeline = ws.pipeline(
        ws.config(),
        Arc::new(ScriptedCodeGenerator::from_candidates(["results = {}"])),
        executor.clone(),
    );

    let err = pipeline
        .execute_until(&test_request(3), std::future::ready(()))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(executor.run_count(), 0);

    let scopes: Vec<_> = std::fs::read_dir(ws.path()).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(scopes.len(), 1);
    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(scopes[0].join(METADATA_FILE)).unwrap()).unwrap();
    assert_eq!(metadata["status"], "cancelled");
    assert_eq!(metadata["attempts"], 0);
}

#[tokio::test]
async fn delete_on_success_removes_scope() {
    let ws = TestWorkspace::new();
    let config = ws.config().with_retention(ScopeRetention::DeleteOnSuccess);
    let pipeline = ws.pipeline(
        config,
        Arc::new(ScriptedCodeGenerator::from_candidates(["results = {}"])),
        Arc::new(ScriptedExecutor::new([success(&[])])),
    );

    let outcome = pipeline.execute(&test_request(1)).await.unwrap();

    let PipelineOutcome::Succeeded { scope_path, .. } = outcome else {
        panic!("expected success");
    };
    assert!(scope_path.is_none());
}

#[tokio::test]
async fn failed_scope_is_kept_under_delete_on_success() {
    let ws = TestWorkspace::new();
    let config = ws.config().with_retention(ScopeRetention::DeleteOnSuccess);
    let pipeline = ws.pipeline(
        config,
        Arc::new(ScriptedCodeGenerator::from_candidates(["a = 1"])),
        Arc::new(ScriptedExecutor::new([runtime_failure("boom")])),
    );

    let outcome = pipeline.execute(&test_request(1)).await.unwrap();

    let PipelineOutcome::Failed { scope_path, .. } = outcome else {
        panic!("expected failure");
    };
    let root = scope_path.unwrap();
    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join(METADATA_FILE)).unwrap()).unwrap();
    assert_eq!(metadata["status"], "failed");
    assert!(root.starts_with(ws.path()));
}
