//! Attempt notebooks
//!
//! After each executed attempt a Jupyter notebook (nbformat 4) is written to
//! `artifacts/attempt_NN.ipynb` so a human can open, edit and rerun the
//! candidate with its captured output.

use crate::types::ExecutionRequest;
use pyexec_sandbox::{ExecutionOutcome, ExecutionRecord, ExecutionScope, SandboxError};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Notebook file name for an attempt
#[must_use]
pub fn notebook_name(attempt: u32) -> String {
    format!("attempt_{attempt:02}.ipynb")
}

/// Notebook source lines, each keeping its newline
fn source_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

fn outcome_markdown(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Success { results } => {
            let keys: Vec<&str> = results.keys().map(String::as_str).collect();
            format!("**Outcome:** success\n\n`results` keys: {}\n", keys.join(", "))
        }
        ExecutionOutcome::RuntimeFailure { message, exception_kind } => {
            format!("**Outcome:** runtime failure (`{exception_kind}`)\n\n```\n{}\n```\n", message.trim_end())
        }
        ExecutionOutcome::SafetyViolation {
            channel_address,
            value,
            violation_kind,
            ..
        } => format!(
            "**Outcome:** channel limits violation\n\n`{channel_address}` <- {value} ({violation_kind})\n"
        ),
        ExecutionOutcome::Timeout { limit } => {
            format!("**Outcome:** timed out after {:.1}s\n", limit.as_secs_f64())
        }
    }
}

/// Build the notebook document
#[must_use]
pub fn build_notebook(request: &ExecutionRequest, attempt: u32, code: &str, record: &ExecutionRecord) -> Value {
    let header = format!(
        "# Attempt {attempt}\n\n**Query:** {}\n\n**Objective:** {}\n",
        request.user_query(),
        request.task_objective()
    );

    let mut outputs = Vec::new();
    if !record.stdout.is_empty() {
        outputs.push(json!({"output_type": "stream", "name": "stdout", "text": source_lines(&record.stdout)}));
    }
    if !record.stderr.is_empty() {
        outputs.push(json!({"output_type": "stream", "name": "stderr", "text": source_lines(&record.stderr)}));
    }

    json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {
            "kernelspec": {"display_name": "Python 3", "language": "python", "name": "python3"},
            "language_info": {"name": "python"},
            "pyexec": {
                "request_id": request.id().to_string(),
                "attempt": attempt,
                "outcome": record.outcome.kind(),
            }
        },
        "cells": [
            {
                "cell_type": "markdown",
                "id": format!("attempt-{attempt:02}-header"),
                "metadata": {},
                "source": source_lines(&header),
            },
            {
                "cell_type": "code",
                "id": format!("attempt-{attempt:02}-code"),
                "metadata": {},
                "execution_count": null,
                "source": source_lines(code),
                "outputs": outputs,
            },
            {
                "cell_type": "markdown",
                "id": format!("attempt-{attempt:02}-outcome"),
                "metadata": {},
                "source": source_lines(&outcome_markdown(&record.outcome)),
            }
        ]
    })
}

/// Write the attempt notebook into the scope's artifacts
///
/// # Errors
/// Returns `SandboxError` if the notebook cannot be written.
pub async fn write_attempt_notebook(
    scope: &ExecutionScope,
    request: &ExecutionRequest,
    attempt: u32,
    code: &str,
    record: &ExecutionRecord,
) -> Result<PathBuf, SandboxError> {
    let notebook = build_notebook(request, attempt, code, record);
    let bytes = serde_json::to_vec_pretty(&notebook)?;
    scope.write_artifact(&notebook_name(attempt), &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(outcome: ExecutionOutcome) -> ExecutionRecord {
        ExecutionRecord {
            stdout: "reading SR:DCCT\ndone\n".into(),
            ..ExecutionRecord::from_outcome(outcome)
        }
    }

    #[test]
    fn notebook_shape() {
        let request = ExecutionRequest::builder("beam current?", "read SR:DCCT").build();
        let nb = build_notebook(
            &request,
            2,
            "v = caget('SR:DCCT')\nresults = {'v': v}\n",
            &record(ExecutionOutcome::Timeout {
                limit: Duration::from_secs(5),
            }),
        );
        assert_eq!(nb["nbformat"], 4);
        assert_eq!(nb["metadata"]["pyexec"]["attempt"], 2);
        assert_eq!(nb["metadata"]["pyexec"]["outcome"], "timeout");

        let cells = nb["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[1]["cell_type"], "code");
        assert_eq!(cells[1]["source"][0], "v = caget('SR:DCCT')\n");
        assert_eq!(cells[1]["outputs"][0]["name"], "stdout");
        assert!(cells[2]["source"][0].as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn notebook_names_are_padded() {
        assert_eq!(notebook_name(3), "attempt_03.ipynb");
        assert_eq!(notebook_name(12), "attempt_12.ipynb");
    }

    #[tokio::test]
    async fn notebook_written_to_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(dir.path(), "nb").await.unwrap();
        let request = ExecutionRequest::builder("q", "o").build();
        let path = write_attempt_notebook(
            &scope,
            &request,
            1,
            "results = {}\n",
            &record(ExecutionOutcome::Success {
                results: serde_json::Map::new(),
            }),
        )
        .await
        .unwrap();
        assert!(path.starts_with(scope.artifacts_dir()));
        let parsed: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["metadata"]["pyexec"]["outcome"], "success");
    }
}
