//! Execution outcomes
//!
//! Classification of a finished run happens here and only here. Callers
//! match on [`ExecutionOutcome`] and never look at exception names or
//! process output themselves.

use crate::runner::{ReportStatus, RunnerReport, SafetyDetails, SAFETY_EXCEPTION_TYPE, SAFETY_TEXT_MARKER};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message used when the script finishes without binding `results`
pub const MISSING_RESULTS_MESSAGE: &str =
    "Python code did not create required results dictionary";

/// How one execution ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Completed with a `results` mapping
    Success {
        /// The `results` mapping, JSON-coerced
        results: serde_json::Map<String, serde_json::Value>,
    },
    /// Ordinary failure of the generated code
    RuntimeFailure {
        /// Message (with traceback when available)
        message: String,
        /// Exception class name, or a synthetic kind
        exception_kind: String,
    },
    /// Attempted write outside configured channel limits
    SafetyViolation {
        /// Channel/PV address
        channel_address: String,
        /// Attempted value
        value: serde_json::Value,
        /// Violation kind (e.g. `above_max`)
        violation_kind: String,
        /// Configured minimum
        min: Option<f64>,
        /// Configured maximum
        max: Option<f64>,
    },
    /// Wall-clock limit exceeded; the process was killed
    Timeout {
        /// Limit that was exceeded
        #[serde(with = "duration_secs")]
        limit: Duration,
    },
}

impl ExecutionOutcome {
    /// Whether this is a safety violation
    #[inline]
    #[must_use]
    pub fn is_safety_violation(&self) -> bool {
        matches!(self, Self::SafetyViolation { .. })
    }

    /// Whether this is a success
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short variant name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RuntimeFailure { .. } => "runtime_failure",
            Self::SafetyViolation { .. } => "safety_violation",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Safety violation recovered from free text, with unknown details
    #[must_use]
    pub fn unknown_safety_violation(message: &str) -> Self {
        Self::SafetyViolation {
            channel_address: "unknown".to_string(),
            value: serde_json::Value::Null,
            violation_kind: first_line(message).unwrap_or("unknown").to_string(),
            min: None,
            max: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Captured process result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if killed by a signal
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Whether the wall-clock limit was hit
    pub timed_out: bool,
    /// Wall-clock duration
    pub elapsed: Duration,
}

/// Whether free text carries the connector's safety markers
#[must_use]
pub fn mentions_safety_violation(text: &str) -> bool {
    text.contains(SAFETY_TEXT_MARKER) || text.contains(SAFETY_EXCEPTION_TYPE)
}

/// Map a runner report (or its absence) to an outcome
///
/// Priority: timeout, then safety markers, then `results`, then generic
/// failure. A missing report with safety markers on stderr still counts as
/// a safety violation.
#[must_use]
pub fn classify(report: Option<RunnerReport>, process: &ProcessOutput, timeout: Duration) -> ExecutionOutcome {
    if process.timed_out {
        return ExecutionOutcome::Timeout { limit: timeout };
    }

    let Some(report) = report else {
        if mentions_safety_violation(&process.stderr) {
            return ExecutionOutcome::unknown_safety_violation(&process.stderr);
        }
        let status = process
            .exit_code
            .map_or_else(|| "a signal".to_string(), |c| format!("status {c}"));
        return ExecutionOutcome::RuntimeFailure {
            message: format!(
                "execution process exited with {status} without producing a report: {}",
                tail(&process.stderr, 2000)
            ),
            exception_kind: "ProcessError".to_string(),
        };
    };

    if report_is_safety(&report) {
        return safety_from_report(report);
    }

    match report.status {
        ReportStatus::Success => ExecutionOutcome::Success {
            results: report.results.unwrap_or_default(),
        },
        ReportStatus::MissingResults => ExecutionOutcome::RuntimeFailure {
            message: MISSING_RESULTS_MESSAGE.to_string(),
            exception_kind: "MissingResults".to_string(),
        },
        ReportStatus::NonMappingResults => ExecutionOutcome::RuntimeFailure {
            message: format!(
                "results is not a dictionary (got {})",
                report.results_type.as_deref().unwrap_or("unknown")
            ),
            exception_kind: "MissingResults".to_string(),
        },
        ReportStatus::Exception | ReportStatus::Error | ReportStatus::SafetyViolation => {
            let kind = report
                .exception_type
                .clone()
                .unwrap_or_else(|| "RuntimeError".to_string());
            let mut message = report.message.clone().unwrap_or_else(|| kind.clone());
            if let Some(traceback) = report.traceback.as_deref() {
                message.push_str("\n\n");
                message.push_str(&tail(traceback, 4000));
            }
            ExecutionOutcome::RuntimeFailure {
                message,
                exception_kind: kind,
            }
        }
    }
}

fn report_is_safety(report: &RunnerReport) -> bool {
    report.status == ReportStatus::SafetyViolation
        || report.exception_type.as_deref() == Some(SAFETY_EXCEPTION_TYPE)
        || report.message.as_deref().is_some_and(mentions_safety_violation)
        || report.traceback.as_deref().is_some_and(mentions_safety_violation)
}

fn safety_from_report(report: RunnerReport) -> ExecutionOutcome {
    let message = report.message.clone().unwrap_or_default();
    let details = report.safety.unwrap_or_default();
    let SafetyDetails {
        channel_address,
        value,
        violation_kind,
        min,
        max,
    } = details;

    ExecutionOutcome::SafetyViolation {
        channel_address: channel_address
            .as_ref()
            .map_or_else(|| "unknown".to_string(), value_text),
        value: value.unwrap_or(serde_json::Value::Null),
        violation_kind: violation_kind.as_ref().map_or_else(
            || first_line(&message).unwrap_or("unknown").to_string(),
            value_text,
        ),
        min: min.as_ref().and_then(serde_json::Value::as_f64),
        max: max.as_ref().and_then(serde_json::Value::as_f64),
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Last `max_chars` characters of `text`
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim_end().to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", skipped.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report(json: &str) -> RunnerReport {
        serde_json::from_str(json).unwrap()
    }

    fn finished() -> ProcessOutput {
        ProcessOutput {
            exit_code: Some(0),
            ..ProcessOutput::default()
        }
    }

    #[test]
    fn success_carries_results() {
        let outcome = classify(
            Some(report(r#"{"status": "success", "results": {"mean": 1.0}}"#)),
            &finished(),
            Duration::from_secs(5),
        );
        match outcome {
            ExecutionOutcome::Success { results } => assert_eq!(results["mean"], 1.0),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn missing_results_is_runtime_failure() {
        let outcome = classify(
            Some(report(r#"{"status": "missing_results"}"#)),
            &finished(),
            Duration::from_secs(5),
        );
        match outcome {
            ExecutionOutcome::RuntimeFailure { message, .. } => {
                assert!(message.contains("did not create required results dictionary"));
            }
            other => panic!("expected runtime failure, got {other:?}"),
        }
    }

    #[test]
    fn non_mapping_results_names_type() {
        let outcome = classify(
            Some(report(r#"{"status": "non_mapping_results", "results_type": "list"}"#)),
            &finished(),
            Duration::from_secs(5),
        );
        let ExecutionOutcome::RuntimeFailure { message, .. } = outcome else {
            panic!("expected runtime failure");
        };
        assert_eq!(message, "results is not a dictionary (got list)");
    }

    #[test]
    fn safety_report_fields_extracted() {
        let outcome = classify(
            Some(report(
                r#"{"status": "safety_violation", "exception_type": "ChannelLimitsViolationError",
                    "message": "CHANNEL LIMITS VIOLATION",
                    "safety": {"channel_address": "SR:MAG:I", "value": 250,
                               "violation_kind": "above_max", "min": 0, "max": 200}}"#,
            )),
            &finished(),
            Duration::from_secs(5),
        );
        assert_eq!(
            outcome,
            ExecutionOutcome::SafetyViolation {
                channel_address: "SR:MAG:I".to_string(),
                value: serde_json::json!(250),
                violation_kind: "above_max".to_string(),
                min: Some(0.0),
                max: Some(200.0),
            }
        );
    }

    #[test]
    fn wrapped_safety_error_detected_from_traceback() {
        let outcome = classify(
            Some(report(
                r#"{"status": "exception", "exception_type": "RuntimeError", "message": "write failed",
                    "traceback": "Traceback...\nconnector.ChannelLimitsViolationError: SR:X\n"}"#,
            )),
            &finished(),
            Duration::from_secs(5),
        );
        assert!(outcome.is_safety_violation());
    }

    #[test]
    fn ordinary_exception_is_runtime_failure() {
        let outcome = classify(
            Some(report(
                r#"{"status": "exception", "exception_type": "ZeroDivisionError",
                    "message": "division by zero", "traceback": "Traceback ...\nZeroDivisionError"}"#,
            )),
            &finished(),
            Duration::from_secs(5),
        );
        match outcome {
            ExecutionOutcome::RuntimeFailure { message, exception_kind } => {
                assert_eq!(exception_kind, "ZeroDivisionError");
                assert!(message.starts_with("division by zero"));
            }
            other => panic!("expected runtime failure, got {other:?}"),
        }
    }

    #[test]
    fn timeout_wins_over_report() {
        let process = ProcessOutput {
            timed_out: true,
            ..ProcessOutput::default()
        };
        let outcome = classify(
            Some(report(r#"{"status": "success", "results": {}}"#)),
            &process,
            Duration::from_secs(2),
        );
        assert_eq!(outcome, ExecutionOutcome::Timeout { limit: Duration::from_secs(2) });
    }

    #[test]
    fn missing_report_uses_stderr() {
        let process = ProcessOutput {
            exit_code: Some(139),
            stderr: "Segmentation fault".to_string(),
            ..ProcessOutput::default()
        };
        let ExecutionOutcome::RuntimeFailure { message, exception_kind } =
            classify(None, &process, Duration::from_secs(2))
        else {
            panic!("expected runtime failure");
        };
        assert_eq!(exception_kind, "ProcessError");
        assert!(message.contains("status 139"));
        assert!(message.contains("Segmentation fault"));

        let process = ProcessOutput {
            exit_code: Some(1),
            stderr: "CHANNEL LIMITS VIOLATION: SR:X above max".to_string(),
            ..ProcessOutput::default()
        };
        assert!(classify(None, &process, Duration::from_secs(2)).is_safety_violation());
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(ExecutionOutcome::Timeout {
            limit: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json["outcome"], "timeout");
        assert_eq!(json["limit"], 1.5);
    }

    #[test]
    fn tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "...def");
        assert_eq!(tail("abc\n", 10), "abc");
    }
}
