//! Python runner script and its report
//!
//! The runner is written into every scope and executed with the scope as
//! cwd. It binds the `context` entry of `context.json` to `context`,
//! executes the generated code in a fresh namespace, and writes a JSON
//! report describing how the code ended. It uses only relative paths so the
//! same script works for local processes and for containers mounting the
//! scope at `/workspace`.

use serde::Deserialize;

/// Exception class raised by the control-system connector on out-of-limit writes
pub const SAFETY_EXCEPTION_TYPE: &str = "ChannelLimitsViolationError";

/// Text marker the connector puts in every limits-violation message
pub const SAFETY_TEXT_MARKER: &str = "CHANNEL LIMITS VIOLATION";

/// Runner script source
pub const RUNNER_SOURCE: &str = r##"# Generated by pyexec. Executes generated_code.py and reports the outcome.
import json
import os
import sys
import traceback
from collections.abc import Mapping

CODE_FILE = "generated_code.py"
CONTEXT_FILE = "context.json"
REPORT_FILE = "execution_report.json"
ARTIFACTS_DIR = "artifacts"
SAFETY_TYPE = "ChannelLimitsViolationError"
SAFETY_MARKER = "CHANNEL LIMITS VIOLATION"


def _jsonable(value):
    try:
        json.dumps(value)
        return value
    except (TypeError, ValueError, OverflowError):
        pass
    if isinstance(value, Mapping):
        return {str(k): _jsonable(v) for k, v in value.items()}
    if isinstance(value, (list, tuple, set, frozenset)):
        return [_jsonable(v) for v in value]
    for attr in ("tolist", "item", "isoformat"):
        fn = getattr(value, attr, None)
        if callable(fn):
            try:
                return _jsonable(fn())
            except Exception:
                pass
    return repr(value)


def _is_safety(exc):
    names = [cls.__name__ for cls in type(exc).__mro__]
    return SAFETY_TYPE in names or SAFETY_MARKER in str(exc)


def _first_attr(exc, *names):
    for name in names:
        if hasattr(exc, name):
            return _jsonable(getattr(exc, name))
    return None


def _save_figures():
    saved = []
    plt = sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return saved
    try:
        for num in plt.get_fignums():
            path = os.path.join(ARTIFACTS_DIR, "figure_%02d.png" % num)
            plt.figure(num).savefig(path)
            saved.append(path)
    except Exception:
        pass
    return saved


def main():
    report = {"status": "error"}
    try:
        with open(CONTEXT_FILE, encoding="utf-8") as fh:
            payload = json.load(fh)
        context = payload.get("context") if isinstance(payload, dict) else None
    except (OSError, ValueError):
        context = None
    if context is None:
        context = {}

    namespace = {"__name__": "__main__", "context": context}
    try:
        with open(CODE_FILE, encoding="utf-8") as fh:
            source = fh.read()
        exec(compile(source, CODE_FILE, "exec"), namespace)
    except BaseException as exc:
        report["exception_type"] = type(exc).__name__
        report["message"] = str(exc)
        report["traceback"] = traceback.format_exc()
        if _is_safety(exc):
            report["status"] = "safety_violation"
            report["safety"] = {
                "channel_address": _first_attr(exc, "channel_address", "pv_name", "channel"),
                "value": _first_attr(exc, "attempted_value", "value"),
                "violation_kind": _first_attr(exc, "violation_type", "violation_kind"),
                "min": _first_attr(exc, "min_value", "min"),
                "max": _first_attr(exc, "max_value", "max"),
            }
        else:
            report["status"] = "exception"
    else:
        if "results" not in namespace:
            report["status"] = "missing_results"
        elif not isinstance(namespace["results"], Mapping):
            report["status"] = "non_mapping_results"
            report["results_type"] = type(namespace["results"]).__name__
        else:
            report["status"] = "success"
            report["results"] = _jsonable(dict(namespace["results"]))

    report["figures"] = _save_figures()
    with open(REPORT_FILE, "w", encoding="utf-8") as fh:
        json.dump(report, fh)


if __name__ == "__main__":
    main()
"##;

/// How the generated code ended, as seen by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Completed with a `results` mapping
    Success,
    /// Raised an ordinary exception
    Exception,
    /// Raised a channel-limits violation
    SafetyViolation,
    /// Completed without binding `results`
    MissingResults,
    /// Completed with a non-mapping `results`
    NonMappingResults,
    /// Runner failed before classifying
    Error,
}

/// Limits-violation details copied off the connector exception
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SafetyDetails {
    /// Channel/PV address
    #[serde(default)]
    pub channel_address: Option<serde_json::Value>,
    /// Attempted value
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Violation kind (e.g. `above_max`)
    #[serde(default)]
    pub violation_kind: Option<serde_json::Value>,
    /// Configured minimum
    #[serde(default)]
    pub min: Option<serde_json::Value>,
    /// Configured maximum
    #[serde(default)]
    pub max: Option<serde_json::Value>,
}

/// Contents of `execution_report.json`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunnerReport {
    /// Classification
    pub status: ReportStatus,
    /// `results`, for `Success`
    #[serde(default)]
    pub results: Option<serde_json::Map<String, serde_json::Value>>,
    /// Exception class name
    #[serde(default)]
    pub exception_type: Option<String>,
    /// Exception message
    #[serde(default)]
    pub message: Option<String>,
    /// Formatted traceback
    #[serde(default)]
    pub traceback: Option<String>,
    /// Type name of a non-mapping `results`
    #[serde(default)]
    pub results_type: Option<String>,
    /// Limits-violation details
    #[serde(default)]
    pub safety: Option<SafetyDetails>,
    /// Figures saved by the runner (relative to the scope)
    #[serde(default)]
    pub figures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_uses_shared_markers() {
        assert!(RUNNER_SOURCE.contains(SAFETY_EXCEPTION_TYPE));
        assert!(RUNNER_SOURCE.contains(SAFETY_TEXT_MARKER));
        assert!(RUNNER_SOURCE.contains(crate::scope::CODE_FILE));
        assert!(RUNNER_SOURCE.contains(crate::scope::REPORT_FILE));
        assert!(RUNNER_SOURCE.contains(crate::scope::CONTEXT_FILE));
    }

    #[test]
    fn decode_success_report() {
        let report: RunnerReport = serde_json::from_str(
            r#"{"status": "success", "results": {"mean": 1.0}, "figures": []}"#,
        )
        .unwrap();
        assert_eq!(report.status, ReportStatus::Success);
        assert_eq!(report.results.unwrap()["mean"], 1.0);
    }

    #[test]
    fn decode_safety_report() {
        let report: RunnerReport = serde_json::from_str(
            r#"{
                "status": "safety_violation",
                "exception_type": "ChannelLimitsViolationError",
                "message": "CHANNEL LIMITS VIOLATION: SR:MAGNET above max",
                "safety": {"channel_address": "SR:MAGNET", "value": 250.0,
                           "violation_kind": "above_max", "min": 0.0, "max": 200.0}
            }"#,
        )
        .unwrap();
        let safety = report.safety.unwrap();
        assert_eq!(safety.channel_address, Some(serde_json::json!("SR:MAGNET")));
        assert_eq!(safety.max, Some(serde_json::json!(200.0)));
        assert!(report.figures.is_empty());
    }
}
