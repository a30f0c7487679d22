//! Retry coordination
//!
//! State machine over attempts of one request:
//!
//! ```text
//! Attempting(n) --safety violation--> Failed(SafetyViolation)
//!               --success-----------> Succeeded(results)
//!               --other failure-----> Attempting(n + 1) | Failed(AttemptsExhausted)
//! ```
//!
//! Safety violations end the request whatever the remaining budget and are
//! not added to the error chain. Every other failure is appended first, and
//! the request fails once `chain.len() >= max_attempts`.

use crate::types::{ErrorChain, ErrorStage, ExecutionError};
use pyexec_sandbox::ExecutionOutcome;
use serde::{Deserialize, Serialize};

/// Why a request failed terminally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Budget used up by ordinary failures
    AttemptsExhausted {
        /// Attempts made
        attempts: u32,
    },
    /// Code attempted an out-of-limits write
    SafetyViolation {
        /// Channel/PV address
        channel_address: String,
        /// Attempted value
        value: serde_json::Value,
        /// Violation kind
        violation_kind: String,
        /// Configured minimum
        min: Option<f64>,
        /// Configured maximum
        max: Option<f64>,
    },
}

impl FailureReason {
    /// Whether this was a safety violation
    #[inline]
    #[must_use]
    pub fn is_safety_violation(&self) -> bool {
        matches!(self, Self::SafetyViolation { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttemptsExhausted { attempts } => {
                let noun = if *attempts == 1 { "attempt" } else { "attempts" };
                write!(f, "Python execution failed after {attempts} {noun}")
            }
            Self::SafetyViolation {
                channel_address,
                value,
                violation_kind,
                min,
                max,
            } => {
                let bound = |b: &Option<f64>| b.map_or_else(|| "unset".to_string(), |v| v.to_string());
                write!(
                    f,
                    "Channel limits violation: {violation_kind} writing {value} to {channel_address} \
                     (min {}, max {})",
                    bound(min),
                    bound(max)
                )
            }
        }
    }
}

/// Coordinator decision after one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptState {
    /// Run this attempt next (1-based)
    Attempting(u32),
    /// Request produced results
    Succeeded(serde_json::Map<String, serde_json::Value>),
    /// Request is over
    Failed(FailureReason),
}

impl AttemptState {
    /// Whether the request is over
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Attempting(_))
    }
}

/// Bounded-retry decision maker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCoordinator {
    max_attempts: u32,
}

impl RetryCoordinator {
    /// Coordinator with budget `max_attempts`
    ///
    /// A budget of zero still allows the first attempt; its first failure
    /// is terminal.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Retry budget
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide after executing `code` on attempt `attempt`
    pub fn decide(&self, attempt: u32, outcome: ExecutionOutcome, code: &str, chain: &mut ErrorChain) -> AttemptState {
        match outcome {
            ExecutionOutcome::SafetyViolation {
                channel_address,
                value,
                violation_kind,
                min,
                max,
            } => {
                let reason = FailureReason::SafetyViolation {
                    channel_address,
                    value,
                    violation_kind,
                    min,
                    max,
                };
                tracing::error!(attempt, %reason, "safety violation, request terminated");
                AttemptState::Failed(reason)
            }
            ExecutionOutcome::Success { results } => AttemptState::Succeeded(results),
            ExecutionOutcome::RuntimeFailure { message, exception_kind } => self.record_failure(
                ExecutionError::new(ErrorStage::Execution, attempt, exception_kind, message, Some(code.to_string())),
                chain,
            ),
            ExecutionOutcome::Timeout { limit } => self.record_failure(
                ExecutionError::new(
                    ErrorStage::Execution,
                    attempt,
                    "Timeout",
                    format!("execution exceeded the {:.1}s wall-clock limit", limit.as_secs_f64()),
                    Some(code.to_string()),
                ),
                chain,
            ),
        }
    }

    /// Append a non-safety failure and decide whether to retry
    ///
    /// Used directly for generation failures and analysis rejections.
    pub fn record_failure(&self, error: ExecutionError, chain: &mut ErrorChain) -> AttemptState {
        let attempt = error.attempt_number;
        tracing::warn!(
            attempt,
            stage = %error.stage,
            error_type = %error.error_type,
            "attempt failed"
        );
        chain.push(error);

        let used = u32::try_from(chain.len()).unwrap_or(u32::MAX);
        if used >= self.max_attempts {
            AttemptState::Failed(FailureReason::AttemptsExhausted { attempts: used })
        } else {
            AttemptState::Attempting(attempt.saturating_add(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn runtime(msg: &str) -> ExecutionOutcome {
        ExecutionOutcome::RuntimeFailure {
            message: msg.to_string(),
            exception_kind: "RuntimeError".to_string(),
        }
    }

    fn violation() -> ExecutionOutcome {
        ExecutionOutcome::SafetyViolation {
            channel_address: "SR:MAG:I".into(),
            value: serde_json::json!(250),
            violation_kind: "above_max".into(),
            min: Some(0.0),
            max: Some(200.0),
        }
    }

    #[test]
    fn two_failures_exhaust_budget_of_two() {
        let coordinator = RetryCoordinator::new(2);
        let mut chain = ErrorChain::new();

        assert_eq!(coordinator.decide(1, runtime("a"), "x", &mut chain), AttemptState::Attempting(2));
        let state = coordinator.decide(2, runtime("b"), "y", &mut chain);
        let AttemptState::Failed(reason) = state else {
            panic!("expected failure");
        };
        assert_eq!(reason.to_string(), "Python execution failed after 2 attempts");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn success_after_failures() {
        let coordinator = RetryCoordinator::new(3);
        let mut chain = ErrorChain::new();
        coordinator.decide(1, runtime("a"), "x", &mut chain);
        coordinator.decide(2, runtime("b"), "y", &mut chain);
        let mut results = serde_json::Map::new();
        results.insert("ok".into(), serde_json::json!(true));
        let state = coordinator.decide(3, ExecutionOutcome::Success { results: results.clone() }, "z", &mut chain);
        assert_eq!(state, AttemptState::Succeeded(results));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn safety_violation_not_recorded() {
        let coordinator = RetryCoordinator::new(5);
        let mut chain = ErrorChain::new();
        let state = coordinator.decide(1, violation(), "caput('SR:MAG:I', 250)", &mut chain);
        assert!(state.is_terminal());
        let AttemptState::Failed(reason) = state else {
            panic!("expected failure");
        };
        assert!(reason.is_safety_violation());
        assert_eq!(
            reason.to_string(),
            "Channel limits violation: above_max writing 250 to SR:MAG:I (min 0, max 200)"
        );
        assert!(chain.is_empty());
    }

    #[test]
    fn zero_budget_first_failure_terminal() {
        let coordinator = RetryCoordinator::new(0);
        let mut chain = ErrorChain::new();
        let state = coordinator.decide(1, runtime("a"), "x", &mut chain);
        assert_eq!(
            state,
            AttemptState::Failed(FailureReason::AttemptsExhausted { attempts: 1 })
        );
        assert_eq!(
            FailureReason::AttemptsExhausted { attempts: 1 }.to_string(),
            "Python execution failed after 1 attempt"
        );
    }

    #[test]
    fn timeout_consumes_budget() {
        let coordinator = RetryCoordinator::new(2);
        let mut chain = ErrorChain::new();
        let state = coordinator.decide(
            1,
            ExecutionOutcome::Timeout {
                limit: Duration::from_secs(600),
            },
            "while True: pass",
            &mut chain,
        );
        assert_eq!(state, AttemptState::Attempting(2));
        let entry = chain.last().unwrap();
        assert_eq!(entry.error_type, "Timeout");
        assert!(entry.message.contains("600.0s"));
        assert_eq!(entry.failed_code.as_deref(), Some("while True: pass"));
    }

    #[test]
    fn analysis_rejection_shares_budget() {
        let coordinator = RetryCoordinator::new(2);
        let mut chain = ErrorChain::new();
        let rejected = |n| {
            ExecutionError::new(ErrorStage::Analysis, n, "SyntaxError", "1:3: missing )", Some("f(".into()))
        };
        assert_eq!(coordinator.record_failure(rejected(1), &mut chain), AttemptState::Attempting(2));
        assert!(coordinator.record_failure(rejected(2), &mut chain).is_terminal());
    }
}
