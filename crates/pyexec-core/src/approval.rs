//! Approval gate
//!
//! Decides from the analysis whether a human has to confirm a candidate
//! before it runs. The gate only decides; the pipeline stops with
//! [`crate::PipelineOutcome::AwaitingApproval`] and a resumed request
//! carries the approved code.

use pyexec_analysis::{AnalysisReport, RiskLevel};
use serde::{Deserialize, Serialize};

/// Gate decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Whether execution must wait for a human
    pub needs_approval: bool,
    /// Why
    pub reasoning: String,
}

impl ApprovalDecision {
    /// No approval needed
    pub fn approve(reasoning: impl Into<String>) -> Self {
        Self {
            needs_approval: false,
            reasoning: reasoning.into(),
        }
    }

    /// Approval needed
    pub fn require(reasoning: impl Into<String>) -> Self {
        Self {
            needs_approval: true,
            reasoning: reasoning.into(),
        }
    }
}

/// Decides whether execution needs human confirmation
pub trait ApprovalGate: Send + Sync {
    /// Evaluate a candidate's analysis
    fn evaluate(&self, analysis: &AnalysisReport) -> ApprovalDecision;
}

/// Which candidates need approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Never ask
    Disabled,
    /// Ask when the code writes to the control system
    #[default]
    ControlWrites,
    /// Ask for every candidate
    AllCode,
}

/// Approval configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Approval policy
    pub mode: ApprovalMode,
    /// Candidates at or above this security risk always need approval
    /// (ignored when `mode` is `disabled`)
    pub risk_threshold: Option<RiskLevel>,
}

/// Mode-and-threshold policy gate
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyApprovalGate {
    config: ApprovalConfig,
}

impl PolicyApprovalGate {
    /// Create gate from config
    #[must_use]
    pub fn new(config: ApprovalConfig) -> Self {
        Self { config }
    }

    /// Gate that never asks
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(ApprovalConfig {
            mode: ApprovalMode::Disabled,
            risk_threshold: None,
        })
    }

    /// Active mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ApprovalMode {
        self.config.mode
    }
}

impl ApprovalGate for PolicyApprovalGate {
    fn evaluate(&self, analysis: &AnalysisReport) -> ApprovalDecision {
        let risk = analysis.basic.security_risk_level;
        match self.config.mode {
            ApprovalMode::Disabled => ApprovalDecision::approve("approval disabled"),
            ApprovalMode::AllCode => ApprovalDecision::require("all code requires approval"),
            ApprovalMode::ControlWrites => {
                if let Some(threshold) = self.config.risk_threshold.filter(|t| risk >= *t) {
                    return ApprovalDecision::require(format!(
                        "security risk {risk} at or above approval threshold {threshold}"
                    ));
                }
                if analysis.domain.has_control_writes() {
                    let writes: Vec<&str> = analysis
                        .domain
                        .detected_operations
                        .iter()
                        .filter(|tag| tag.ends_with("_writes"))
                        .map(String::as_str)
                        .collect();
                    ApprovalDecision::require(format!(
                        "code writes to the control system ({})",
                        writes.join(", ")
                    ))
                } else {
                    ApprovalDecision::approve("no control-system writes detected")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyexec_analysis::{AnalysisConfig, StaticAnalyzer};

    fn report(code: &str) -> AnalysisReport {
        StaticAnalyzer::new(&AnalysisConfig::new().with_system_kind("epics"))
            .unwrap()
            .analyze_full(code)
    }

    #[test]
    fn control_writes_mode() {
        let gate = PolicyApprovalGate::new(ApprovalConfig::default());

        let decision = gate.evaluate(&report("caput('SR:MAG:I', 10)\nresults = {}\n"));
        assert!(decision.needs_approval);
        assert!(decision.reasoning.contains("epics_writes"));

        let decision = gate.evaluate(&report("v = caget('SR:MAG:I')\nresults = {'v': v}\n"));
        assert!(!decision.needs_approval);
    }

    #[test]
    fn all_code_and_disabled_modes() {
        let read_only = report("results = {}\n");
        let all = PolicyApprovalGate::new(ApprovalConfig {
            mode: ApprovalMode::AllCode,
            risk_threshold: None,
        });
        assert!(all.evaluate(&read_only).needs_approval);

        let writes = report("caput('X', 1)\nresults = {}\n");
        assert!(!PolicyApprovalGate::disabled().evaluate(&writes).needs_approval);
    }

    #[test]
    fn risk_threshold_applies() {
        let gate = PolicyApprovalGate::new(ApprovalConfig {
            mode: ApprovalMode::ControlWrites,
            risk_threshold: Some(RiskLevel::Medium),
        });
        let decision = gate.evaluate(&report("import pickle\ndata = pickle.loads(b'')\nresults = {}\n"));
        assert!(decision.needs_approval);
        assert!(decision.reasoning.contains("medium"));
    }

    #[test]
    fn mode_from_config_text() {
        let config: ApprovalConfig =
            serde_json::from_str(r#"{"mode": "all_code", "risk_threshold": "high"}"#).unwrap();
        assert_eq!(config.mode, ApprovalMode::AllCode);
        assert_eq!(config.risk_threshold, Some(RiskLevel::High));
    }
}
