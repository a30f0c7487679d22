//! Static analyzer
//!
//! Runs, in order: syntax parse, security scan, control-system pattern
//! detection, `results` structure check. Every step is visible in the
//! returned [`BasicAnalysisResult`]; a failed parse only skips the structure
//! check.

use crate::error::AnalysisError;
use crate::patterns::{default_pattern_specs, detect_operations, OperationDetection, PatternSet, PatternSpec};
use crate::security::{RiskLevel, SecurityIssue, SecurityScanner};
use crate::structure::{has_results_mapping, RESULTS_BINDING};
use crate::syntax::{parse_python, python_parser, SyntaxIssue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Analyzer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Control system the generated code targets (`epics`, `mock`, ...)
    pub active_system_kind: String,
    /// Scripts at or above this risk are rejected before execution
    pub reject_risk_level: RiskLevel,
    /// Read/write patterns keyed by control-system kind
    pub patterns: IndexMap<String, PatternSpec>,
}

impl AnalysisConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With active control-system kind
    #[inline]
    #[must_use]
    pub fn with_system_kind(mut self, kind: impl Into<String>) -> Self {
        self.active_system_kind = kind.into();
        self
    }

    /// With rejection threshold
    #[inline]
    #[must_use]
    pub fn with_reject_risk_level(mut self, level: RiskLevel) -> Self {
        self.reject_risk_level = level;
        self
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            active_system_kind: "mock".to_string(),
            reject_risk_level: RiskLevel::High,
            patterns: default_pattern_specs(),
        }
    }
}

/// Per-candidate analysis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAnalysisResult {
    /// Source parsed without errors
    pub syntax_valid: bool,
    /// Syntax problems, empty when valid
    pub syntax_issues: Vec<SyntaxIssue>,
    /// Maximum severity of any security match
    pub security_risk_level: RiskLevel,
    /// Security matches
    pub security_issues: Vec<SecurityIssue>,
    /// Denylisted modules imported
    pub prohibited_imports: Vec<String>,
    /// A provable mapping is assigned to `results`
    pub has_result_structure: bool,
    /// Advisory notes (never cause rejection)
    pub structure_warnings: Vec<String>,
    /// Control-system operations found
    pub operations: OperationDetection,
    /// Analyzed source
    pub code: String,
    /// Source length in bytes
    pub code_length: usize,
}

/// Domain view derived from a [`BasicAnalysisResult`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainAnalysisResult {
    /// Tags such as `epics_writes`, `mock_reads`, plus legacy aliases set to true
    pub detected_operations: BTreeSet<String>,
    /// Categories such as `control_system_write`
    pub risk_categories: BTreeSet<String>,
    /// Free-form metadata
    pub domain_metadata: BTreeMap<String, serde_json::Value>,
}

impl DomainAnalysisResult {
    /// Whether the script may write to the control system
    #[inline]
    #[must_use]
    pub fn has_control_writes(&self) -> bool {
        self.risk_categories.contains(crate::patterns::CONTROL_SYSTEM_WRITE)
    }
}

/// Whether a candidate can proceed to execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AnalysisVerdict {
    /// Proceed; warnings are informational
    Accepted {
        /// Advisory notes
        warnings: Vec<String>,
    },
    /// Do not execute; regenerate
    Rejected {
        /// Short classification (`SyntaxError`, `SecurityViolation`)
        error_type: String,
        /// Human-readable reason fed back to the generator
        reason: String,
    },
}

impl AnalysisVerdict {
    /// Whether the candidate was rejected
    #[inline]
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Everything the approval gate and the pipeline need about one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Basic analysis
    pub basic: BasicAnalysisResult,
    /// Domain analysis
    pub domain: DomainAnalysisResult,
    /// Execution verdict
    pub verdict: AnalysisVerdict,
}

/// Static analyzer for generated Python
#[derive(Debug)]
pub struct StaticAnalyzer {
    scanner: SecurityScanner,
    patterns: PatternSet,
    active_system_kind: String,
    reject_risk_level: RiskLevel,
}

impl StaticAnalyzer {
    /// Build from configuration
    ///
    /// # Errors
    /// - `AnalysisError::InvalidPattern` for a malformed configured regex
    /// - `AnalysisError::UnknownSystemKind` if the active kind has no patterns
    /// - `AnalysisError::GrammarUnavailable` if tree-sitter cannot load Python
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        python_parser()?;
        let patterns = PatternSet::compile(&config.patterns)?;
        if !patterns.contains(&config.active_system_kind) {
            return Err(AnalysisError::UnknownSystemKind(
                config.active_system_kind.clone(),
            ));
        }
        Ok(Self {
            scanner: SecurityScanner::new()?,
            patterns,
            active_system_kind: config.active_system_kind.clone(),
            reject_risk_level: config.reject_risk_level,
        })
    }

    /// Active control-system kind
    #[inline]
    #[must_use]
    pub fn active_system_kind(&self) -> &str {
        &self.active_system_kind
    }

    /// Analyze a candidate script
    #[must_use]
    pub fn analyze(&self, code: &str) -> BasicAnalysisResult {
        let parsed = parse_python(code);
        let syntax_valid = parsed.is_valid();

        let security = self.scanner.scan(code);
        let operations = detect_operations(code, &self.patterns, &self.active_system_kind);

        let has_result_structure = parsed
            .tree()
            .is_some_and(|tree| has_results_mapping(tree.root_node(), code));

        let mut structure_warnings = Vec::new();
        if syntax_valid && !has_result_structure {
            tracing::warn!(
                "no provable `{}` mapping assignment found; relying on runtime check",
                RESULTS_BINDING
            );
            structure_warnings.push(format!(
                "code does not visibly assign a dictionary to `{RESULTS_BINDING}`; \
                 execution will fail unless it is built another way"
            ));
        }

        tracing::debug!(
            syntax_valid,
            risk = %security.risk_level,
            has_result_structure,
            "static analysis complete"
        );

        BasicAnalysisResult {
            syntax_valid,
            syntax_issues: parsed.into_issues(),
            security_risk_level: security.risk_level,
            security_issues: security.issues,
            prohibited_imports: security.prohibited_imports,
            has_result_structure,
            structure_warnings,
            operations,
            code: code.to_string(),
            code_length: code.len(),
        }
    }

    /// Derive the domain view
    #[must_use]
    pub fn analyze_domain(&self, basic: &BasicAnalysisResult) -> DomainAnalysisResult {
        let ops = &basic.operations;
        let mut detected_operations = ops.detected_tags.clone();
        detected_operations.extend(
            ops.legacy_aliases
                .iter()
                .filter(|(_, set)| **set)
                .map(|(name, _)| name.clone()),
        );

        let mut domain_metadata = BTreeMap::new();
        domain_metadata.insert(
            "active_system_kind".to_string(),
            serde_json::Value::from(self.active_system_kind.clone()),
        );
        domain_metadata.insert(
            "matched_pattern_count".to_string(),
            serde_json::Value::from(ops.matched_patterns.len()),
        );
        domain_metadata.insert(
            "legacy_aliases".to_string(),
            serde_json::to_value(&ops.legacy_aliases).unwrap_or_default(),
        );

        DomainAnalysisResult {
            detected_operations,
            risk_categories: ops.risk_categories.clone(),
            domain_metadata,
        }
    }

    /// Decide whether a candidate may execute
    #[must_use]
    pub fn verdict(&self, basic: &BasicAnalysisResult) -> AnalysisVerdict {
        if !basic.syntax_valid {
            let details = basic
                .syntax_issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return AnalysisVerdict::Rejected {
                error_type: "SyntaxError".to_string(),
                reason: format!("syntax error: {details}"),
            };
        }

        if basic.security_risk_level >= self.reject_risk_level {
            let details = basic
                .security_issues
                .iter()
                .filter(|i| i.severity >= self.reject_risk_level)
                .map(|i| format!("line {}: {} ({})", i.line, i.description, i.rule))
                .collect::<Vec<_>>()
                .join("; ");
            return AnalysisVerdict::Rejected {
                error_type: "SecurityViolation".to_string(),
                reason: format!(
                    "security risk {} at or above rejection threshold: {details}",
                    basic.security_risk_level
                ),
            };
        }

        AnalysisVerdict::Accepted {
            warnings: basic.structure_warnings.clone(),
        }
    }

    /// Run all steps and produce a report
    #[must_use]
    pub fn analyze_full(&self, code: &str) -> AnalysisReport {
        let basic = self.analyze(code);
        let domain = self.analyze_domain(&basic);
        let verdict = self.verdict(&basic);
        AnalysisReport {
            basic,
            domain,
            verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn analyzer(kind: &str) -> StaticAnalyzer {
        StaticAnalyzer::new(&AnalysisConfig::new().with_system_kind(kind)).unwrap()
    }

    #[test]
    fn clean_script_is_accepted() {
        let report = analyzer("epics").analyze_full("import numpy as np\nresults = {'mean': float(np.mean([1, 2]))}\n");
        assert!(report.basic.syntax_valid);
        assert!(report.basic.has_result_structure);
        assert_eq!(report.basic.security_risk_level, RiskLevel::Low);
        assert_eq!(report.verdict, AnalysisVerdict::Accepted { warnings: vec![] });
    }

    #[test]
    fn missing_results_is_only_a_warning() {
        let report = analyzer("mock").analyze_full("x = compute()\n");
        assert!(!report.basic.has_result_structure);
        assert_eq!(report.basic.structure_warnings.len(), 1);
        assert!(!report.verdict.is_rejected());
    }

    #[test]
    fn syntax_error_rejects_but_scans_still_run() {
        let report = analyzer("epics").analyze_full("def f(:\n    caput('PV', 1)\n    os.system('x')\n");
        assert!(!report.basic.syntax_valid);
        assert!(!report.basic.has_result_structure);
        assert!(report.basic.operations.has_writes);
        assert_eq!(report.basic.security_risk_level, RiskLevel::High);
        match report.verdict {
            AnalysisVerdict::Rejected { error_type, .. } => assert_eq!(error_type, "SyntaxError"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn high_risk_rejected_at_default_threshold() {
        let report = analyzer("mock").analyze_full("import subprocess\nresults = {}\n");
        match report.verdict {
            AnalysisVerdict::Rejected { error_type, reason } => {
                assert_eq!(error_type, "SecurityViolation");
                assert!(reason.contains("subprocess"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn medium_risk_passes_default_threshold() {
        let report = analyzer("mock").analyze_full("import requests\nresults = {}\n");
        assert_eq!(report.basic.security_risk_level, RiskLevel::Medium);
        assert!(!report.verdict.is_rejected());

        let strict = StaticAnalyzer::new(
            &AnalysisConfig::new().with_reject_risk_level(RiskLevel::Medium),
        )
        .unwrap();
        assert!(strict.analyze_full("import requests\nresults = {}\n").verdict.is_rejected());
    }

    #[test]
    fn domain_view_includes_legacy_aliases() {
        let a = analyzer("epics");
        let basic = a.analyze("caput('SR:C', 1)\nresults = {}\n");
        let domain = a.analyze_domain(&basic);
        assert!(domain.detected_operations.contains("epics_writes"));
        assert!(domain.has_control_writes());
        assert_eq!(
            domain.domain_metadata.get("active_system_kind"),
            Some(&serde_json::json!("epics"))
        );
    }

    #[test]
    fn code_length_and_code_preserved() {
        let code = "results = {}\n";
        let basic = analyzer("mock").analyze(code);
        assert_eq!(basic.code, code);
        assert_eq!(basic.code_length, code.len());
    }

    #[test]
    fn unknown_system_kind_rejected() {
        let err = StaticAnalyzer::new(&AnalysisConfig::new().with_system_kind("tango")).unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownSystemKind(_)));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"active_system_kind": "epics"}"#).unwrap();
        assert_eq!(config.active_system_kind, "epics");
        assert_eq!(config.reject_risk_level, RiskLevel::High);
        assert!(config.patterns.contains_key("mock"));
    }
}
