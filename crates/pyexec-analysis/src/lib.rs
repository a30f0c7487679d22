//! pyexec Analysis - static checks for generated Python
//!
//! Pure, synchronous analysis run on every candidate script before it is
//! allowed anywhere near an interpreter:
//! - **Syntax**: tree-sitter Python parse, error and missing nodes reported
//! - **Security**: denylisted builtins, calls and imports (regex, text level)
//! - **Patterns**: control-system read/write detection keyed by system kind
//! - **Structure**: whether a mapping is assigned to `results`
//!
//! # Example
//!
//! ```rust,ignore
//! use pyexec_analysis::{AnalysisConfig, StaticAnalyzer};
//!
//! let analyzer = StaticAnalyzer::new(&AnalysisConfig::new().with_system_kind("epics"))?;
//! let report = analyzer.analyze_full("from epics import caput\ncaput('SR:DCCT', 1)\nresults = {}\n");
//!
//! assert!(report.domain.has_control_writes());
//! ```

pub mod analyzer;
pub mod error;
pub mod patterns;
pub mod security;
pub mod structure;
pub mod syntax;

pub use analyzer::{
    AnalysisConfig, AnalysisReport, AnalysisVerdict, BasicAnalysisResult, DomainAnalysisResult,
    StaticAnalyzer,
};
pub use error::AnalysisError;
pub use patterns::{
    default_pattern_specs, detect_operations, MatchedPattern, Operation, OperationDetection,
    PatternSet, PatternSpec, CONTROL_SYSTEM_READ, CONTROL_SYSTEM_WRITE,
};
pub use security::{RiskLevel, SecurityIssue, SecurityScan, SecurityScanner};
pub use structure::{validate_result_structure, RESULTS_BINDING};
pub use syntax::{parse_python, ParsedSource, SyntaxIssue};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
