//! Control-system operation detection
//!
//! Patterns are regexes over raw text, keyed by control-system kind. Detection
//! favours over-reporting: a write pattern anywhere in the file marks the
//! script as writing, whether or not that line would ever run.

use crate::error::AnalysisError;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Risk category attached whenever any write pattern matches
pub const CONTROL_SYSTEM_WRITE: &str = "control_system_write";

/// Risk category attached whenever any read pattern matches
pub const CONTROL_SYSTEM_READ: &str = "control_system_read";

/// System kind that carries the legacy `epics_*` flags
pub const EPICS: &str = "epics";

/// Read/write patterns for one control-system kind (configuration form)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Patterns that indicate a channel read
    #[serde(default)]
    pub read: Vec<String>,
    /// Patterns that indicate a channel write
    #[serde(default)]
    pub write: Vec<String>,
}

impl PatternSpec {
    /// Create from string slices
    #[must_use]
    pub fn new(read: &[&str], write: &[&str]) -> Self {
        Self {
            read: read.iter().map(|p| (*p).to_string()).collect(),
            write: write.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

/// Built-in pattern tables
///
/// - `epics`: pyepics function API and `PV` object methods
/// - `mock`: the facility connector's generic channel API
#[must_use]
pub fn default_pattern_specs() -> IndexMap<String, PatternSpec> {
    let mut specs = IndexMap::new();
    specs.insert(
        EPICS.to_string(),
        PatternSpec::new(
            &[r"\bcaget\s*\(", r"\.get\s*\(", r"\bcaget_many\s*\("],
            &[r"\bcaput\s*\(", r"\.put\s*\(", r"\bcaput_many\s*\("],
        ),
    );
    specs.insert(
        "mock".to_string(),
        PatternSpec::new(
            &[r"\bread_channel\s*\(", r"\bread_channels\s*\("],
            &[r"\bwrite_channel\s*\(", r"\bwrite_channels\s*\("],
        ),
    );
    specs
}

/// Kind of channel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Channel read
    Read,
    /// Channel write
    Write,
}

impl Operation {
    /// Tag suffix (`reads` / `writes`)
    #[inline]
    #[must_use]
    pub fn tag_suffix(&self) -> &'static str {
        match self {
            Operation::Read => "reads",
            Operation::Write => "writes",
        }
    }
}

/// One pattern hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPattern {
    /// Control-system kind the pattern belongs to
    pub system_kind: String,
    /// Read or write
    pub operation: Operation,
    /// Pattern source text
    pub pattern: String,
    /// 1-based line of the first match
    pub line: usize,
}

/// Result of scanning a script for control-system operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDetection {
    /// Any read pattern matched, for any kind
    pub has_reads: bool,
    /// Any write pattern matched, for any kind
    pub has_writes: bool,
    /// Every pattern that matched
    pub matched_patterns: Vec<MatchedPattern>,
    /// `epics_reads` / `epics_writes`; populated only when the active kind is `epics`
    pub legacy_aliases: BTreeMap<String, bool>,
    /// `<kind>_reads` / `<kind>_writes` for every kind that matched
    pub detected_tags: BTreeSet<String>,
    /// `control_system_write` / `control_system_read`
    pub risk_categories: BTreeSet<String>,
}

impl OperationDetection {
    /// Whether a specific kind matched for an operation
    #[must_use]
    pub fn matched(&self, system_kind: &str, operation: Operation) -> bool {
        self.matched_patterns
            .iter()
            .any(|m| m.system_kind == system_kind && m.operation == operation)
    }
}

#[derive(Debug, Clone)]
struct CompiledKind {
    read: Vec<Regex>,
    write: Vec<Regex>,
}

/// Compiled pattern tables
#[derive(Debug, Clone)]
pub struct PatternSet {
    kinds: IndexMap<String, CompiledKind>,
}

impl PatternSet {
    /// Compile pattern specs
    ///
    /// # Errors
    /// Returns `AnalysisError::InvalidPattern` naming the first bad regex.
    pub fn compile(specs: &IndexMap<String, PatternSpec>) -> Result<Self, AnalysisError> {
        let mut kinds = IndexMap::with_capacity(specs.len());
        for (kind, spec) in specs {
            let read = compile_all(kind, "read", &spec.read)?;
            let write = compile_all(kind, "write", &spec.write)?;
            kinds.insert(kind.clone(), CompiledKind { read, write });
        }
        Ok(Self { kinds })
    }

    /// Compile the built-in tables
    ///
    /// # Errors
    /// Only if a built-in pattern is malformed.
    pub fn builtin() -> Result<Self, AnalysisError> {
        Self::compile(&default_pattern_specs())
    }

    /// Whether a kind is known
    #[inline]
    #[must_use]
    pub fn contains(&self, system_kind: &str) -> bool {
        self.kinds.contains_key(system_kind)
    }

    /// Known kinds, in configuration order
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

fn compile_all(
    kind: &str,
    operation: &'static str,
    patterns: &[String],
) -> Result<Vec<Regex>, AnalysisError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| AnalysisError::invalid_pattern(kind, operation, p, source))
        })
        .collect()
}

/// Scan source text for control-system reads and writes
///
/// All kinds are searched. `active_system_kind` only decides whether the
/// legacy `epics_reads` / `epics_writes` flags are emitted.
#[must_use]
pub fn detect_operations(
    code: &str,
    patterns: &PatternSet,
    active_system_kind: &str,
) -> OperationDetection {
    let mut detection = OperationDetection::default();

    for (kind, compiled) in &patterns.kinds {
        for (operation, regexes) in [
            (Operation::Read, &compiled.read),
            (Operation::Write, &compiled.write),
        ] {
            for regex in regexes {
                let Some(found) = regex.find(code) else {
                    continue;
                };
                let line = code[..found.start()].matches('\n').count() + 1;
                detection.matched_patterns.push(MatchedPattern {
                    system_kind: kind.clone(),
                    operation,
                    pattern: regex.as_str().to_string(),
                    line,
                });
                detection
                    .detected_tags
                    .insert(format!("{kind}_{}", operation.tag_suffix()));
                match operation {
                    Operation::Read => detection.has_reads = true,
                    Operation::Write => detection.has_writes = true,
                }
            }
        }
    }

    if detection.has_writes {
        detection
            .risk_categories
            .insert(CONTROL_SYSTEM_WRITE.to_string());
    }
    if detection.has_reads {
        detection
            .risk_categories
            .insert(CONTROL_SYSTEM_READ.to_string());
    }

    if active_system_kind == EPICS {
        detection
            .legacy_aliases
            .insert("epics_writes".to_string(), detection.has_writes);
        detection
            .legacy_aliases
            .insert("epics_reads".to_string(), detection.has_reads);
    }

    tracing::debug!(
        reads = detection.has_reads,
        writes = detection.has_writes,
        matches = detection.matched_patterns.len(),
        "control-system pattern scan complete"
    );

    detection
}
