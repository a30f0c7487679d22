//! Error types for static analysis
//!
//! Analysis itself is total: a syntax error or a denylisted call is reported
//! in the result, never as an `Err`. These errors only arise while building
//! an analyzer from configuration.

/// Errors raised while constructing analyzers and pattern sets
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A configured control-system pattern is not a valid regex
    #[error("invalid {operation} pattern for system '{system_kind}': {pattern}: {source}")]
    InvalidPattern {
        /// Control-system kind the pattern belongs to
        system_kind: String,
        /// `read` or `write`
        operation: &'static str,
        /// Offending pattern text
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A built-in security rule failed to compile
    #[error("invalid security rule '{rule}': {source}")]
    InvalidSecurityRule {
        /// Rule identifier
        rule: &'static str,
        #[source]
        source: regex::Error,
    },

    /// The tree-sitter Python grammar could not be loaded
    #[error("python grammar unavailable: {0}")]
    GrammarUnavailable(String),

    /// The active system kind has no pattern table
    #[error("unknown control-system kind: '{0}'")]
    UnknownSystemKind(String),
}

impl AnalysisError {
    /// Create invalid pattern error
    pub fn invalid_pattern(
        system_kind: impl Into<String>,
        operation: &'static str,
        pattern: impl Into<String>,
        source: regex::Error,
    ) -> Self {
        Self::InvalidPattern {
            system_kind: system_kind.into(),
            operation,
            pattern: pattern.into(),
            source,
        }
    }
}
