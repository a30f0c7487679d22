//! Error types for the pipeline
//!
//! - Pipeline infrastructure failures (scope I/O, interpreter spawn)
//! - Code generation failures
//! - Configuration loading and validation
//!
//! Outcomes of generated code (runtime failures, safety violations,
//! timeouts) are never errors; they flow through the retry coordinator.

use pyexec_analysis::AnalysisError;
use pyexec_sandbox::SandboxError;
use std::path::PathBuf;

/// Main pipeline error type
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Analyzer could not be built
    #[error("analysis setup failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// Scope or backend failure
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),

    /// Request cannot be executed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Check if error is retryable
    ///
    /// Spawn and I/O failures can be transient; configuration and request
    /// errors are not.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Sandbox(SandboxError::Io { .. } | SandboxError::Spawn { .. })
        )
    }

    /// Check if error came from cancellation
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Code generation failures
///
/// These are recoverable: the pipeline records them in the error chain
/// with stage `generation` and tries again within the budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Completion backend failed
    #[error("completion request failed: {0}")]
    Completion(String),

    /// Reply contained no code
    #[error("no code in generator reply")]
    EmptyResponse,

    /// Strategy has nothing left to produce
    #[error("generator exhausted after {0} candidate(s)")]
    Exhausted(usize),

    /// Strategy misconfigured
    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    /// Short type name used in error chain entries
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Completion(_) => "CompletionError",
            Self::EmptyResponse => "EmptyResponse",
            Self::Exhausted(_) => "GeneratorExhausted",
            Self::Unavailable(_) => "GeneratorUnavailable",
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read config {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or shape error
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML syntax or shape error
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File extension not recognized
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Values parse but are unusable
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted field path
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

impl ConfigError {
    /// Create invalid-value error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_spawn_is_retryable() {
        let err = PipelineError::from(SandboxError::spawn_error(
            "python3",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        ));
        assert!(err.is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(PipelineError::Cancelled.is_cancelled());
    }

    #[test]
    fn config_errors_not_retryable() {
        let err = PipelineError::from(ConfigError::invalid("execution.timeout_secs", "must be > 0"));
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "configuration error: invalid value for execution.timeout_secs: must be > 0"
        );
    }

    #[test]
    fn generation_type_names() {
        assert_eq!(GenerationError::EmptyResponse.type_name(), "EmptyResponse");
        assert_eq!(
            GenerationError::Exhausted(2).to_string(),
            "generator exhausted after 2 candidate(s)"
        );
    }
}
