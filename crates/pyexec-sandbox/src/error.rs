//! Error types for the sandbox
//!
//! These are infrastructure failures: the scope could not be written, the
//! interpreter could not be spawned, the runner report was unreadable.
//! Failures of the *generated code* are never errors here; they are
//! [`crate::ExecutionOutcome`] variants.

use std::path::PathBuf;

/// Sandbox infrastructure errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Filesystem error inside an execution scope
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Interpreter or container engine could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Runner report exists but is not valid JSON
    #[error("malformed execution report at {path}: {source}")]
    MalformedReport {
        /// Report path
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Context or metadata could not be serialized
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend configuration is unusable
    #[error("invalid backend configuration: {0}")]
    InvalidBackend(String),
}

impl SandboxError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create spawn error for program
    pub fn spawn_error(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }
}
