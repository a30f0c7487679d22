//! Pipeline configuration
//!
//! One [`PipelineConfig`] is handed to [`crate::ExecutionPipeline::new`];
//! nothing is read from globals. Files are TOML or YAML, every section is
//! optional and falls back to its defaults.
//!
//! ```toml
//! [retry]
//! default_max_attempts = 3
//!
//! [execution]
//! timeout_secs = 600
//! env_allowlist = ["PATH", "EPICS_CA_ADDR_LIST"]
//! backend = { type = "container", engine = "podman", image = "facility/py:3.11" }
//!
//! [analysis]
//! active_system_kind = "epics"
//!
//! [approval]
//! mode = "control_writes"
//!
//! [scope]
//! base_dir = "_agent_data/executions"
//! retention = "delete_on_success"
//!
//! [generator]
//! kind = "llm"
//! ```

use crate::approval::ApprovalConfig;
use crate::error::ConfigError;
use crate::generator::GeneratorKind;
use crate::types::DEFAULT_MAX_ATTEMPTS;
use pyexec_analysis::{AnalysisConfig, PatternSet};
use pyexec_sandbox::{BackendConfig, ScopeRetention};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry budget
    pub retry: RetryConfig,
    /// Execution backend and limits
    pub execution: ExecutionConfig,
    /// Static analysis
    pub analysis: AnalysisConfig,
    /// Approval policy
    pub approval: ApprovalConfig,
    /// Scope placement and retention
    pub scope: ScopeConfig,
    /// Generation strategy
    pub generator: GeneratorKind,
}

/// Retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Budget for requests that do not set one
    pub default_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock limit per attempt
    pub timeout_secs: u64,
    /// Where code runs
    pub backend: BackendConfig,
    /// Host environment variables passed to the code
    pub env_allowlist: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            backend: BackendConfig::default(),
            env_allowlist: ["PATH", "HOME", "LANG", "EPICS_CA_ADDR_LIST", "EPICS_CA_AUTO_ADDR_LIST"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ExecutionConfig {
    /// Timeout as a duration
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scope settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Directory under which scopes are created
    pub base_dir: PathBuf,
    /// What happens to a scope when its request ends
    pub retention: ScopeRetention,
    /// Write `artifacts/attempt_NN.ipynb` after every executed attempt
    pub write_notebooks: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("_agent_data/executions"),
            retention: ScopeRetention::default(),
            write_notebooks: true,
        }
    }
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With default retry budget
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.default_max_attempts = max_attempts;
        self
    }

    /// With per-attempt timeout
    #[inline]
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.execution.timeout_secs = secs;
        self
    }

    /// With execution backend
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.execution.backend = backend;
        self
    }

    /// With active control-system kind
    #[must_use]
    pub fn with_system_kind(mut self, kind: impl Into<String>) -> Self {
        self.analysis.active_system_kind = kind.into();
        self
    }

    /// With approval policy
    #[inline]
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval = approval;
        self
    }

    /// With scope base directory
    #[must_use]
    pub fn with_scope_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scope.base_dir = dir.into();
        self
    }

    /// With scope retention
    #[inline]
    #[must_use]
    pub fn with_retention(mut self, retention: ScopeRetention) -> Self {
        self.scope.retention = retention;
        self
    }

    /// With generation strategy
    #[must_use]
    pub fn with_generator(mut self, generator: GeneratorKind) -> Self {
        self.generator = generator;
        self
    }

    /// Parse TOML
    ///
    /// # Errors
    /// Returns `ConfigError::Toml` on syntax or shape errors, or the first
    /// validation failure.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML
    ///
    /// # Errors
    /// Returns `ConfigError::Yaml` on syntax or shape errors, or the first
    /// validation failure.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file is unreadable, has another
    /// extension, or fails to parse or validate.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("<none>").to_string())),
        }
    }

    /// Check values are usable
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.timeout_secs == 0 {
            return Err(ConfigError::invalid("execution.timeout_secs", "must be greater than zero"));
        }
        self.execution
            .backend
            .validate()
            .map_err(|e| ConfigError::invalid("execution.backend", e.to_string()))?;

        let patterns = PatternSet::compile(&self.analysis.patterns)
            .map_err(|e| ConfigError::invalid("analysis.patterns", e.to_string()))?;
        if !patterns.contains(&self.analysis.active_system_kind) {
            return Err(ConfigError::invalid(
                "analysis.active_system_kind",
                format!("no patterns configured for `{}`", self.analysis.active_system_kind),
            ));
        }

        if self.scope.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("scope.base_dir", "must not be empty"));
        }
        if let GeneratorKind::Static { code } = &self.generator {
            if code.trim().is_empty() {
                return Err(ConfigError::invalid("generator.code", "static generator needs code"));
            }
        }
        Ok(())
    }
}
