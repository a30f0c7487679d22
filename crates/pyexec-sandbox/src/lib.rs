//! pyexec Sandbox - isolated execution of generated Python
//!
//! - **Scopes**: one directory per request holding context, candidates,
//!   runner, report and artifacts
//! - **Backends**: local interpreter sub-process or a container engine,
//!   both killed on timeout or cancellation
//! - **Outcomes**: the single place where a run is classified into
//!   success, runtime failure, safety violation or timeout
//!
//! # Example
//!
//! ```rust,ignore
//! use pyexec_sandbox::{BackendConfig, CodeExecutor, ExecutionScope, Executor};
//! use std::time::Duration;
//!
//! let scope = ExecutionScope::create("_agent_data/executions", "beam_summary").await?;
//! let executor = Executor::new(BackendConfig::default().build(&[])?);
//! let record = executor.run("results = {'ok': True}", &scope, Duration::from_secs(30)).await?;
//! assert!(record.outcome.is_success());
//! ```

pub mod backend;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod runner;
pub mod scope;

pub use backend::{BackendConfig, ContainerBackend, ExecutionBackend, LocalProcessBackend};
pub use error::SandboxError;
pub use executor::{CodeExecutor, ExecutionRecord, Executor};
pub use outcome::{classify, mentions_safety_violation, ExecutionOutcome, ProcessOutput};
pub use runner::{RunnerReport, SAFETY_EXCEPTION_TYPE, SAFETY_TEXT_MARKER};
pub use scope::{ExecutionScope, ScopeId, ScopeRetention, ScopeStatus, ScopeSummary};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
