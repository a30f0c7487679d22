//! pyexec Core - bounded-retry execution of generated Python
//!
//! Drives one request through `generate -> analyze -> approve -> execute ->
//! classify -> decide`:
//! - Generates candidates through a sealed [`CodeGenerator`] strategy
//! - Rejects broken or risky candidates before they run
//! - Defers control-system writes to a human through the [`ApprovalGate`]
//! - Retries ordinary failures with the accumulated [`ErrorChain`]
//! - Terminates immediately on channel limits violations
//!
//! # Example
//!
//! ```rust,ignore
//! use pyexec_core::{ExecutionPipeline, PipelineConfig, StaticCodeGenerator};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::new().with_system_kind("epics");
//! let generator = Arc::new(StaticCodeGenerator::new("results = {'ok': True}"));
//! let pipeline = ExecutionPipeline::new(config, generator)?;
//!
//! let request = pipeline.request("is the beam up?", "read SR:DCCT").build();
//! let outcome = pipeline.execute(&request).await?;
//! println!("succeeded after {} attempt(s)", outcome.attempts());
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod config;
pub mod error;
pub mod generator;
pub mod notebook;
pub mod pipeline;
pub mod retry;
pub mod types;

pub use approval::{ApprovalConfig, ApprovalDecision, ApprovalGate, ApprovalMode, PolicyApprovalGate};
pub use config::{ExecutionConfig, PipelineConfig, RetryConfig, ScopeConfig};
pub use error::{ConfigError, GenerationError, PipelineError};
pub use generator::{
    build_generator, build_prompt, extract_python_code, CodeGenerator, CompletionClient, GeneratorKind,
    LlmCodeGenerator, PromptTemplate, ScriptedCodeGenerator, StaticCodeGenerator,
};
pub use pipeline::{ExecutionPipeline, PipelineOutcome};
pub use retry::{AttemptState, FailureReason, RetryCoordinator};
pub use types::{
    AttemptDisposition, AttemptRecord, ErrorChain, ErrorStage, ExecutionError, ExecutionRequest,
    ExecutionRequestBuilder, RequestId, DEFAULT_MAX_ATTEMPTS,
};

#[doc(hidden)]
pub mod __private {
    pub use super::generator::private::Sealed;
}

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with pyexec Core
    pub use crate::{
        ApprovalGate, CodeGenerator, ErrorChain, ExecutionPipeline, ExecutionRequest, PipelineConfig,
        PipelineOutcome,
    };
    pub use pyexec_sandbox::{CodeExecutor, ExecutionOutcome};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
