//! Safe execution of generated Python code.
//!
//! This crate takes untrusted, model-generated Python source and turns it into
//! a result without letting it touch the host it runs on.
//!
//! # Architecture Overview
//!
//! - **Analysis**: one parse of the source into the facts every later stage reads
//! - **Validation**: static rejection of file, OS and network access and of unknown imports
//! - **Classification**: deterministic routing to the lightweight or heavy tier
//! - **Execution**: a sandboxed child process for lightweight code, scheduler jobs for heavy code
//! - **Retries**: a closed failure taxonomy deciding what is worth another attempt
//! - **Pipeline**: the request path tying the stages together, with optional code generation
//! - **Configuration**: YAML with environment substitution and validated defaults

pub mod analysis;
pub mod classifier;
pub mod config;
pub mod core_types;
pub mod errors;
pub mod executors;
pub mod llm;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod validator;

pub use classifier::{Classification, ClassificationReason, Classifier};
pub use config::*;
pub use core_types::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionTier, FailureKind, Quantity,
    ResourceLimits, ValidationResult,
};
pub use errors::{
    ConfigError, ExecutionError, GeneratorError, JobError, PipelineError, SandgateError,
    TransportError,
};
pub use executors::{ActiveExecutions, Executor, SecureExecutor};
pub use llm::{CodeGenerator, HttpCodeGenerator};
pub use orchestrator::{DockerScheduler, HeavyExecutor, JobOrchestrator, JobScheduler};
pub use pipeline::{GenerationParams, PipelineResponse, RequestPipeline};
pub use retry::{CorrectionPolicy, RetryCoordinator, RetryPolicy};
pub use validator::Validator;

#[cfg(test)]
pub mod test_utils;
