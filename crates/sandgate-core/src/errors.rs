//! Error types for every stage between generated text and a finished run
//!
//! Validation failures are data (`ValidationResult`), not errors, so they do
//! not appear here. Everything that can go wrong while running code, talking
//! to the scheduler or reaching an external collaborator does, and each
//! execution-facing error reports the `FailureKind` the retry layer branches on.

use thiserror::Error;

use crate::core_types::{FailureKind, ValidationResult};

/// Top-level error for callers that do not care which subsystem failed.
#[derive(Error, Debug)]
pub enum SandgateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("Job lifecycle error: {0}")]
    Job(#[from] JobError),
    #[error("Code generation error: {0}")]
    Generator(#[from] GeneratorError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("Failed to parse YAML config: {0}")]
    Parse(String),
    #[error("Invalid quantity '{value}' for {field}")]
    InvalidQuantity { field: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Environment variable '{0}' referenced by the configuration is not set")]
    MissingEnv(String),
}

/// Failure of the execution machinery itself, as opposed to the executed
/// program failing (which is reported through `ExecutionResult`).
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Could not prepare execution workspace: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("Host resources exhausted while launching '{program}': {source}")]
    ResourceExhausted {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Interpreter '{0}' could not be found")]
    InterpreterNotFound(String),
    #[error("I/O error while supervising the child process: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Job(#[from] JobError),
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutionError::Workspace(_) | ExecutionError::ResourceExhausted { .. } => {
                FailureKind::ResourceExhausted
            }
            ExecutionError::Spawn { .. } | ExecutionError::InterpreterNotFound(_) => {
                FailureKind::Fatal
            }
            ExecutionError::Io(_) => FailureKind::ResourceExhausted,
            ExecutionError::Job(job_error) => job_error.kind(),
        }
    }
}

/// Errors at the scheduling boundary and inside the job lifecycle.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler is unavailable: {0}")]
    SchedulerUnavailable(String),
    #[error("Scheduler rejected job '{job_id}': {message}")]
    Rejected { job_id: String, message: String },
    #[error("Job '{0}' is already active")]
    Duplicate(String),
    #[error("Job '{0}' is not known to the orchestrator")]
    NotFound(String),
    #[error("Job '{job_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },
    #[error("Job '{0}' watcher stopped before reaching a terminal state")]
    WatcherGone(String),
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::SchedulerUnavailable(_) => FailureKind::ResourceExhausted,
            JobError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) if *status_code >= 500 => FailureKind::ResourceExhausted,
            _ => FailureKind::Fatal,
        }
    }
}

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Code generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Code generation endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Code generation response could not be parsed: {0}")]
    Parse(String),
    #[error("Code generation response was empty")]
    EmptyResponse,
    #[error("Code generation is not configured")]
    NotConfigured,
}

/// Failures at the messaging/storage boundary. Logged by the core and left
/// to the transport's own redelivery.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to publish notification: {0}")]
    Publish(#[from] reqwest::Error),
    #[error("Notification endpoint returned HTTP {0}")]
    Status(u16),
    #[error("Failed to store result: {0}")]
    Store(#[from] std::io::Error),
}

/// Why a request never reached an executor.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Request {request_id} failed validation with {} error(s)", .validation.errors.len())]
    Validation {
        request_id: String,
        validation: ValidationResult,
    },
    #[error("Request {request_id} still failed validation after {attempts} correction attempt(s)")]
    CorrectionExhausted {
        request_id: String,
        attempts: u32,
        /// Every error from every rejected version, in order.
        errors: Vec<String>,
    },
    #[error("Request {request_id} could not generate code: {source}")]
    Generator {
        request_id: String,
        #[source]
        source: GeneratorError,
    },
}

impl PipelineError {
    pub fn request_id(&self) -> &str {
        match self {
            PipelineError::Validation { request_id, .. }
            | PipelineError::CorrectionExhausted { request_id, .. }
            | PipelineError::Generator { request_id, .. } => request_id,
        }
    }

    /// Text safe to return to the caller. Validation errors describe the
    /// caller's own code; generator failures are reduced to a summary so
    /// endpoint details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Validation { validation, .. } => {
                format!("Code validation failed: {}", validation.errors.join("; "))
            }
            PipelineError::CorrectionExhausted {
                attempts, errors, ..
            } => format!(
                "Generated code failed validation after {} correction attempt(s): {}",
                attempts,
                errors.join("; ")
            ),
            PipelineError::Generator { .. } => "Code generation is unavailable".to_string(),
        }
    }
}
