//! Error Types
//!
//! Error taxonomy shared across the engine, the persistence store and the
//! worker-facing interfaces.
//!
//! Step-level failures ([`StepError`]) are recorded as data on the step and in
//! the run's result map; they never abort a run. [`EngineError`] is reserved
//! for failures the caller has to act on.

use std::path::PathBuf;

use thiserror::Error;

use crate::execution::ExecutionSummary;

/// Failure of a single step dispatch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// No registered worker advertises the step's capability.
    #[error("no worker available for capability '{capability}'")]
    WorkerNotFound { capability: String },

    /// The worker raised an error while handling the message.
    #[error("dispatch to '{agent}' failed: {message}")]
    DispatchFailure { agent: String, message: String },

    /// The worker replied but reported an unsuccessful outcome.
    #[error("step reported failure: {0}")]
    StepFailure(String),

    /// A retryable outcome persisted through every allowed attempt.
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl StepError {
    /// Short machine-readable label, used as the monitor's error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerNotFound { .. } => "worker_not_found",
            Self::DispatchFailure { .. } => "dispatch_failure",
            Self::StepFailure(_) => "step_failure",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Error raised by a worker or registry collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct WorkerError(pub String);

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from the durable workflow store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid workflow id '{0}'")]
    InvalidId(String),

    #[error("invalid stored record for '{id}': {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("workflow '{0}' has no saved state")]
    NotFound(String),

    #[error("workflow '{id}' has no history version {version}")]
    VersionNotFound { id: String, version: u64 },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the execution engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("step '{step}' not found in workflow '{workflow}'")]
    StepNotFound { workflow: String, step: String },

    #[error("step '{step}' already exists in workflow '{workflow}'")]
    DuplicateStep { workflow: String, step: String },

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    /// A concurrently scheduled step task died outside the step boundary.
    #[error("step task for '{step}' failed: {message}")]
    TaskFailed { step: String, message: String },

    /// A transactional run failed and the workflow was restored to its
    /// last committed snapshot.
    #[error("workflow '{workflow_id}' rolled back: {reason}")]
    TransactionRollback {
        workflow_id: String,
        reason: String,
        summary: Box<ExecutionSummary>,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors loading configuration or definition files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid definition:\n{0}")]
    Invalid(String),
}
