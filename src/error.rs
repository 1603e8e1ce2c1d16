//! Error types for the job orchestration core.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Sub-task error: {0}")]
    SubTask(#[from] SubTaskError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Message routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Router {router} is no longer running")]
    Closed { router: String },
}

/// Envelope rejected while decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("{kind} envelope must carry a status")]
    MissingStatus { kind: String },
}

/// Worker lifecycle and job-body errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {worker} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        worker: String,
        state: String,
        target: String,
    },

    #[error("Setup failed for {worker}: {reason}")]
    Setup { worker: String, reason: String },

    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Worker {worker} panicked: {message}")]
    Panicked { worker: String, message: String },

    #[error("Worker {worker} was cancelled")]
    Cancelled { worker: String },

    #[error("Job queue for {worker} is closed")]
    QueueClosed { worker: String },

    #[error("Job {id} failed: {reason}")]
    JobFailed { id: Uuid, reason: String },
}

impl From<anyhow::Error> for WorkerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

/// Failure of one sub-task inside a pooled batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubTaskError {
    #[error("Sub-task {index} failed: {reason}")]
    Failed { index: usize, reason: String },

    #[error("Sub-task {index} panicked: {message}")]
    Panicked { index: usize, message: String },

    #[error("Sub-task {index} was aborted before completion")]
    Aborted { index: usize },
}

impl SubTaskError {
    /// Submission index of the sub-task that failed.
    pub fn index(&self) -> usize {
        match self {
            Self::Failed { index, .. } | Self::Panicked { index, .. } | Self::Aborted { index } => {
                *index
            }
        }
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
