//! Error taxonomy for job scheduling and execution.

use thiserror::Error;

use crate::models::JobStatus;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} job {id} while it is {from}")]
    InvalidState {
        id: String,
        from: JobStatus,
        action: &'static str,
    },

    #[error("Transcode failed: {message}")]
    TranscodeExecution { message: String, output: String },

    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn invalid_state(id: impl Into<String>, from: JobStatus, action: &'static str) -> Self {
        Self::InvalidState {
            id: id.into(),
            from,
            action,
        }
    }

    pub fn transcode_failed(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::TranscodeExecution {
            message: message.into(),
            output: output.into(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Diagnostic output captured from the external process, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::TranscodeExecution { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for JobError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
