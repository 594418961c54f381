//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

use crate::pipeline::PipelineError;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the dispatch kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed job spec or experiment; nothing was created.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown job, stage or handler.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal job status transition or update of a terminal job.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// A job ended `failed`; carries the stage's original error message.
    #[error("stage failed (job {job_id}): {message}")]
    StageFailed { job_id: String, message: String },

    /// The job's own deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller-side bound passed to `await_job` elapsed first.
    #[error("await timed out: {0}")]
    AwaitTimeout(String),

    /// Explicit cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Sequential or parallel pipeline failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable tag, used in telemetry metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::StateTransition(_) => "state_transition",
            Error::StageFailed { .. } => "stage_failed",
            Error::Timeout(_) => "timeout",
            Error::AwaitTimeout(_) => "await_timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Pipeline(_) => "pipeline",
            Error::Internal(_) => "internal",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn stage_failed(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn await_timeout(msg: impl Into<String>) -> Self {
        Self::AwaitTimeout(msg.into())
    }
}
