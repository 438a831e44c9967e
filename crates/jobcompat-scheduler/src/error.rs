use jobcompat_core::{BackendKind, JobId};
use thiserror::Error;

use crate::platform::PlatformError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No available backend satisfies the request's hard requirements.
    /// A configuration problem: never retried.
    #[error("No compatible backend for job {id}: {reason}")]
    NoCompatibleBackend { id: JobId, reason: String },

    /// The platform refused the registration. The store entry is kept so
    /// boot repair can try again.
    #[error("Backend {backend} failed to register job {id}: {source}")]
    AdapterRegistrationFailed {
        id: JobId,
        backend: BackendKind,
        #[source]
        source: PlatformError,
    },

    /// Durable read or write failed.
    #[error("Store I/O failure: {0}")]
    StoreIo(#[from] rusqlite::Error),

    /// A stored row or payload could not be (de)serialised.
    #[error("Store I/O failure: {0}")]
    StoreCodec(#[from] serde_json::Error),

    /// The request builder rejected the request.
    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// Every positive id up to `last` is taken.
    #[error("Job id space exhausted after {last}")]
    IdSpaceExhausted { last: JobId },
}

impl SchedulerError {
    /// Short, stable error code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::NoCompatibleBackend { .. } => "NO_COMPATIBLE_BACKEND",
            SchedulerError::AdapterRegistrationFailed { .. } => "ADAPTER_REGISTRATION_FAILED",
            SchedulerError::StoreIo(_) | SchedulerError::StoreCodec(_) => "STORE_IO_FAILURE",
            SchedulerError::InvalidRequest(_) => "INVALID_REQUEST",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::IdSpaceExhausted { .. } => "ID_SPACE_EXHAUSTED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
