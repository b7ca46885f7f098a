//! Error types for taskq.
//!
//! Every fallible public operation returns [`TaskqError`] through the
//! crate-wide [`Result`] alias. Backend calls use
//! [`StorageError`](crate::storage::StorageError) internally and convert
//! into this type at the dispatch boundary.

use thiserror::Error;

/// The main error type for taskq operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskqError {
    /// Invalid or missing configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Two job definitions share a signature
    #[error("Duplicate job signature: {signature}")]
    DuplicateSignature { signature: String },

    /// A connection name has no configuration entry
    #[error("Unknown queue connection: {connection}")]
    UnknownConnection { connection: String },

    /// The backend rejected a dispatch write
    #[error("Enqueue failed: {message}")]
    EnqueueFailed { message: String },

    /// A work item names a job that is not registered
    #[error("Unknown job: {signature}")]
    UnknownJob { signature: String },

    /// Work item arguments could not be decoded
    #[error("Argument decode failed: {message}")]
    ArgDecode { message: String },

    /// The job's own logic failed
    #[error("Job handler failed: {message}")]
    Handler { message: String },

    /// The backend could not be reached
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    /// Invalid work item state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Other storage-level failures
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// A worker task panicked or was cancelled before reporting
    #[error("Worker error: {message}")]
    Worker { message: String },
}

impl TaskqError {
    /// Build a [`TaskqError::Configuration`] from any message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Errors that are fatal at startup and must never be retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::DuplicateSignature { .. }
                | Self::UnknownConnection { .. }
        )
    }
}

impl From<serde_json::Error> for TaskqError {
    fn from(err: serde_json::Error) -> Self {
        TaskqError::Serialization {
            message: err.to_string(),
        }
    }
}

/// A specialized Result type for taskq operations.
pub type Result<T> = std::result::Result<T, TaskqError>;
