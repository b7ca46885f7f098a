use crate::error::TaskqError;
use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a queue backend.
///
/// Workers only distinguish two groups: [`is_unavailable`](Self::is_unavailable)
/// errors are retried with backoff, everything else is surfaced.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached or refused the session
    #[error("Backend connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// A stored item did not match the expected layout
    #[error("Work item encoding failed: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Source>,
    },

    #[error("Backend call exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Invalid backend configuration: {message}")]
    Configuration { message: String },

    /// A backend command ran and failed
    #[error("{operation} failed: {message}")]
    Command {
        operation: String,
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// Too many unfinished items held
    #[error("Queue is full: {message}")]
    CapacityExceeded { message: String },

    /// The caller's reservation expired and the item moved on without it
    #[error("Lease lost for work item: {item_id}")]
    LeaseLost { item_id: String },

    /// The item table could not be created
    #[error("Schema installation failed: {message}")]
    Schema { message: String },
}

impl StorageError {
    pub fn connection_with_source(message: impl Into<String>, source: Source) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn serialization_with_source(message: impl Into<String>, source: Source) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// A failed backend command, keeping the driver error as the source.
    pub fn operation_failed_with_source(
        operation: impl Into<String>,
        message: impl Into<String>,
        source: Source,
    ) -> Self {
        Self::Command {
            operation: operation.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    pub fn lease_lost(item_id: impl Into<String>) -> Self {
        Self::LeaseLost {
            item_id: item_id.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Transient failures a worker should back off from rather than report.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Unavailable { .. } | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("stored item is not valid JSON", Box::new(err))
    }
}

impl From<StorageError> for TaskqError {
    fn from(err: StorageError) -> Self {
        if err.is_unavailable() {
            return TaskqError::BackendUnavailable {
                message: err.to_string(),
            };
        }
        match err {
            StorageError::Serialization { message, .. } => TaskqError::Serialization { message },
            StorageError::Configuration { message } => TaskqError::Configuration { message },
            other => TaskqError::Storage {
                message: other.to_string(),
            },
        }
    }
}
