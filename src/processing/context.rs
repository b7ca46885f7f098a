//! Execution context and handler errors
//!
//! This module contains the types a [`Job`](super::Job) handler receives and
//! returns while it runs.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::core::WorkItem;
use crate::error::TaskqError;

/// Information about the execution a handler is part of
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    /// Id of the work item being run
    pub item_id: String,
    /// Worker running the item; `"sync"` for inline dispatch
    pub worker_id: String,
    /// Retries already scheduled before this execution
    pub attempt: u32,
    pub chain_id: Option<String>,
    pub chain_position: Option<u32>,
    /// Message of the previous failure, if this is a retry
    pub previous_error: Option<String>,
    /// When this execution started
    pub started_at: DateTime<Utc>,
}

impl JobContext {
    /// Context for running `item` on `worker_id`.
    pub fn for_item(item: &WorkItem, worker_id: impl Into<String>) -> Self {
        Self {
            item_id: item.id.clone(),
            worker_id: worker_id.into(),
            attempt: item.attempt_count,
            chain_id: item.chain_id.clone(),
            chain_position: item.chain_position,
            previous_error: item.last_error.clone(),
            started_at: Utc::now(),
        }
    }

    /// Execution duration so far
    pub fn duration(&self) -> Duration {
        Utc::now() - self.started_at
    }

    /// Check if this is a retry attempt
    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }
}

/// Failure reported by a handler
///
/// Retryable errors go through the connection's retry policy; fatal ones
/// dead-letter the item on the spot.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    /// A failure worth another attempt
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure no retry can fix, such as invalid input
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::retryable(message)
    }
}

impl From<TaskqError> for JobError {
    fn from(err: TaskqError) -> Self {
        match err {
            TaskqError::ArgDecode { .. } => Self::fatal(err.to_string()),
            _ => Self::retryable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Arg;

    #[test]
    fn test_context_from_item() {
        let mut item = WorkItem::new("send_email", &[Arg::from("a@b.com")], "q").unwrap();
        item.attempt_count = 2;
        item.last_error = Some("smtp down".into());

        let context = JobContext::for_item(&item, "worker-1");
        assert_eq!(context.item_id, item.id);
        assert_eq!(context.worker_id, "worker-1");
        assert_eq!(context.attempt, 2);
        assert!(context.is_retry());
        assert_eq!(context.previous_error.as_deref(), Some("smtp down"));
        assert_eq!(context.chain_id, None);
    }

    #[test]
    fn test_job_error_conversions() {
        let err: JobError = "timeout talking to gateway".into();
        assert!(err.retryable);
        assert_eq!(err.to_string(), "timeout talking to gateway");

        assert!(!JobError::fatal("bad card number").retryable);

        let decode: JobError = TaskqError::ArgDecode {
            message: "expected string".into(),
        }
        .into();
        assert!(!decode.retryable);

        let storage: JobError = TaskqError::Storage {
            message: "oops".into(),
        }
        .into();
        assert!(storage.retryable);
    }
}
