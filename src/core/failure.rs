//! Terminal failure records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::work_item::WorkItem;

/// Why an item stopped being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No job registered under the item's signature
    UnknownJob,
    /// The argument payload could not be decoded
    ArgDecode,
    /// The handler returned an error
    Handler,
    /// The handler exceeded the configured job timeout
    Timeout,
    /// Reservations kept lapsing until the retry budget ran out
    LeaseExpired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::UnknownJob => "unknown_job",
            FailureKind::ArgDecode => "arg_decode",
            FailureKind::Handler => "handler",
            FailureKind::Timeout => "timeout",
            FailureKind::LeaseExpired => "lease_expired",
        }
    }

    /// Kinds that retrying can never fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureKind::UnknownJob | FailureKind::ArgDecode)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure observed while processing one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Retries that had been scheduled when the failure became terminal
    pub attempt_count: u32,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt_count: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt_count,
        }
    }
}

/// An item held in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: WorkItem,
    pub failure: Failure,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(item: WorkItem, failure: Failure) -> Self {
        Self {
            item,
            failure,
            failed_at: Utc::now(),
        }
    }
}
