//! Job lifecycle events
//!
//! Workers report every terminal transition of an item as a [`JobEvent`].
//! Events go to an [`EventSink`]; the default [`TracingEventSink`] writes
//! them as tracing events, and an [`EventBus`] fans one event out to several
//! sinks.
//!
//! A chain that fails is reported once: the element that exhausted its
//! retries emits a single [`JobEvent::FailedTerminal`] carrying a
//! [`ChainAbort`], and the elements after it never run and emit nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::Failure;

/// Chain elements dropped because an earlier element failed terminally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAbort {
    pub chain_id: String,
    /// Position of the failed element
    pub position: u32,
    /// Number of later elements that will never be enqueued
    pub skipped: usize,
}

/// Something that happened to a work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The handler returned successfully and the item was acknowledged
    Succeeded {
        item_id: String,
        job: String,
        queue: String,
        attempt_count: u32,
        duration_ms: u64,
        chain_id: Option<String>,
        chain_position: Option<u32>,
    },

    /// A retryable failure was rescheduled
    Retrying {
        item_id: String,
        job: String,
        queue: String,
        /// Retry number, starting at 1
        attempt: u32,
        available_at: DateTime<Utc>,
        error: String,
    },

    /// The item was moved to the dead-letter sink
    FailedTerminal {
        item_id: String,
        job: String,
        queue: String,
        failure: Failure,
        chain: Option<ChainAbort>,
    },

    /// A backend call may have partially applied and needs operator attention
    Inconsistency {
        item_id: String,
        job: String,
        operation: String,
        message: String,
    },
}

impl JobEvent {
    /// Signature of the job the event is about
    pub fn job(&self) -> &str {
        match self {
            JobEvent::Succeeded { job, .. }
            | JobEvent::Retrying { job, .. }
            | JobEvent::FailedTerminal { job, .. }
            | JobEvent::Inconsistency { job, .. } => job,
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            JobEvent::Succeeded { item_id, .. }
            | JobEvent::Retrying { item_id, .. }
            | JobEvent::FailedTerminal { item_id, .. }
            | JobEvent::Inconsistency { item_id, .. } => item_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Succeeded { .. } => "succeeded",
            JobEvent::Retrying { .. } => "retrying",
            JobEvent::FailedTerminal { .. } => "failed_terminal",
            JobEvent::Inconsistency { .. } => "inconsistency",
        }
    }

    pub fn is_failed_terminal(&self) -> bool {
        matches!(self, JobEvent::FailedTerminal { .. })
    }
}

/// Receiver of job events
///
/// `emit` is called from worker tasks outside any backend call; it must
/// return quickly and must not panic.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &JobEvent);
}

impl<F> EventSink for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn emit(&self, event: &JobEvent) {
        self(event)
    }
}

/// Writes events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &JobEvent) {
        match event {
            JobEvent::Succeeded {
                item_id,
                job,
                queue,
                attempt_count,
                duration_ms,
                chain_id,
                chain_position,
            } => {
                info!(
                    item_id = %item_id,
                    job = %job,
                    queue = %queue,
                    attempt = attempt_count,
                    duration_ms = duration_ms,
                    chain_id = chain_id.as_deref().unwrap_or(""),
                    chain_position = chain_position.map(i64::from).unwrap_or(-1),
                    "Job succeeded"
                );
            }
            JobEvent::Retrying {
                item_id,
                job,
                queue,
                attempt,
                available_at,
                error,
            } => {
                warn!(
                    item_id = %item_id,
                    job = %job,
                    queue = %queue,
                    attempt = attempt,
                    available_at = %available_at,
                    error = %error,
                    "Job failed, retry scheduled"
                );
            }
            JobEvent::FailedTerminal {
                item_id,
                job,
                queue,
                failure,
                chain,
            } => match chain {
                Some(abort) => error!(
                    item_id = %item_id,
                    job = %job,
                    queue = %queue,
                    kind = %failure.kind,
                    attempts = failure.attempt_count,
                    chain_id = %abort.chain_id,
                    position = abort.position,
                    skipped = abort.skipped,
                    error = %failure.message,
                    "Job failed terminally, chain aborted"
                ),
                None => error!(
                    item_id = %item_id,
                    job = %job,
                    queue = %queue,
                    kind = %failure.kind,
                    attempts = failure.attempt_count,
                    error = %failure.message,
                    "Job failed terminally"
                ),
            },
            JobEvent::Inconsistency {
                item_id,
                job,
                operation,
                message,
            } => {
                error!(
                    item_id = %item_id,
                    job = %job,
                    operation = %operation,
                    error = %message,
                    "Backend state may be inconsistent, operator action required"
                );
            }
        }
    }
}

/// Fans events out to several sinks
///
/// The tracing sink is always included so events are never silent.
#[derive(Clone)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// A bus writing to tracing only
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(TracingEventSink)],
        }
    }

    /// Add a sink
    pub fn subscribe(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.subscribe(sink);
        self
    }

    /// Number of sinks including the tracing sink
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &JobEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
