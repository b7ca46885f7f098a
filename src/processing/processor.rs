//! Job processor for executing individual work items
//!
//! This module contains the JobProcessor that takes one fetched item through
//! its lifecycle: lookup, argument decoding, handler execution and the
//! finishing backend call (complete, retry or dead-letter). While the
//! handler runs, the item's lease is renewed every third of its length.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::context::{JobContext, JobError};
use super::events::{ChainAbort, EventBus, EventSink, JobEvent};
use super::{Job, JobRegistry};
use crate::config::QueueConfig;
use crate::core::{Arg, Failure, FailureKind, WorkItem};
use crate::storage::{Storage, StorageError};

/// How processing of one item ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and the item was acknowledged
    Succeeded,
    /// A retry was scheduled
    Retried,
    /// The item was moved to the dead-letter sink
    DeadLettered,
    /// The finishing backend call failed; the lease will make the item
    /// fetchable again
    Inconsistent,
}

/// Executes a handler, turning timeouts and panics into failures.
pub(crate) async fn run_handler(
    job: &dyn Job,
    args: &[Arg],
    context: &JobContext,
    timeout: Option<Duration>,
) -> Result<(), (FailureKind, JobError)> {
    let guarded = AssertUnwindSafe(job.handle(args, context)).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                return Err((
                    FailureKind::Timeout,
                    JobError::retryable(format!("Job timed out after {:?}", limit)),
                ));
            }
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err((FailureKind::Handler, err)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err((
                FailureKind::Handler,
                JobError::retryable(format!("Job panicked: {}", message)),
            ))
        }
    }
}

/// Job processor that executes items and records their outcome
pub struct JobProcessor {
    registry: Arc<JobRegistry>,
    storage: Arc<dyn Storage>,
    config: QueueConfig,
    worker_id: String,
    events: Arc<dyn EventSink>,
}

impl JobProcessor {
    /// Create a new job processor reporting to tracing only
    pub fn new(registry: Arc<JobRegistry>, storage: Arc<dyn Storage>, config: QueueConfig) -> Self {
        Self {
            registry,
            storage,
            config,
            worker_id: "processor".to_string(),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Process a single fetched item
    pub async fn process(&self, mut item: WorkItem) -> Outcome {
        info!(
            item_id = %item.id,
            job = %item.job_signature,
            attempt = item.attempt_count,
            "Starting job processing"
        );

        // Redeliveries after a lapsed lease count as attempts
        let retry_limit = self.config.retry_limit();
        if item.attempt_count > retry_limit {
            warn!(
                item_id = %item.id,
                job = %item.job_signature,
                attempts = item.attempt_count,
                "Lease lapsed with no retries left"
            );
            item.attempt_count = retry_limit;
            let message = item
                .last_error
                .clone()
                .unwrap_or_else(|| "lease expired".to_string());
            return self
                .dead_letter(&mut item, FailureKind::LeaseExpired, message)
                .await;
        }

        let Some(job) = self.registry.lookup(&item.job_signature) else {
            error!(item_id = %item.id, job = %item.job_signature, "No job registered for signature");
            let message = format!("No job registered under signature {}", item.job_signature);
            return self
                .dead_letter(&mut item, FailureKind::UnknownJob, message)
                .await;
        };

        let args = match item.decode_args() {
            Ok(args) => args,
            Err(e) => {
                error!(item_id = %item.id, job = %item.job_signature, "Failed to decode arguments: {}", e);
                return self
                    .dead_letter(&mut item, FailureKind::ArgDecode, e.to_string())
                    .await;
            }
        };

        let context = JobContext::for_item(&item, &self.worker_id);
        match self
            .run_leased(&mut item, job.as_ref(), &args, &context)
            .await
        {
            Ok(()) => {
                let duration_ms = context.duration().num_milliseconds().max(0) as u64;
                self.complete(&item, duration_ms).await
            }
            Err((kind, err)) if !err.retryable => {
                warn!(item_id = %item.id, job = %item.job_signature, "Job failed with a fatal error: {}", err);
                self.dead_letter(&mut item, kind, err.message).await
            }
            Err((kind, err)) => self.handle_failure(&mut item, kind, err.message).await,
        }
    }

    /// Run the handler, extending the lease on a fixed heartbeat until it returns
    async fn run_leased(
        &self,
        item: &mut WorkItem,
        job: &dyn Job,
        args: &[Arg],
        context: &JobContext,
    ) -> Result<(), (FailureKind, JobError)> {
        let lease = self.config.lease;
        let mut heartbeat = tokio::time::interval((lease / 3).max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        heartbeat.tick().await;

        let handler = run_handler(job, args, context, self.config.job_timeout);
        tokio::pin!(handler);
        loop {
            tokio::select! {
                result = &mut handler => return result,
                _ = heartbeat.tick() => match self.storage.extend_lease(item, lease).await {
                    Ok(()) => {
                        if let Ok(lease) = chrono::Duration::from_std(lease) {
                            item.state.renew(lease);
                        }
                        debug!(item_id = %item.id, "Extended lease");
                    }
                    Err(e) => {
                        warn!(item_id = %item.id, job = %item.job_signature, "Failed to extend lease: {}", e);
                    }
                },
            }
        }
    }

    /// Acknowledge the item and enqueue its chain successor
    async fn complete(&self, item: &WorkItem, duration_ms: u64) -> Outcome {
        let next = item.next_chain_item();
        match self.storage.complete(item, next.as_ref()).await {
            Ok(()) => {
                if let Some(next) = &next {
                    debug!(
                        item_id = %item.id,
                        next_id = %next.id,
                        chain_id = next.chain_id.as_deref().unwrap_or(""),
                        "Enqueued next chain element"
                    );
                }
                self.events.emit(&JobEvent::Succeeded {
                    item_id: item.id.clone(),
                    job: item.job_signature.clone(),
                    queue: item.queue.clone(),
                    attempt_count: item.attempt_count,
                    duration_ms,
                    chain_id: item.chain_id.clone(),
                    chain_position: item.chain_position,
                });
                Outcome::Succeeded
            }
            Err(e) => {
                let operation = match &next {
                    Some(_) if !self.storage.supports_atomic_complete() => "complete_non_atomic",
                    _ => "complete",
                };
                self.inconsistency(item, operation, &e)
            }
        }
    }

    /// Schedule a retry if the budget allows, otherwise dead-letter
    async fn handle_failure(&self, item: &mut WorkItem, kind: FailureKind, message: String) -> Outcome {
        let policy = &self.config.retry;
        if !policy.should_retry(kind, item.attempt_count) {
            debug!(
                item_id = %item.id,
                attempts = item.attempt_count,
                "Retry limit reached, failing permanently"
            );
            return self.dead_letter(item, kind, message).await;
        }

        let attempt = item.attempt_count + 1;
        let available_at = policy.calculate_retry_time(attempt);
        item.attempt_count = attempt;
        item.last_error = Some(message.clone());

        match self.storage.retry(item, available_at).await {
            Ok(()) => {
                self.events.emit(&JobEvent::Retrying {
                    item_id: item.id.clone(),
                    job: item.job_signature.clone(),
                    queue: item.queue.clone(),
                    attempt,
                    available_at,
                    error: message,
                });
                Outcome::Retried
            }
            Err(e) => self.inconsistency(item, "retry", &e),
        }
    }

    /// Move the item to the dead-letter sink and report the terminal failure
    async fn dead_letter(&self, item: &mut WorkItem, kind: FailureKind, message: String) -> Outcome {
        let failure = Failure::new(kind, message, item.attempt_count);
        item.last_error = Some(failure.message.clone());

        if let Err(e) = self.storage.dead_letter(item, &failure).await {
            return self.inconsistency(item, "dead_letter", &e);
        }

        let chain = item.chain_id.as_ref().map(|chain_id| ChainAbort {
            chain_id: chain_id.clone(),
            position: item.chain_position.unwrap_or(0),
            skipped: item.chain_skipped(),
        });
        self.events.emit(&JobEvent::FailedTerminal {
            item_id: item.id.clone(),
            job: item.job_signature.clone(),
            queue: item.queue.clone(),
            failure,
            chain,
        });
        Outcome::DeadLettered
    }

    fn inconsistency(&self, item: &WorkItem, operation: &str, err: &StorageError) -> Outcome {
        error!(
            item_id = %item.id,
            job = %item.job_signature,
            operation = operation,
            "Backend call failed after job execution: {}",
            err
        );
        self.events.emit(&JobEvent::Inconsistency {
            item_id: item.id.clone(),
            job: item.job_signature.clone(),
            operation: operation.to_string(),
            message: err.to_string(),
        });
        Outcome::Inconsistent
    }
}
