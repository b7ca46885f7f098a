//! Worker fetch loop and lifecycle
//!
//! A [`Worker`] is bound to one `(connection, queue, concurrency)` binding.
//! It runs a single fetch loop that takes a concurrency slot, fetches one
//! item, and hands it to a spawned [`JobProcessor`] task that holds the slot
//! until the item is finished:
//!
//! ```text
//!            ┌──────── slot free ────────┐
//!            ▼                           │
//! acquire slot ──→ fetch ──item──→ spawn process(item) ──→ release slot
//!                    │
//!                    ├─ empty ──→ sleep(poll_interval)
//!                    └─ error ──→ sleep(backoff), backoff doubles up to a cap
//! ```
//!
//! Cancellation is observed at the top of the loop and while waiting. On
//! shutdown the loop stops fetching, waits up to the grace period for
//! in-flight jobs and aborts whatever is still running; the backend lease
//! makes those items fetchable again.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::JobRegistry;
use super::events::EventSink;
use super::processor::{JobProcessor, Outcome};
use crate::config::{DriverKind, QueueConfig};
use crate::error::{Result, TaskqError};
use crate::storage::{Connections, Storage};

/// Longest sleep between fetch attempts while the backend is failing
const MAX_FETCH_BACKOFF: Duration = Duration::from_secs(30);

/// Optional worker binding; empty fields resolve to configured defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerArgs {
    /// Connection name; empty means `queue.default`
    pub connection: String,
    /// Queue name; empty means the connection's default queue
    pub queue: String,
    /// Concurrency override; `None` uses the connection's setting
    pub concurrent: Option<usize>,
}

impl WorkerArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn concurrent(mut self, concurrent: usize) -> Self {
        self.concurrent = Some(concurrent);
        self
    }
}

/// Counters collected by a worker over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Items whose processing finished, whatever the outcome
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Items whose finishing backend call failed
    pub inconsistent: u64,
    /// Items still running when the grace period ran out
    pub abandoned: u64,
}

impl WorkerReport {
    fn record(&mut self, result: std::result::Result<Outcome, JoinError>) {
        match result {
            Ok(outcome) => {
                self.processed += 1;
                match outcome {
                    Outcome::Succeeded => self.succeeded += 1,
                    Outcome::Retried => self.retried += 1,
                    Outcome::DeadLettered => self.dead_lettered += 1,
                    Outcome::Inconsistent => self.inconsistent += 1,
                }
            }
            Err(e) if e.is_cancelled() => self.abandoned += 1,
            Err(e) => {
                error!("Job task failed outside the handler: {}", e);
                self.abandoned += 1;
            }
        }
    }
}

/// A worker bound to one queue
pub struct Worker {
    worker_id: String,
    config: QueueConfig,
    registry: Arc<JobRegistry>,
    connections: Arc<Connections>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker for a resolved binding
    ///
    /// Fails for sync connections, which have no queue to consume.
    pub fn new(
        config: QueueConfig,
        registry: Arc<JobRegistry>,
        connections: Arc<Connections>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        if config.driver == DriverKind::Sync {
            return Err(TaskqError::configuration(format!(
                "Cannot start a worker on connection {}: the sync driver has no queue",
                config.connection
            )));
        }
        if config.concurrency == 0 {
            return Err(TaskqError::configuration("Worker concurrency must be at least 1"));
        }

        Ok(Self {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            config,
            registry,
            connections,
            events,
        })
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Resolve the backend and spawn the fetch loop
    pub async fn start(self) -> Result<WorkerHandle> {
        let storage = self.connections.storage(&self.config.connection).await?;
        let token = CancellationToken::new();
        let worker_id = self.worker_id.clone();
        let handle = tokio::spawn(self.run_loop(storage, token.clone()));

        Ok(WorkerHandle {
            worker_id,
            token,
            handle,
        })
    }

    /// Run the fetch loop in the current task until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<WorkerReport> {
        let storage = self.connections.storage(&self.config.connection).await?;
        Ok(self.run_loop(storage, token).await)
    }

    async fn run_loop(self, storage: Arc<dyn Storage>, token: CancellationToken) -> WorkerReport {
        let config = &self.config;
        info!(
            worker_id = %self.worker_id,
            connection = %config.connection,
            queue = %config.queue_key,
            concurrency = config.concurrency,
            "Worker started"
        );

        let processor = Arc::new(
            JobProcessor::new(Arc::clone(&self.registry), Arc::clone(&storage), config.clone())
                .with_worker_id(self.worker_id.clone())
                .with_event_sink(Arc::clone(&self.events)),
        );
        let slots = Arc::new(Semaphore::new(config.concurrency));
        let mut in_flight: JoinSet<Outcome> = JoinSet::new();
        let mut report = WorkerReport::default();
        let mut backoff = config.poll_interval;

        loop {
            while let Some(result) = in_flight.try_join_next() {
                report.record(result);
            }

            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if token.is_cancelled() {
                break;
            }

            match storage
                .fetch(&config.queue_key, &self.worker_id, config.lease)
                .await
            {
                Ok(Some(item)) => {
                    backoff = config.poll_interval;
                    debug!(worker_id = %self.worker_id, item_id = %item.id, "Fetched item");
                    let processor = Arc::clone(&processor);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        processor.process(item).await
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(
                        worker_id = %self.worker_id,
                        queue = %config.queue_key,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Fetch failed: {}",
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(MAX_FETCH_BACKOFF);
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            in_flight = in_flight.len(),
            "Worker stopping, draining in-flight jobs"
        );

        let drain = async {
            while let Some(result) = in_flight.join_next().await {
                report.record(result);
            }
        };
        if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
            warn!(
                worker_id = %self.worker_id,
                remaining = in_flight.len(),
                "Grace period elapsed, abandoning running jobs"
            );
            in_flight.abort_all();
            while let Some(result) = in_flight.join_next().await {
                report.record(result);
            }
        }

        info!(
            worker_id = %self.worker_id,
            processed = report.processed,
            succeeded = report.succeeded,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            abandoned = report.abandoned,
            "Worker stopped"
        );
        report
    }
}

/// Handle for controlling a running worker
pub struct WorkerHandle {
    worker_id: String,
    token: CancellationToken,
    handle: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token driving the worker; child tokens cancel with it
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop fetching, drain in-flight jobs and return the final counters
    pub async fn shutdown(self) -> Result<WorkerReport> {
        self.token.cancel();
        self.handle.await.map_err(|e| TaskqError::Worker {
            message: e.to_string(),
        })
    }

    /// Returns true if the fetch loop is still running
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the worker immediately without draining
    ///
    /// Running items stay reserved until their lease expires.
    pub fn abort(&self) {
        self.handle.abort();
    }
}
