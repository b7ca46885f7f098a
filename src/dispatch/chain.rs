//! Ordered job chains
//!
//! Only the first element of a chain is enqueued at dispatch time. The rest
//! travel inside that item, and a worker enqueues element `n + 1` as part of
//! acknowledging element `n`, so the ordering survives worker restarts and
//! never depends on the backend understanding chains.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{enqueue, run_inline};
use crate::config::{DriverKind, QueueConfig, QueueConfigResolver};
use crate::core::{Arg, ChainStep, ItemState, WorkItem};
use crate::error::{Result, TaskqError};
use crate::processing::Job;
use crate::storage::Connections;

/// One element of a chain
#[derive(Clone)]
pub struct ChainedJob {
    pub job: Arc<dyn Job>,
    pub args: Vec<Arg>,
}

impl ChainedJob {
    pub fn new(job: Arc<dyn Job>, args: Vec<Arg>) -> Self {
        Self { job, args }
    }
}

impl std::fmt::Debug for ChainedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedJob")
            .field("job", &self.job.signature())
            .field("args", &self.args)
            .finish()
    }
}

/// Jobs that run strictly in order on one queue
///
/// If an element fails terminally, the elements after it are never
/// enqueued.
pub struct Chain {
    jobs: Vec<ChainedJob>,
    connection: String,
    queue: String,
    resolver: QueueConfigResolver,
    connections: Arc<Connections>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("jobs", &self.jobs)
            .field("connection", &self.connection)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Chain {
    pub fn new(jobs: Vec<ChainedJob>, resolver: QueueConfigResolver, connections: Arc<Connections>) -> Self {
        Self {
            jobs,
            connection: String::new(),
            queue: String::new(),
            resolver,
            connections,
        }
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Dispatch the chain and return its first item
    ///
    /// On a queue connection only the first element is enqueued. On a sync
    /// connection every element runs now, in order, and the first handler
    /// error stops the chain and is returned.
    pub async fn dispatch(&self) -> Result<WorkItem> {
        if self.jobs.is_empty() {
            return Err(TaskqError::configuration("Cannot dispatch an empty chain"));
        }

        let config = self.resolver.resolve(&self.connection, &self.queue)?;
        let chain_id = Uuid::new_v4().to_string();
        let steps = self
            .jobs
            .iter()
            .map(|chained| ChainStep::new(chained.job.signature(), &chained.args))
            .collect::<Result<Vec<_>>>()?;

        let (first, rest) = steps
            .split_first()
            .ok_or_else(|| TaskqError::configuration("Cannot dispatch an empty chain"))?;
        let head = WorkItem::for_chain_step(&chain_id, 0, first.clone(), rest.to_vec(), config.queue_key.clone());

        if config.driver == DriverKind::Sync {
            return self.run_inline(head, &config).await;
        }

        enqueue(&self.connections, &config, &head).await?;
        info!(chain_id = %chain_id, length = self.jobs.len(), "Dispatched chain");
        Ok(head)
    }

    async fn run_inline(&self, head: WorkItem, config: &QueueConfig) -> Result<WorkItem> {
        let mut current = Some(head.clone());
        for chained in &self.jobs {
            let Some(item) = current.take() else {
                break;
            };
            if let Err(e) = run_inline(chained.job.as_ref(), &item, config).await {
                warn!(
                    chain_id = item.chain_id.as_deref().unwrap_or(""),
                    position = item.chain_position.unwrap_or(0),
                    skipped = item.chain_skipped(),
                    "Inline chain stopped: {}",
                    e
                );
                return Err(e);
            }
            current = item.next_chain_item();
        }

        let mut head = head;
        head.set_state(ItemState::succeeded())?;
        Ok(head)
    }
}
