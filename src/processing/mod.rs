//! Job Processing Engine
//!
//! This module contains the job definitions workers execute, the registry
//! that maps signatures to them, and the worker machinery that fetches,
//! runs, retries and acknowledges work items.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::Arg;
use crate::error::{Result, TaskqError};

pub mod context;
pub mod events;
pub mod processor;
pub mod retry;
pub mod worker;

pub use context::{JobContext, JobError};
pub use events::{ChainAbort, EventBus, EventSink, JobEvent, TracingEventSink};
pub use processor::{JobProcessor, Outcome};
pub use retry::{RetryPolicy, RetryStrategy};
pub use worker::{Worker, WorkerArgs, WorkerHandle, WorkerReport};

/// A named unit of executable logic
///
/// Implementations are registered once at startup and shared by every
/// worker, so `handle` may run concurrently on several items.
///
/// ```rust
/// use async_trait::async_trait;
/// use taskq::{Arg, Job, JobContext, JobError};
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl Job for SendEmail {
///     fn signature(&self) -> &str {
///         "send_email"
///     }
///
///     async fn handle(&self, args: &[Arg], _ctx: &JobContext) -> Result<(), JobError> {
///         let to = args
///             .first()
///             .and_then(Arg::as_str)
///             .ok_or_else(|| JobError::fatal("missing recipient"))?;
///         println!("sending to {}", to);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier stored in every work item for this job
    fn signature(&self) -> &str;

    /// Execute the job with decoded arguments
    ///
    /// # Returns
    /// * `Ok(())` if the job succeeded
    /// * `Err(JobError)` if it failed; see [`JobError::fatal`] to skip retries
    async fn handle(&self, args: &[Arg], ctx: &JobContext) -> std::result::Result<(), JobError>;
}

/// Registry of job definitions keyed by signature
///
/// Filled during startup and then shared read-only behind an `Arc`.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("signatures", &self.signatures())
            .finish()
    }
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Register a batch of jobs
    ///
    /// Nothing is registered if any signature collides, with the registry or
    /// within the batch.
    pub fn register(&mut self, jobs: Vec<Arc<dyn Job>>) -> Result<()> {
        let mut batch: HashMap<String, Arc<dyn Job>> = HashMap::with_capacity(jobs.len());
        for job in jobs {
            let signature = job.signature().to_string();
            if self.jobs.contains_key(&signature) || batch.contains_key(&signature) {
                return Err(TaskqError::DuplicateSignature { signature });
            }
            batch.insert(signature, job);
        }
        self.jobs.extend(batch);
        Ok(())
    }

    /// Register a single job
    pub fn register_job<J>(&mut self, job: J) -> Result<()>
    where
        J: Job + 'static,
    {
        self.register(vec![Arc::new(job)])
    }

    /// Job registered under `signature`
    pub fn lookup(&self, signature: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(signature).cloned()
    }

    /// Get all registered signatures, sorted
    pub fn signatures(&self) -> Vec<&str> {
        let mut signatures: Vec<&str> = self.jobs.keys().map(|s| s.as_str()).collect();
        signatures.sort_unstable();
        signatures
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.jobs.contains_key(signature)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
