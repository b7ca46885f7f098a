//! Dispatcher facade
//!
//! [`Dispatcher`] ties the job registry, the queue configuration resolver
//! and the backend connections together. Register jobs once at startup,
//! then build tasks, chains and workers from it.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigSource, QueueConfigResolver};
use crate::core::Arg;
use crate::dispatch::{Chain, ChainedJob, Task};
use crate::error::{Result, TaskqError};
use crate::processing::{EventBus, EventSink, Job, JobRegistry, Worker, WorkerArgs};
use crate::storage::Connections;

/// Entry point for registering, dispatching and consuming jobs
pub struct Dispatcher {
    resolver: QueueConfigResolver,
    registry: Arc<JobRegistry>,
    connections: Arc<Connections>,
    events: EventBus,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        let resolver = QueueConfigResolver::new(config);
        Self {
            connections: Arc::new(Connections::new(resolver.clone())),
            resolver,
            registry: Arc::new(JobRegistry::new()),
            events: EventBus::new(),
        }
    }

    /// Also deliver job events to `sink`; tracing always receives them
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events.subscribe(sink);
        self
    }

    /// Register job definitions
    ///
    /// Registration belongs to startup: once a worker holds the registry it
    /// is frozen and this fails with a configuration error.
    pub fn register(&mut self, jobs: Vec<Arc<dyn Job>>) -> Result<()> {
        let count = jobs.len();
        let registry = Arc::get_mut(&mut self.registry).ok_or_else(|| {
            TaskqError::configuration("Jobs must be registered before workers are created")
        })?;
        registry.register(jobs)?;
        info!(registered = count, total = registry.len(), "Registered jobs");
        Ok(())
    }

    /// Bind `job` to `args`
    pub fn job(&self, job: Arc<dyn Job>, args: Vec<Arg>) -> Task {
        if !self.registry.contains(job.signature()) {
            warn!(job = %job.signature(), "Building a task for an unregistered job");
        }
        Task::new(job, args, self.resolver.clone(), Arc::clone(&self.connections))
    }

    /// Build a chain that runs `jobs` in order
    pub fn chain(&self, jobs: Vec<ChainedJob>) -> Chain {
        Chain::new(jobs, self.resolver.clone(), Arc::clone(&self.connections))
    }

    /// Create a worker
    ///
    /// `None` binds the default connection and queue with concurrency 1.
    /// With explicit args, empty fields resolve to configured defaults and a
    /// missing concurrency uses the connection's setting.
    pub fn worker(&self, args: Option<WorkerArgs>) -> Result<Worker> {
        let args = args.unwrap_or_else(|| WorkerArgs::new().concurrent(1));
        if args.concurrent == Some(0) {
            return Err(TaskqError::configuration("Worker concurrency must be at least 1"));
        }

        let mut config = self.resolver.resolve(&args.connection, &args.queue)?;
        if let Some(concurrent) = args.concurrent {
            config.concurrency = concurrent;
        }

        Worker::new(
            config,
            Arc::clone(&self.registry),
            Arc::clone(&self.connections),
            Arc::new(self.events.clone()),
        )
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &QueueConfigResolver {
        &self.resolver
    }

    /// Backends by connection name, shared with every task and worker
    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }
}
