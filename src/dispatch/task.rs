//! Single job dispatch

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{enqueue, run_inline};
use crate::config::{DriverKind, QueueConfigResolver};
use crate::core::{Arg, ItemState, WorkItem};
use crate::error::{Result, TaskqError};
use crate::processing::Job;
use crate::storage::Connections;

/// When a dispatched item becomes available
enum Availability {
    Now,
    At(DateTime<Utc>),
    After(Duration),
}

/// A job bound to concrete arguments, ready to dispatch
///
/// A task does not track the item after enqueue; every dispatch call writes
/// a fresh item.
pub struct Task {
    job: Arc<dyn Job>,
    args: Vec<Arg>,
    connection: String,
    queue: String,
    resolver: QueueConfigResolver,
    connections: Arc<Connections>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("job", &self.job.signature())
            .field("args", &self.args)
            .field("connection", &self.connection)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Task {
    pub fn new(
        job: Arc<dyn Job>,
        args: Vec<Arg>,
        resolver: QueueConfigResolver,
        connections: Arc<Connections>,
    ) -> Self {
        Self {
            job,
            args,
            connection: String::new(),
            queue: String::new(),
            resolver,
            connections,
        }
    }

    /// Dispatch through a named connection instead of the default one
    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    /// Dispatch onto a named queue instead of the connection's default
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn signature(&self) -> &str {
        self.job.signature()
    }

    /// Enqueue the task, available immediately
    pub async fn dispatch(&self) -> Result<WorkItem> {
        self.dispatch_with(Availability::Now).await
    }

    /// Enqueue the task, available from `at`
    pub async fn dispatch_at(&self, at: DateTime<Utc>) -> Result<WorkItem> {
        self.dispatch_with(Availability::At(at)).await
    }

    /// Enqueue the task, available `delay` after now
    pub async fn dispatch_after(&self, delay: Duration) -> Result<WorkItem> {
        self.dispatch_with(Availability::After(delay)).await
    }

    /// Same as [`dispatch_after`](Task::dispatch_after)
    pub async fn delay(&self, delay: Duration) -> Result<WorkItem> {
        self.dispatch_after(delay).await
    }

    async fn dispatch_with(&self, availability: Availability) -> Result<WorkItem> {
        let config = self.resolver.resolve(&self.connection, &self.queue)?;
        let mut item = WorkItem::new(self.job.signature(), &self.args, config.queue_key.clone())?;
        match availability {
            Availability::Now => {}
            Availability::At(at) => item.available_at = at,
            Availability::After(delay) => {
                let delay = chrono::Duration::from_std(delay).map_err(|_| {
                    TaskqError::configuration(format!("Dispatch delay {:?} is out of range", delay))
                })?;
                item.available_at = item.enqueued_at.checked_add_signed(delay).ok_or_else(|| {
                    TaskqError::configuration("Dispatch delay overflows the timestamp range")
                })?;
            }
        }

        if config.driver == DriverKind::Sync {
            run_inline(self.job.as_ref(), &item, &config).await?;
            item.set_state(ItemState::succeeded())?;
            return Ok(item);
        }

        enqueue(&self.connections, &config, &item).await?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::processing::{JobContext, JobError};
    use crate::storage::{MemoryConfig, MemoryStorage, Storage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counter(AtomicU32);

    #[async_trait]
    impl Job for Counter {
        fn signature(&self) -> &str {
            "counter"
        }

        async fn handle(&self, args: &[Arg], _ctx: &JobContext) -> std::result::Result<(), JobError> {
            if args.first().and_then(Arg::as_bool) == Some(false) {
                return Err(JobError::retryable("asked to fail"));
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> (QueueConfigResolver, Arc<Connections>) {
        let mut config = MapConfig::new();
        config.add("app", json!({"name": "shop"}));
        config.add(
            "queue",
            json!({
                "default": "memory",
                "connections": {
                    "memory": {"driver": "memory", "queue": "mail"},
                    "tiny": {"driver": "memory"},
                    "sync": {"driver": "sync"}
                }
            }),
        );
        let resolver = QueueConfigResolver::new(Arc::new(config));
        let connections = Arc::new(Connections::new(resolver.clone()));
        (resolver, connections)
    }

    fn task(job: Arc<dyn Job>, args: Vec<Arg>) -> (Task, Arc<Connections>) {
        let (resolver, connections) = context();
        (Task::new(job, args, resolver, Arc::clone(&connections)), connections)
    }

    #[tokio::test]
    async fn test_dispatch_uses_default_route() {
        let (task, connections) = task(Arc::new(Counter::default()), vec![Arg::from(true)]);
        let item = task.dispatch().await.unwrap();

        assert_eq!(item.queue, "shop_queues:mail");
        assert_eq!(item.available_at, item.enqueued_at);
        let storage = connections.storage("memory").await.unwrap();
        assert_eq!(storage.pending_count("shop_queues:mail").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_sets_available_at_exactly() {
        let (task, connections) = task(Arc::new(Counter::default()), vec![]);
        let task = task.on_queue("reports");
        let item = task.dispatch_after(Duration::from_secs(90)).await.unwrap();

        assert_eq!(item.available_at - item.enqueued_at, chrono::Duration::seconds(90));
        let storage = connections.storage("memory").await.unwrap();
        assert!(
            storage
                .fetch("shop_queues:reports", "w", Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(storage.pending_count("shop_queues:reports").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_at() {
        let (task, _) = task(Arc::new(Counter::default()), vec![]);
        let at = Utc::now() + chrono::Duration::minutes(5);
        let item = task.dispatch_at(at).await.unwrap();
        assert_eq!(item.available_at, at);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_a_configuration_error() {
        let (task, _) = task(Arc::new(Counter::default()), vec![]);
        let err = task.on_connection("nope").dispatch().await.unwrap_err();
        assert_eq!(
            err,
            TaskqError::UnknownConnection {
                connection: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn test_backend_rejection_is_enqueue_failed() {
        let (resolver, connections) = context();
        let full = Arc::new(MemoryStorage::with_config(MemoryConfig::default().with_max_items(1)));
        connections.insert("tiny", full).await;

        let task = Task::new(Arc::new(Counter::default()), vec![], resolver, connections).on_connection("tiny");
        task.dispatch().await.unwrap();
        let err = task.dispatch().await.unwrap_err();
        assert!(matches!(err, TaskqError::EnqueueFailed { .. }));
    }

    #[tokio::test]
    async fn test_sync_connection_runs_inline() {
        let job = Arc::new(Counter::default());
        let (task, _) = task(job.clone(), vec![Arg::from(true)]);
        let item = task.on_connection("sync").dispatch().await.unwrap();

        assert_eq!(job.0.load(Ordering::SeqCst), 1);
        assert!(matches!(item.state, ItemState::Succeeded { .. }));
    }

    #[tokio::test]
    async fn test_sync_handler_error_reaches_caller() {
        let (task, _) = task(Arc::new(Counter::default()), vec![Arg::from(false)]);
        let err = task.on_connection("sync").dispatch().await.unwrap_err();
        assert_eq!(
            err,
            TaskqError::Handler {
                message: "asked to fail".into()
            }
        );
    }
}
