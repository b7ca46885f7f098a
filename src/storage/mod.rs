//! Queue backends.
//!
//! Every backend implements [`Storage`]: an at-least-once queue with
//! delayed availability, leased fetches and a dead-letter sink. The
//! dispatcher writes through it and workers consume through it; neither
//! knows which backend is behind the trait object.
//!
//! ## Storage Backends
//!
//! - **[`MemoryStorage`]**: process-local, for development and tests
//! - **`RedisStorage`**: sorted sets updated by Lua scripts (feature `redis`)
//! - **`PostgresStorage`**: one table locked with `FOR UPDATE SKIP LOCKED`
//!   (feature `postgres`)
//!
//! ## Leases
//!
//! A fetch reserves the item for the caller until its lease expires. After
//! that any worker may fetch it again, so a crashed worker's item is
//! eventually re-run. Finishing calls (`ack`, `complete`, `retry`,
//! `dead_letter`) verify the caller still holds the reservation and fail
//! with [`StorageError::LeaseLost`] otherwise.
//!
//! ```text
//! Worker A ──┐
//!            ├── fetch() ──→ Gets item #123
//! Worker B ──┘           ──→ Gets item #124 (not #123)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::core::{DeadLetter, Failure, ItemState, WorkItem};

pub mod config;
pub mod connections;
pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(test)]
mod test_locking;

#[cfg(feature = "postgres")]
pub use config::PostgresConfig;
#[cfg(feature = "redis")]
pub use config::RedisConfig;
pub use config::{MemoryConfig, StorageConfig};
pub use connections::Connections;
pub use error::StorageError;
pub use memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
#[cfg(feature = "redis")]
pub use redis::RedisStorage;

/// Backend contract shared by dispatchers and workers.
///
/// ```rust
/// use std::time::Duration;
/// use taskq::storage::{MemoryStorage, Storage};
/// use taskq::{Arg, WorkItem};
///
/// # tokio_test::block_on(async {
/// let storage = MemoryStorage::new();
/// let item = WorkItem::new("send_email", &[Arg::from("a@b.com")], "taskq_queues:default").unwrap();
/// storage.enqueue(&item).await.unwrap();
///
/// let fetched = storage
///     .fetch("taskq_queues:default", "worker-1", Duration::from_secs(30))
///     .await
///     .unwrap()
///     .unwrap();
/// assert_eq!(fetched.id, item.id);
///
/// storage.ack(&fetched).await.unwrap();
/// assert_eq!(storage.pending_count("taskq_queues:default").await.unwrap(), 0);
/// # });
/// ```
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a new item.
    ///
    /// Insert-if-absent: an item whose id is already stored, in any state,
    /// is left untouched and the call succeeds.
    async fn enqueue(&self, item: &WorkItem) -> Result<(), StorageError>;

    /// Store an item that must not be fetched before `item.available_at`.
    async fn enqueue_delayed(&self, item: &WorkItem) -> Result<(), StorageError> {
        self.enqueue(item).await
    }

    /// Reserve the next available item of `queue` for `worker_id`.
    ///
    /// Available means pending with `available_at <= now`, or reserved with
    /// an expired lease. Items come out in `available_at` order. The
    /// returned copy carries the new `Reserved` state; pass it back to the
    /// finishing calls unchanged.
    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<WorkItem>, StorageError>;

    /// Push the reservation held by `item` out to `lease` from now.
    ///
    /// Fails with [`StorageError::LeaseLost`] if the reservation is no
    /// longer the caller's.
    async fn extend_lease(&self, item: &WorkItem, lease: Duration) -> Result<(), StorageError>;

    /// Mark a reserved item as succeeded.
    async fn ack(&self, item: &WorkItem) -> Result<(), StorageError>;

    /// Acknowledge `item` and enqueue its chain successor.
    ///
    /// The default enqueues `next` first and acks afterwards; the
    /// successor's deterministic id makes a repeat after a crash a no-op.
    /// Backends that can do both in one step override this and report it
    /// through [`supports_atomic_complete`](Storage::supports_atomic_complete).
    async fn complete(&self, item: &WorkItem, next: Option<&WorkItem>) -> Result<(), StorageError> {
        if let Some(next) = next {
            self.enqueue(next).await?;
        }
        self.ack(item).await
    }

    /// Put a reserved item back as pending until `available_at`.
    ///
    /// `item` already carries its incremented `attempt_count` and
    /// `last_error`; both are persisted.
    async fn retry(
        &self,
        item: &WorkItem,
        available_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Move a reserved item to the dead-letter sink.
    async fn dead_letter(&self, item: &WorkItem, failure: &Failure) -> Result<(), StorageError>;

    /// Look an item up by id.
    async fn get(&self, id: &str) -> Result<Option<WorkItem>, StorageError>;

    /// Dead letters recorded for `queue`, oldest first.
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StorageError>;

    /// Return a dead-lettered item to its queue with a fresh retry budget.
    ///
    /// Returns `false` if there is no dead letter with that id.
    async fn requeue_dead_letter(&self, id: &str) -> Result<bool, StorageError>;

    /// Items of `queue` waiting to be fetched, including delayed ones.
    async fn pending_count(&self, queue: &str) -> Result<usize, StorageError>;

    /// Whether [`complete`](Storage::complete) is a single atomic step.
    fn supports_atomic_complete(&self) -> bool {
        false
    }
}

pub(crate) fn lease_duration(lease: Duration) -> Result<chrono::Duration, StorageError> {
    chrono::Duration::from_std(lease)
        .map_err(|e| StorageError::configuration(format!("Invalid lease: {}", e)))
}

/// Move `item` to `state`, refusing transitions the item lifecycle forbids.
pub(crate) fn transition(item: &mut WorkItem, state: ItemState) -> Result<(), StorageError> {
    item.set_state(state).map_err(|e| {
        StorageError::operation_failed_with_source("transition", e.to_string(), Box::new(e))
    })
}

/// Count a fetch of an item whose previous lease lapsed as an attempt.
pub(crate) fn redelivered(item: &mut WorkItem, previous_holder: &str) {
    item.attempt_count = item.attempt_count.saturating_add(1);
    item.last_error = Some(format!("lease expired while held by {}", previous_holder));
}

/// Storage instance that can hold any storage implementation
pub enum StorageInstance {
    Memory(MemoryStorage),
    #[cfg(feature = "redis")]
    Redis(RedisStorage),
    #[cfg(feature = "postgres")]
    Postgres(PostgresStorage),
}

impl StorageInstance {
    /// Create a storage instance from configuration
    ///
    /// ```rust
    /// use taskq::storage::{MemoryConfig, StorageConfig, StorageInstance};
    ///
    /// # tokio_test::block_on(async {
    /// let config = StorageConfig::Memory(MemoryConfig::default());
    /// let storage = StorageInstance::from_config(config).await.unwrap();
    /// # });
    /// ```
    pub async fn from_config(config: StorageConfig) -> Result<Self, StorageError> {
        match config {
            StorageConfig::Memory(memory_config) => Ok(StorageInstance::Memory(
                MemoryStorage::with_config(memory_config),
            )),
            #[cfg(feature = "redis")]
            StorageConfig::Redis(redis_config) => {
                let redis_storage = RedisStorage::with_config(redis_config).await?;
                Ok(StorageInstance::Redis(redis_storage))
            }
            #[cfg(feature = "postgres")]
            StorageConfig::Postgres(postgres_config) => {
                let postgres_storage = PostgresStorage::new(postgres_config).await?;
                Ok(StorageInstance::Postgres(postgres_storage))
            }
        }
    }

    /// Memory storage with default configuration
    pub fn memory() -> Self {
        StorageInstance::Memory(MemoryStorage::new())
    }
}

macro_rules! delegate {
    ($self:ident, $storage:ident => $call:expr) => {
        match $self {
            StorageInstance::Memory($storage) => $call,
            #[cfg(feature = "redis")]
            StorageInstance::Redis($storage) => $call,
            #[cfg(feature = "postgres")]
            StorageInstance::Postgres($storage) => $call,
        }
    };
}

#[async_trait]
impl Storage for StorageInstance {
    async fn enqueue(&self, item: &WorkItem) -> Result<(), StorageError> {
        delegate!(self, storage => storage.enqueue(item).await)
    }

    async fn enqueue_delayed(&self, item: &WorkItem) -> Result<(), StorageError> {
        delegate!(self, storage => storage.enqueue_delayed(item).await)
    }

    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<WorkItem>, StorageError> {
        delegate!(self, storage => storage.fetch(queue, worker_id, lease).await)
    }

    async fn extend_lease(&self, item: &WorkItem, lease: Duration) -> Result<(), StorageError> {
        delegate!(self, storage => storage.extend_lease(item, lease).await)
    }

    async fn ack(&self, item: &WorkItem) -> Result<(), StorageError> {
        delegate!(self, storage => storage.ack(item).await)
    }

    async fn complete(&self, item: &WorkItem, next: Option<&WorkItem>) -> Result<(), StorageError> {
        delegate!(self, storage => storage.complete(item, next).await)
    }

    async fn retry(
        &self,
        item: &WorkItem,
        available_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        delegate!(self, storage => storage.retry(item, available_at).await)
    }

    async fn dead_letter(&self, item: &WorkItem, failure: &Failure) -> Result<(), StorageError> {
        delegate!(self, storage => storage.dead_letter(item, failure).await)
    }

    async fn get(&self, id: &str) -> Result<Option<WorkItem>, StorageError> {
        delegate!(self, storage => storage.get(id).await)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StorageError> {
        delegate!(self, storage => storage.dead_letters(queue).await)
    }

    async fn requeue_dead_letter(&self, id: &str) -> Result<bool, StorageError> {
        delegate!(self, storage => storage.requeue_dead_letter(id).await)
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, StorageError> {
        delegate!(self, storage => storage.pending_count(queue).await)
    }

    fn supports_atomic_complete(&self) -> bool {
        delegate!(self, storage => storage.supports_atomic_complete())
    }
}
