use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{MemoryConfig, Storage, StorageError, lease_duration, redelivered, transition};
use crate::core::{DeadLetter, Failure, ItemState, WorkItem};

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<String, WorkItem>,
    dead_letters: HashMap<String, DeadLetter>,
    /// Succeeded item ids, oldest first
    completed: VecDeque<String>,
}

impl Inner {
    fn unfinished(&self) -> usize {
        self.items.values().filter(|i| !i.state.is_final()).count()
    }

    /// The stored item if `presented` still holds its reservation.
    fn reserved_mut(&mut self, presented: &WorkItem) -> Result<&mut WorkItem, StorageError> {
        let stored = self
            .items
            .get_mut(&presented.id)
            .ok_or_else(|| StorageError::lease_lost(&presented.id))?;
        match (stored.state.lease_id(), presented.state.lease_id()) {
            (Some(held), Some(presented_lease)) if held == presented_lease => Ok(stored),
            _ => Err(StorageError::lease_lost(&presented.id)),
        }
    }

    fn insert_if_absent(&mut self, item: &WorkItem) {
        self.items
            .entry(item.id.clone())
            .or_insert_with(|| item.clone());
    }

    fn succeed(&mut self, presented: &WorkItem, retention: Option<usize>) -> Result<(), StorageError> {
        transition(self.reserved_mut(presented)?, ItemState::succeeded())?;
        self.completed.push_back(presented.id.clone());

        let Some(retention) = retention else {
            return Ok(());
        };
        while self.completed.len() > retention {
            let Some(id) = self.completed.pop_front() else {
                break;
            };
            if matches!(
                self.items.get(&id).map(|item| &item.state),
                Some(ItemState::Succeeded { .. })
            ) {
                self.items.remove(&id);
            }
        }
        Ok(())
    }
}

/// In-memory queue backend
///
/// Keeps every item in one map behind a single mutex, so each operation,
/// including [`complete`](Storage::complete), is atomic. Intended for
/// development, tests and single-process deployments; nothing survives a
/// restart.
///
/// Succeeded items are kept so a replayed enqueue stays a no-op, but only
/// the most recent `completed_retention` of them.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    config: MemoryConfig,
}

impl MemoryStorage {
    /// Create a new memory storage with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    /// Number of stored items in any state
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every item and dead letter
    pub fn clear(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.items.clear();
            inner.dead_letters.clear();
            inner.completed.clear();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::unavailable("memory storage lock poisoned"))
    }

    fn check_capacity(&self, inner: &Inner) -> Result<(), StorageError> {
        match self.config.max_items {
            Some(max) if inner.unfinished() >= max => Err(StorageError::capacity_exceeded(
                format!("Memory storage is at capacity ({} items)", max),
            )),
            _ => Ok(()),
        }
    }

    fn maybe_cleanup(&self, inner: &mut Inner) {
        if self.config.auto_cleanup {
            inner
                .items
                .retain(|_, item| !matches!(item.state, ItemState::Succeeded { .. }));
            inner.completed.clear();
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn enqueue(&self, item: &WorkItem) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        if inner.items.contains_key(&item.id) {
            return Ok(());
        }
        self.maybe_cleanup(&mut inner);
        self.check_capacity(&inner)?;
        inner.insert_if_absent(item);
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<WorkItem>, StorageError> {
        let lease = lease_duration(lease)?;
        let now = Utc::now();
        let mut inner = self.lock()?;

        let next_id = inner
            .items
            .values()
            .filter(|item| item.queue == queue && item.is_available(now))
            .min_by(|a, b| {
                a.available_at
                    .cmp(&b.available_at)
                    .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
            })
            .map(|item| item.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(item) = inner.items.get_mut(&id) else {
            return Ok(None);
        };
        if item.state.lease_expired(now) {
            let previous = item.state.holder().unwrap_or_default().to_owned();
            redelivered(item, &previous);
        }
        transition(item, ItemState::reserved(worker_id, lease))?;
        Ok(Some(item.clone()))
    }

    async fn extend_lease(&self, item: &WorkItem, lease: Duration) -> Result<(), StorageError> {
        let lease = lease_duration(lease)?;
        let mut inner = self.lock()?;
        inner.reserved_mut(item)?.state.renew(lease);
        Ok(())
    }

    async fn ack(&self, item: &WorkItem) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.succeed(item, self.config.completed_retention)
    }

    async fn complete(&self, item: &WorkItem, next: Option<&WorkItem>) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.reserved_mut(item)?;
        if let Some(next) = next {
            inner.insert_if_absent(next);
        }
        inner.succeed(item, self.config.completed_retention)
    }

    async fn retry(
        &self,
        item: &WorkItem,
        available_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let stored = inner.reserved_mut(item)?;
        stored.attempt_count = item.attempt_count;
        stored.last_error = item.last_error.clone();
        stored.available_at = available_at;
        transition(stored, ItemState::Pending)
    }

    async fn dead_letter(&self, item: &WorkItem, failure: &Failure) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let stored = inner.reserved_mut(item)?;
        stored.attempt_count = item.attempt_count;
        stored.last_error = Some(failure.message.clone());
        transition(stored, ItemState::dead_lettered())?;
        let record = DeadLetter::new(stored.clone(), failure.clone());
        inner.dead_letters.insert(item.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkItem>, StorageError> {
        Ok(self.lock()?.items.get(id).cloned())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StorageError> {
        let inner = self.lock()?;
        let mut records: Vec<DeadLetter> = inner
            .dead_letters
            .values()
            .filter(|record| record.item.queue == queue)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(records)
    }

    async fn requeue_dead_letter(&self, id: &str) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        let Some(record) = inner.dead_letters.remove(id) else {
            return Ok(false);
        };
        let mut item = record.item;
        item.attempt_count = 0;
        item.available_at = Utc::now();
        transition(&mut item, ItemState::Pending)?;
        inner.items.insert(item.id.clone(), item);
        Ok(true)
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.queue == queue && item.state == ItemState::Pending)
            .count())
    }

    fn supports_atomic_complete(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Arg, FailureKind};

    const QUEUE: &str = "taskq_queues:default";
    const LEASE: Duration = Duration::from_secs(30);

    fn create_test_item() -> WorkItem {
        WorkItem::new("test_job", &[Arg::from("test_arg")], QUEUE).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_fetch_ack() {
        let storage = MemoryStorage::new();
        let item = create_test_item();

        storage.enqueue(&item).await.unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 1);

        let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(fetched.id, item.id);
        assert_eq!(fetched.state.holder(), Some("w1"));
        assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 0);

        // Reserved items are not handed out twice
        assert!(storage.fetch(QUEUE, "w2", LEASE).await.unwrap().is_none());

        storage.ack(&fetched).await.unwrap();
        let stored = storage.get(&item.id).await.unwrap().unwrap();
        assert!(matches!(stored.state, ItemState::Succeeded { .. }));
        assert!(storage.fetch(QUEUE, "w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_is_insert_if_absent() {
        let storage = MemoryStorage::new();
        let item = create_test_item();
        storage.enqueue(&item).await.unwrap();

        let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        storage.ack(&fetched).await.unwrap();

        // Replaying the same id does not resurrect the item
        storage.enqueue(&item).await.unwrap();
        assert_eq!(storage.len(), 1);
        assert!(storage.fetch(QUEUE, "w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_respects_available_at_and_queue() {
        let storage = MemoryStorage::new();
        let later = create_test_item().with_available_at(Utc::now() + chrono::Duration::hours(1));
        let other = WorkItem::new("test_job", &[], "taskq_queues:other").unwrap();
        storage.enqueue_delayed(&later).await.unwrap();
        storage.enqueue(&other).await.unwrap();

        assert!(storage.fetch(QUEUE, "w1", LEASE).await.unwrap().is_none());
        assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 1);

        let fetched = storage
            .fetch("taskq_queues:other", "w1", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, other.id);
    }

    #[tokio::test]
    async fn test_fetch_order_follows_available_at() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let second = create_test_item().with_available_at(now - chrono::Duration::seconds(1));
        let first = create_test_item().with_available_at(now - chrono::Duration::seconds(5));
        storage.enqueue(&second).await.unwrap();
        storage.enqueue(&first).await.unwrap();

        let a = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        let b = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
    }

    #[tokio::test]
    async fn test_expired_lease_is_refetched_and_old_holder_loses() {
        let storage = MemoryStorage::new();
        let item = create_test_item();
        storage.enqueue(&item).await.unwrap();

        let stale = storage
            .fetch(QUEUE, "w1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = storage.fetch(QUEUE, "w2", LEASE).await.unwrap().unwrap();
        assert_eq!(fresh.id, item.id);
        assert_eq!(fresh.state.holder(), Some("w2"));
        // The lapsed reservation counts as an attempt
        assert_eq!(fresh.attempt_count, 1);
        assert_eq!(
            fresh.last_error.as_deref(),
            Some("lease expired while held by w1")
        );

        let err = storage.ack(&stale).await.unwrap_err();
        assert!(matches!(err, StorageError::LeaseLost { .. }));
        storage.ack(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_lease_keeps_reservation() {
        let storage = MemoryStorage::new();
        storage.enqueue(&create_test_item()).await.unwrap();

        let held = storage
            .fetch(QUEUE, "w1", Duration::from_millis(150))
            .await
            .unwrap()
            .unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            storage
                .extend_lease(&held, Duration::from_millis(150))
                .await
                .unwrap();
        }

        // The original lease would have lapsed by now
        assert!(storage.fetch(QUEUE, "w2", LEASE).await.unwrap().is_none());
        storage.ack(&held).await.unwrap();
        let stored = storage.get(&held.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_extend_lease_fails_for_lost_reservation() {
        let storage = MemoryStorage::new();
        storage.enqueue(&create_test_item()).await.unwrap();

        let stale = storage
            .fetch(QUEUE, "w1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        storage.fetch(QUEUE, "w2", LEASE).await.unwrap().unwrap();

        let err = storage.extend_lease(&stale, LEASE).await.unwrap_err();
        assert!(matches!(err, StorageError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_retry_persists_attempt_and_delay() {
        let storage = MemoryStorage::new();
        storage.enqueue(&create_test_item()).await.unwrap();

        let mut fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        fetched.attempt_count = 1;
        fetched.last_error = Some("boom".into());
        let at = Utc::now() + chrono::Duration::hours(1);
        storage.retry(&fetched, at).await.unwrap();

        let stored = storage.get(&fetched.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.available_at, at);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(storage.fetch(QUEUE, "w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_and_requeue() {
        let storage = MemoryStorage::new();
        storage.enqueue(&create_test_item()).await.unwrap();

        let mut fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        fetched.attempt_count = 3;
        let failure = Failure::new(FailureKind::Handler, "card declined", 3);
        storage.dead_letter(&fetched, &failure).await.unwrap();

        let dead = storage.dead_letters(QUEUE).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failure.attempt_count, 3);
        assert_eq!(dead[0].item.id, fetched.id);
        assert!(storage.fetch(QUEUE, "w1", LEASE).await.unwrap().is_none());

        assert!(storage.requeue_dead_letter(&fetched.id).await.unwrap());
        assert!(!storage.requeue_dead_letter(&fetched.id).await.unwrap());
        assert!(storage.dead_letters(QUEUE).await.unwrap().is_empty());

        let again = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_complete_enqueues_successor_once() {
        let storage = MemoryStorage::new();
        let steps = vec![
            crate::core::ChainStep::new("charge", &[Arg::from(10)]).unwrap(),
            crate::core::ChainStep::new("ship", &[]).unwrap(),
        ];
        let first = WorkItem::for_chain_step("c1", 0, steps[0].clone(), steps[1..].to_vec(), QUEUE);
        storage.enqueue(&first).await.unwrap();

        let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        let next = fetched.next_chain_item().unwrap();
        storage.complete(&fetched, Some(&next)).await.unwrap();

        // A replayed completion is rejected and cannot duplicate the successor
        assert!(storage.complete(&fetched, Some(&next)).await.is_err());
        assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 1);

        let second = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(second.id, "c1:1");
        assert_eq!(second.job_signature, "ship");
        assert!(storage.supports_atomic_complete());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let storage = MemoryStorage::with_config(MemoryConfig::new().with_max_items(2));

        storage.enqueue(&create_test_item()).await.unwrap();
        storage.enqueue(&create_test_item()).await.unwrap();

        let result = storage.enqueue(&create_test_item()).await;
        assert!(matches!(
            result.unwrap_err(),
            StorageError::CapacityExceeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_auto_cleanup_drops_succeeded_items() {
        let config = MemoryConfig::new().with_max_items(2).with_auto_cleanup(true);
        let storage = MemoryStorage::with_config(config);

        storage.enqueue(&create_test_item()).await.unwrap();
        let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
        storage.ack(&fetched).await.unwrap();
        storage.enqueue(&create_test_item()).await.unwrap();

        storage.enqueue(&create_test_item()).await.unwrap();
        assert_eq!(storage.len(), 2);
        assert!(storage.get(&fetched.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_succeeded_items_are_bounded_by_retention() {
        let storage = MemoryStorage::new();
        let retention = MemoryConfig::default().completed_retention.unwrap();

        let mut last = None;
        for _ in 0..20_000 {
            storage.enqueue(&create_test_item()).await.unwrap();
            let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
            storage.ack(&fetched).await.unwrap();
            last = Some(fetched.id);
        }

        assert!(storage.len() <= retention);
        // The newest completion is still there for replay detection
        let last = last.unwrap();
        assert!(matches!(
            storage.get(&last).await.unwrap().unwrap().state,
            ItemState::Succeeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_retention_never_drops_unfinished_items() {
        let config = MemoryConfig::new().with_completed_retention(Some(1));
        let storage = MemoryStorage::with_config(config);

        let waiting = create_test_item().with_available_at(Utc::now() + chrono::Duration::hours(1));
        storage.enqueue(&waiting).await.unwrap();
        for _ in 0..3 {
            storage.enqueue(&create_test_item()).await.unwrap();
            let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
            storage.ack(&fetched).await.unwrap();
        }

        assert_eq!(storage.len(), 2);
        assert_eq!(
            storage.get(&waiting.id).await.unwrap().unwrap().state,
            ItemState::Pending
        );
    }

    #[tokio::test]
    async fn test_unlimited_retention_keeps_every_completion() {
        let config = MemoryConfig::new().with_completed_retention(None);
        let storage = MemoryStorage::with_config(config);
        for _ in 0..5 {
            storage.enqueue(&create_test_item()).await.unwrap();
            let fetched = storage.fetch(QUEUE, "w1", LEASE).await.unwrap().unwrap();
            storage.ack(&fetched).await.unwrap();
        }
        assert_eq!(storage.len(), 5);
    }
}
