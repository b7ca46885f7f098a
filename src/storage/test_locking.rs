//! Race tests for leased fetching
//!
//! These verify that concurrent workers never receive the same available
//! item while its lease is held, and that a successor enqueued by a replayed
//! completion is stored once.

use crate::core::{Arg, WorkItem};
use crate::storage::{MemoryStorage, Storage};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "taskq_queues:race";
const LEASE: Duration = Duration::from_secs(60);

fn create_test_item(n: i64) -> WorkItem {
    WorkItem::new("race_job", &[Arg::from(n)], QUEUE).unwrap()
}

async fn fetch_concurrently(storage: Arc<dyn Storage>, workers: usize) -> Vec<Option<WorkItem>> {
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .fetch(QUEUE, &format!("worker_{}", i), LEASE)
                    .await
                    .unwrap()
            })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

/// Multiple workers racing for one item: exactly one wins
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_single_item_single_winner() {
    let storage = Arc::new(MemoryStorage::new());
    storage.enqueue(&create_test_item(1)).await.unwrap();

    let results = fetch_concurrently(storage, 10).await;
    let winners = results.iter().filter(|r| r.is_some()).count();
    assert_eq!(winners, 1, "Only one worker should fetch the item");
}

/// Many items, many workers: every item is handed out exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_items_are_distributed_without_duplicates() {
    let storage = Arc::new(MemoryStorage::new());
    for n in 0..20 {
        storage.enqueue(&create_test_item(n)).await.unwrap();
    }

    let results = fetch_concurrently(storage.clone(), 30).await;
    let ids: Vec<String> = results.into_iter().flatten().map(|i| i.id).collect();
    let unique: HashSet<&String> = ids.iter().collect();

    assert_eq!(ids.len(), 20);
    assert_eq!(unique.len(), 20, "No item may be fetched twice");
    assert!(storage.fetch(QUEUE, "late", LEASE).await.unwrap().is_none());
}

/// Racing completions of the same reservation enqueue the successor once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_replayed_completion_stores_successor_once() {
    let storage = Arc::new(MemoryStorage::new());
    let steps = vec![
        crate::core::ChainStep::new("first", &[]).unwrap(),
        crate::core::ChainStep::new("second", &[]).unwrap(),
    ];
    let head = WorkItem::for_chain_step("chain", 0, steps[0].clone(), steps[1..].to_vec(), QUEUE);
    storage.enqueue(&head).await.unwrap();

    let fetched = storage.fetch(QUEUE, "w", LEASE).await.unwrap().unwrap();
    let next = fetched.next_chain_item().unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let storage = Arc::clone(&storage);
            let fetched = fetched.clone();
            let next = next.clone();
            tokio::spawn(async move { storage.complete(&fetched, Some(&next)).await.is_ok() })
        })
        .collect();
    let successes = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 1);
    assert_eq!(storage.len(), 2);
}

#[cfg(feature = "redis")]
mod redis_races {
    use super::*;
    use crate::storage::{RedisConfig, RedisStorage};

    async fn create_storage() -> Option<Arc<RedisStorage>> {
        let config = RedisConfig::new()
            .with_url(
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            )
            .with_key_prefix(format!("taskq_race_{}", uuid::Uuid::new_v4()));
        RedisStorage::with_config(config).await.ok().map(Arc::new)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_redis_single_item_single_winner() {
        let Some(storage) = create_storage().await else {
            println!("Skipping Redis race test - Redis not available");
            return;
        };
        storage.enqueue(&create_test_item(1)).await.unwrap();

        let results = fetch_concurrently(storage, 10).await;
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    }
}
