use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskq::config::DriverKind;
use taskq::storage::{MemoryConfig, StorageConfig, StorageInstance};
use taskq::{Arg, ChainAbort, Failure, FailureKind, ItemState, MapConfig, Storage, WorkItem};

#[cfg(feature = "redis")]
use taskq::storage::RedisConfig;

const QUEUE: &str = "taskq_queues:integration";
const LEASE: Duration = Duration::from_secs(30);

fn item(signature: &str) -> WorkItem {
    WorkItem::new(signature, &[Arg::from("user@test.com")], QUEUE).unwrap()
}

/// Test the storage factory pattern with a memory configuration
#[tokio::test]
async fn test_storage_factory_memory() {
    let config = StorageConfig::Memory(MemoryConfig::new().with_max_items(100));
    let storage = StorageInstance::from_config(config).await.unwrap();

    let item = item("email_job");
    storage.enqueue(&item).await.unwrap();

    let retrieved = storage.get(&item.id).await.unwrap().unwrap();
    assert_eq!(retrieved.id, item.id);
    assert_eq!(retrieved.state, ItemState::Pending);
    assert!(storage.supports_atomic_complete());
}

#[tokio::test]
#[cfg(feature = "redis")]
async fn test_storage_factory_redis() {
    let config = StorageConfig::Redis(
        RedisConfig::new()
            .with_url(std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()))
            .with_key_prefix(format!("taskq_it_{}", uuid::Uuid::new_v4().simple()))
            .with_database(3),
    );

    match StorageInstance::from_config(config).await {
        Ok(storage) => exercise_lifecycle(&storage).await,
        Err(_) => println!("Redis not available, skipping Redis factory test"),
    }
}

/// Storage configuration read from the same tree the resolver uses
#[test]
fn test_storage_config_from_source() {
    let mut config = MapConfig::new();
    config.add(
        "queue.connections",
        json!({
            "memory": {"driver": "memory", "max_items": 25, "auto_cleanup": "yes"},
            "sync": {"driver": "sync"}
        }),
    );

    match StorageConfig::from_source(&config, "memory", DriverKind::Memory).unwrap() {
        StorageConfig::Memory(memory) => {
            assert_eq!(memory.max_items, Some(25));
            assert!(memory.auto_cleanup);
        }
        #[allow(unreachable_patterns)]
        other => panic!("unexpected config {:?}", other),
    }

    assert!(
        StorageConfig::from_source(&config, "sync", DriverKind::Sync)
            .unwrap_err()
            .is_configuration_error()
    );
}

/// Same lifecycle checks for any backend
async fn exercise_lifecycle(storage: &StorageInstance) {
    let first = item("email_job");
    let delayed = item("report_job").with_available_at(chrono::Utc::now() + chrono::Duration::minutes(30));
    storage.enqueue(&first).await.unwrap();
    storage.enqueue_delayed(&delayed).await.unwrap();
    // Replayed enqueue is a no-op
    storage.enqueue(&first).await.unwrap();
    assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 2);

    let fetched = storage.fetch(QUEUE, "worker-1", LEASE).await.unwrap().unwrap();
    assert_eq!(fetched.id, first.id);
    assert_eq!(fetched.state.holder(), Some("worker-1"));
    assert!(storage.fetch(QUEUE, "worker-2", LEASE).await.unwrap().is_none());

    let mut retried = fetched.clone();
    retried.attempt_count = 1;
    retried.last_error = Some("smtp down".into());
    storage.retry(&retried, chrono::Utc::now()).await.unwrap();

    let again = storage.fetch(QUEUE, "worker-2", LEASE).await.unwrap().unwrap();
    assert_eq!(again.attempt_count, 1);
    assert_eq!(again.last_error.as_deref(), Some("smtp down"));

    // The first reservation is gone
    assert!(storage.ack(&fetched).await.is_err());

    let failure = Failure::new(FailureKind::Handler, "bounced", 1);
    storage.dead_letter(&again, &failure).await.unwrap();
    let dead = storage.dead_letters(QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure, failure);

    assert!(storage.requeue_dead_letter(&first.id).await.unwrap());
    let requeued = storage.fetch(QUEUE, "worker-3", LEASE).await.unwrap().unwrap();
    assert_eq!(requeued.attempt_count, 0);
    storage.ack(&requeued).await.unwrap();
    assert!(matches!(
        storage.get(&first.id).await.unwrap().unwrap().state,
        ItemState::Succeeded { .. }
    ));
}

#[tokio::test]
async fn test_memory_lifecycle() {
    exercise_lifecycle(&StorageInstance::memory()).await;
}

/// Completing a chain element enqueues its successor exactly once
#[tokio::test]
async fn test_chain_completion_is_idempotent() {
    let storage: Arc<dyn Storage> = Arc::new(StorageInstance::memory());
    let steps = vec![
        taskq::core::ChainStep::new("charge", &[Arg::from(42_i64)]).unwrap(),
        taskq::core::ChainStep::new("ship", &[Arg::from(42_i64)]).unwrap(),
    ];
    let head = WorkItem::for_chain_step("order-42", 0, steps[0].clone(), steps[1..].to_vec(), QUEUE);
    storage.enqueue(&head).await.unwrap();

    let fetched = storage.fetch(QUEUE, "w", LEASE).await.unwrap().unwrap();
    let next = fetched.next_chain_item().unwrap();
    storage.complete(&fetched, Some(&next)).await.unwrap();
    // A replay after a crash must not duplicate the successor
    storage.enqueue(&next).await.unwrap();

    assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 1);
    let ship = storage.fetch(QUEUE, "w", LEASE).await.unwrap().unwrap();
    assert_eq!(ship.id, "order-42:1");
    assert_eq!(ship.job_signature, "ship");

    let abort = ChainAbort {
        chain_id: "order-42".into(),
        position: 1,
        skipped: ship.chain_skipped(),
    };
    assert_eq!(abort.skipped, 0);
}

/// Concurrent producers on one backend
#[tokio::test]
async fn test_concurrent_storage_access() {
    let storage: Arc<dyn Storage> = Arc::new(StorageInstance::memory());

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let item = WorkItem::new(format!("concurrent_job_{}", i), &[Arg::from(i as i64)], QUEUE).unwrap();
                storage.enqueue(&item).await.unwrap();
                assert!(storage.get(&item.id).await.unwrap().is_some());
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(storage.pending_count(QUEUE).await.unwrap(), 10);
}

/// Storage configuration survives a serde round trip
#[test]
fn test_config_serialization_roundtrip() {
    let memory_config = StorageConfig::Memory(MemoryConfig::new().with_max_items(500).with_auto_cleanup(true));
    let json = serde_json::to_string(&memory_config).unwrap();
    let deserialized: StorageConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(memory_config, deserialized);

    #[cfg(feature = "redis")]
    {
        let redis_config = StorageConfig::Redis(
            RedisConfig::new()
                .with_url("redis://test:6379")
                .with_key_prefix("test_prefix")
                .with_database(5),
        );
        let json = serde_json::to_string(&redis_config).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(redis_config, deserialized);
    }
}
