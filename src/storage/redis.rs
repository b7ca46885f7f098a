use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, RedisError, RedisResult, aio::ConnectionManager};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;

use super::{RedisConfig, Storage, StorageError, lease_duration, redelivered, transition};
use crate::core::{DeadLetter, Failure, ItemState, WorkItem};

/// Moves an available item id from the pending (or expired reserved) set
/// into the reserved set and records the lease. Returns the item JSON and
/// the previous holder, empty unless the item was taken over from a lapsed
/// lease.
const FETCH_SCRIPT: &str = r#"
    local pending_key = KEYS[1]
    local reserved_key = KEYS[2]
    local now = tonumber(ARGV[1])
    local prefix = ARGV[6]

    local id = nil
    local previous = ''
    local ids = redis.call('ZRANGEBYSCORE', pending_key, '-inf', now, 'LIMIT', 0, 1)
    if #ids > 0 then
        id = ids[1]
        redis.call('ZREM', pending_key, id)
    else
        ids = redis.call('ZRANGEBYSCORE', reserved_key, '-inf', now, 'LIMIT', 0, 1)
        if #ids > 0 then
            id = ids[1]
            previous = redis.call('HGET', prefix .. ':lease:' .. id, 'worker_id') or '?'
        end
    end
    if not id then
        return nil
    end

    local item = redis.call('GET', prefix .. ':item:' .. id)
    if not item then
        redis.call('ZREM', reserved_key, id)
        return nil
    end

    redis.call('ZADD', reserved_key, ARGV[2], id)
    redis.call('HSET', prefix .. ':lease:' .. id,
        'worker_id', ARGV[3], 'lease_id', ARGV[4], 'reserved_at', ARGV[5], 'expires_ms', ARGV[2])
    return {item, previous}
"#;

const EXTEND_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'lease_id') ~= ARGV[1] then
        return -1
    end
    redis.call('HSET', KEYS[1], 'expires_ms', ARGV[2])
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
    return 1
"#;

const ENQUEUE_SCRIPT: &str = r#"
    if redis.call('SETNX', KEYS[1], ARGV[1]) == 1 then
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
        return 1
    end
    return 0
"#;

/// Acknowledges an item and, when ARGV[4] is non-empty, enqueues its
/// successor in the same step.
const COMPLETE_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[2], 'lease_id') ~= ARGV[1] then
        return -1
    end
    if ARGV[4] ~= '' then
        if redis.call('SETNX', KEYS[4], ARGV[4]) == 1 then
            redis.call('ZADD', KEYS[5], ARGV[5], ARGV[6])
        end
    end
    redis.call('DEL', KEYS[2])
    redis.call('ZREM', KEYS[3], ARGV[7])
    redis.call('SET', KEYS[1], ARGV[2])
    if tonumber(ARGV[3]) > 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[3])
    end
    return 1
"#;

const RETRY_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[2], 'lease_id') ~= ARGV[1] then
        return -1
    end
    redis.call('DEL', KEYS[2])
    redis.call('ZREM', KEYS[3], ARGV[4])
    redis.call('SET', KEYS[1], ARGV[2])
    redis.call('ZADD', KEYS[4], ARGV[3], ARGV[4])
    return 1
"#;

const DEAD_LETTER_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[2], 'lease_id') ~= ARGV[1] then
        return -1
    end
    redis.call('DEL', KEYS[2])
    redis.call('ZREM', KEYS[3], ARGV[5])
    redis.call('SET', KEYS[1], ARGV[2])
    redis.call('SET', KEYS[5], ARGV[3])
    redis.call('ZADD', KEYS[4], ARGV[4], ARGV[5])
    return 1
"#;

const REQUEUE_SCRIPT: &str = r#"
    if redis.call('DEL', KEYS[1]) == 0 then
        return 0
    end
    redis.call('ZREM', KEYS[2], ARGV[3])
    redis.call('SET', KEYS[3], ARGV[1])
    redis.call('ZADD', KEYS[4], ARGV[2], ARGV[3])
    return 1
"#;

/// Redis queue backend
///
/// Layout under `key_prefix`:
///
/// ```text
/// {prefix}:item:{id}          item JSON (state as last persisted)
/// {prefix}:lease:{id}         hash of the current reservation
/// {prefix}:pending:{queue}    zset of ids scored by available_at (ms)
/// {prefix}:reserved:{queue}   zset of ids scored by lease expiry (ms)
/// {prefix}:dead:{queue}       zset of dead-lettered ids scored by failure time
/// {prefix}:dead_item:{id}     dead letter JSON
/// ```
///
/// Every state change is a single Lua script, so completion together with
/// the chain successor is atomic. Item JSON is never decoded inside Lua.
pub struct RedisStorage {
    connection_manager: ConnectionManager,
    config: RedisConfig,
}

impl RedisStorage {
    /// Create a new Redis storage with the specified configuration
    pub async fn with_config(config: RedisConfig) -> Result<Self, StorageError> {
        let client = Client::open(config.full_url()).map_err(|e| {
            StorageError::connection_with_source("Failed to create Redis client", Box::new(e))
        })?;

        let connection_manager = timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StorageError::timeout(config.connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                StorageError::connection_with_source(
                    "Failed to create connection manager",
                    Box::new(e),
                )
            })?;

        Ok(Self {
            connection_manager,
            config,
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    /// Execute a Redis command with timeout
    async fn with_timeout<F, T>(&self, operation: &str, future: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = RedisResult<T>>,
    {
        timeout(self.config.command_timeout, future)
            .await
            .map_err(|_| StorageError::timeout(self.config.command_timeout.as_millis() as u64))?
            .map_err(|e| Self::command_error(operation, e))
    }

    fn command_error(operation: &str, e: RedisError) -> StorageError {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            StorageError::connection_with_source(
                format!("Redis {} failed: {}", operation, e),
                Box::new(e),
            )
        } else {
            StorageError::operation_failed_with_source(operation, e.to_string(), Box::new(e))
        }
    }

    fn item_key(&self, id: &str) -> String {
        format!("{}:item:{}", self.config.key_prefix, id)
    }

    fn lease_key(&self, id: &str) -> String {
        format!("{}:lease:{}", self.config.key_prefix, id)
    }

    fn pending_key(&self, queue: &str) -> String {
        format!("{}:pending:{}", self.config.key_prefix, queue)
    }

    fn reserved_key(&self, queue: &str) -> String {
        format!("{}:reserved:{}", self.config.key_prefix, queue)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:dead:{}", self.config.key_prefix, queue)
    }

    fn dead_item_key(&self, id: &str) -> String {
        format!("{}:dead_item:{}", self.config.key_prefix, id)
    }

    fn completed_ttl_secs(&self) -> u64 {
        self.config
            .completed_item_ttl
            .map(|ttl| ttl.as_secs().max(1))
            .unwrap_or(0)
    }

    fn lease_id(item: &WorkItem) -> Result<&str, StorageError> {
        item.state
            .lease_id()
            .ok_or_else(|| StorageError::lease_lost(&item.id))
    }

    fn parse_item(json: &str) -> Result<WorkItem, StorageError> {
        serde_json::from_str(json).map_err(|e| {
            StorageError::serialization_with_source("Failed to parse work item", Box::new(e))
        })
    }

    /// Stored copy of `item` in `state`.
    fn persisted(item: &WorkItem, state: ItemState) -> Result<String, StorageError> {
        let mut copy = item.clone();
        transition(&mut copy, state)?;
        Ok(serde_json::to_string(&copy)?)
    }

    fn checked(item: &WorkItem, outcome: i64) -> Result<(), StorageError> {
        if outcome < 0 {
            return Err(StorageError::lease_lost(&item.id));
        }
        Ok(())
    }

    /// Rebuild the reserved state from a lease hash.
    fn lease_state(fields: &HashMap<String, String>) -> Option<ItemState> {
        let reserved_at = DateTime::parse_from_rfc3339(fields.get("reserved_at")?)
            .ok()?
            .with_timezone(&Utc);
        let expires_ms = fields.get("expires_ms")?.parse::<i64>().ok()?;
        Some(ItemState::Reserved {
            worker_id: fields.get("worker_id")?.clone(),
            lease_id: fields.get("lease_id")?.clone(),
            reserved_at,
            lease_expires_at: DateTime::from_timestamp_millis(expires_ms)?,
        })
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn enqueue(&self, item: &WorkItem) -> Result<(), StorageError> {
        let mut conn = self.connection();
        let json = serde_json::to_string(item)?;
        let _: i64 = self
            .with_timeout(
                "enqueue",
                redis::Script::new(ENQUEUE_SCRIPT)
                    .key(self.item_key(&item.id))
                    .key(self.pending_key(&item.queue))
                    .arg(json)
                    .arg(item.available_at.timestamp_millis())
                    .arg(&item.id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<WorkItem>, StorageError> {
        let state = ItemState::reserved(worker_id, lease_duration(lease)?);
        let ItemState::Reserved {
            lease_id,
            reserved_at,
            lease_expires_at,
            ..
        } = &state
        else {
            return Ok(None);
        };

        let mut conn = self.connection();
        let result: Option<(String, String)> = self
            .with_timeout(
                "fetch",
                redis::Script::new(FETCH_SCRIPT)
                    .key(self.pending_key(queue))
                    .key(self.reserved_key(queue))
                    .arg(reserved_at.timestamp_millis())
                    .arg(lease_expires_at.timestamp_millis())
                    .arg(worker_id)
                    .arg(lease_id)
                    .arg(reserved_at.to_rfc3339())
                    .arg(&self.config.key_prefix)
                    .invoke_async(&mut conn),
            )
            .await?;

        let Some((json, previous)) = result else {
            return Ok(None);
        };
        let mut item = Self::parse_item(&json)?;
        if !previous.is_empty() {
            // Persist the extra attempt so the next takeover sees it
            redelivered(&mut item, &previous);
            let stored = serde_json::to_string(&item)?;
            let _: () = self
                .with_timeout("fetch", conn.set(self.item_key(&item.id), stored))
                .await?;
        }
        transition(&mut item, state)?;
        Ok(Some(item))
    }

    async fn extend_lease(&self, item: &WorkItem, lease: Duration) -> Result<(), StorageError> {
        let lease_id = Self::lease_id(item)?;
        let expires_at = Utc::now() + lease_duration(lease)?;
        let mut conn = self.connection();
        let outcome: i64 = self
            .with_timeout(
                "extend_lease",
                redis::Script::new(EXTEND_SCRIPT)
                    .key(self.lease_key(&item.id))
                    .key(self.reserved_key(&item.queue))
                    .arg(lease_id)
                    .arg(expires_at.timestamp_millis())
                    .arg(&item.id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Self::checked(item, outcome)
    }

    async fn ack(&self, item: &WorkItem) -> Result<(), StorageError> {
        self.complete(item, None).await
    }

    async fn complete(&self, item: &WorkItem, next: Option<&WorkItem>) -> Result<(), StorageError> {
        let lease_id = Self::lease_id(item)?;
        let stored = Self::persisted(item, ItemState::succeeded())?;
        let (next_item_key, next_pending_key, next_json, next_score, next_id) = match next {
            Some(next) => (
                self.item_key(&next.id),
                self.pending_key(&next.queue),
                serde_json::to_string(next)?,
                next.available_at.timestamp_millis(),
                next.id.clone(),
            ),
            None => (String::new(), String::new(), String::new(), 0, String::new()),
        };

        let mut conn = self.connection();
        let outcome: i64 = self
            .with_timeout(
                "complete",
                redis::Script::new(COMPLETE_SCRIPT)
                    .key(self.item_key(&item.id))
                    .key(self.lease_key(&item.id))
                    .key(self.reserved_key(&item.queue))
                    .key(next_item_key)
                    .key(next_pending_key)
                    .arg(lease_id)
                    .arg(stored)
                    .arg(self.completed_ttl_secs())
                    .arg(next_json)
                    .arg(next_score)
                    .arg(next_id)
                    .arg(&item.id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Self::checked(item, outcome)
    }

    async fn retry(
        &self,
        item: &WorkItem,
        available_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let lease_id = Self::lease_id(item)?;
        let mut pending = item.clone();
        pending.available_at = available_at;
        let stored = Self::persisted(&pending, ItemState::Pending)?;

        let mut conn = self.connection();
        let outcome: i64 = self
            .with_timeout(
                "retry",
                redis::Script::new(RETRY_SCRIPT)
                    .key(self.item_key(&item.id))
                    .key(self.lease_key(&item.id))
                    .key(self.reserved_key(&item.queue))
                    .key(self.pending_key(&item.queue))
                    .arg(lease_id)
                    .arg(stored)
                    .arg(available_at.timestamp_millis())
                    .arg(&item.id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Self::checked(item, outcome)
    }

    async fn dead_letter(&self, item: &WorkItem, failure: &Failure) -> Result<(), StorageError> {
        let lease_id = Self::lease_id(item)?;
        let mut dead = item.clone();
        transition(&mut dead, ItemState::dead_lettered())?;
        dead.last_error = Some(failure.message.clone());
        let record = DeadLetter::new(dead.clone(), failure.clone());

        let mut conn = self.connection();
        let outcome: i64 = self
            .with_timeout(
                "dead_letter",
                redis::Script::new(DEAD_LETTER_SCRIPT)
                    .key(self.item_key(&item.id))
                    .key(self.lease_key(&item.id))
                    .key(self.reserved_key(&item.queue))
                    .key(self.dead_key(&item.queue))
                    .key(self.dead_item_key(&item.id))
                    .arg(lease_id)
                    .arg(serde_json::to_string(&dead)?)
                    .arg(serde_json::to_string(&record)?)
                    .arg(record.failed_at.timestamp_millis())
                    .arg(&item.id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Self::checked(item, outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<WorkItem>, StorageError> {
        let mut conn = self.connection();
        let json: Option<String> = self.with_timeout("get", conn.get(self.item_key(id))).await?;
        let Some(json) = json else {
            return Ok(None);
        };
        let mut item = Self::parse_item(&json)?;

        if item.state == ItemState::Pending {
            let lease: HashMap<String, String> = self
                .with_timeout("get", conn.hgetall(self.lease_key(id)))
                .await?;
            if let Some(state) = Self::lease_state(&lease) {
                item.state = state;
            }
        }
        Ok(Some(item))
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StorageError> {
        let mut conn = self.connection();
        let ids: Vec<String> = self
            .with_timeout("dead_letters", conn.zrange(self.dead_key(queue), 0, -1))
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let json: Option<String> = self
                .with_timeout("dead_letters", conn.get(self.dead_item_key(&id)))
                .await?;
            if let Some(json) = json {
                records.push(serde_json::from_str::<DeadLetter>(&json).map_err(|e| {
                    StorageError::serialization_with_source(
                        "Failed to parse dead letter",
                        Box::new(e),
                    )
                })?);
            }
        }
        Ok(records)
    }

    async fn requeue_dead_letter(&self, id: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection();
        let json: Option<String> = self
            .with_timeout("requeue", conn.get(self.dead_item_key(id)))
            .await?;
        let Some(json) = json else {
            return Ok(false);
        };
        let record: DeadLetter = serde_json::from_str(&json)?;

        let mut item = record.item;
        item.attempt_count = 0;
        item.available_at = Utc::now();
        transition(&mut item, ItemState::Pending)?;

        let outcome: i64 = self
            .with_timeout(
                "requeue",
                redis::Script::new(REQUEUE_SCRIPT)
                    .key(self.dead_item_key(id))
                    .key(self.dead_key(&item.queue))
                    .key(self.item_key(id))
                    .key(self.pending_key(&item.queue))
                    .arg(serde_json::to_string(&item)?)
                    .arg(item.available_at.timestamp_millis())
                    .arg(id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(outcome == 1)
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("pending_count", conn.zcard(self.pending_key(queue)))
            .await
    }

    fn supports_atomic_complete(&self) -> bool {
        true
    }
}
