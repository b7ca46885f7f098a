//! Queue configuration resolution.
//!
//! [`QueueConfigResolver::resolve`] turns a `(connection, queue)` pair, either
//! of which may be empty, into an immutable [`QueueConfig`] snapshot:
//!
//! 1. an empty connection means `queue.default`;
//! 2. the connection must have a `queue.connections.<name>.driver` entry,
//!    otherwise [`TaskqError::UnknownConnection`];
//! 3. the queue is the explicit argument, else the connection's `queue`
//!    key, else the default connection's `queue` key, else `"default"`.
//!
//! Physical queue keys are namespaced by application:
//! `"{app.name}_queues:{queue}"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::ConfigSource;
use crate::error::{Result, TaskqError};
use crate::processing::retry::{RetryPolicy, RetryStrategy};

/// Backend family a connection is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Process-local queue
    Memory,
    /// Redis sorted sets driven by Lua scripts
    Redis,
    /// PostgreSQL table with `FOR UPDATE SKIP LOCKED`
    Postgres,
    /// No queue; jobs run inline at dispatch time
    Sync,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Memory => "memory",
            DriverKind::Redis => "redis",
            DriverKind::Postgres => "postgres",
            DriverKind::Sync => "sync",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = TaskqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "redis" => Ok(DriverKind::Redis),
            "postgres" | "postgresql" => Ok(DriverKind::Postgres),
            "sync" => Ok(DriverKind::Sync),
            other => Err(TaskqError::configuration(format!(
                "Unsupported queue driver: {:?}",
                other
            ))),
        }
    }
}

/// Resolved settings for one `(connection, queue)` binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Connection name as configured
    pub connection: String,
    /// Logical queue name
    pub queue: String,
    /// Namespaced key the backend stores items under
    pub queue_key: String,
    pub driver: DriverKind,
    /// Maximum jobs a worker runs at once
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Sleep between fetches when the queue is empty
    pub poll_interval: Duration,
    /// How long a fetched item stays reserved
    pub lease: Duration,
    /// Per-job execution limit
    pub job_timeout: Option<Duration>,
    /// How long shutdown waits for running jobs
    pub shutdown_grace: Duration,
}

impl QueueConfig {
    /// Default settings for an ad-hoc binding, mostly useful in tests.
    pub fn new(connection: impl Into<String>, queue: impl Into<String>, driver: DriverKind) -> Self {
        let queue = queue.into();
        Self {
            connection: connection.into(),
            queue_key: queue_key("taskq", &queue),
            queue,
            driver,
            concurrency: 1,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(1000),
            lease: Duration::from_secs(300),
            job_timeout: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry.retry_limit
    }
}

/// Physical key of a logical queue.
pub fn queue_key(app_name: &str, queue: &str) -> String {
    format!("{}_queues:{}", app_name, queue)
}

/// Side-effect-free resolver over a [`ConfigSource`].
#[derive(Clone)]
pub struct QueueConfigResolver {
    config: Arc<dyn ConfigSource>,
}

impl fmt::Debug for QueueConfigResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfigResolver").finish_non_exhaustive()
    }
}

impl QueueConfigResolver {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self { config }
    }

    pub fn source(&self) -> &Arc<dyn ConfigSource> {
        &self.config
    }

    pub fn app_name(&self) -> String {
        self.config.get_string("app.name", "taskq")
    }

    /// Name of the global default connection (`queue.default`).
    pub fn default_connection(&self) -> Result<String> {
        let name = self.config.get_string("queue.default", "");
        if name.is_empty() {
            return Err(TaskqError::configuration(
                "queue.default is not configured",
            ));
        }
        Ok(name)
    }

    /// Driver of a named connection.
    pub fn driver(&self, connection: &str) -> Result<DriverKind> {
        let driver = self
            .config
            .get_string(&connection_key(connection, "driver"), "");
        if driver.is_empty() {
            return Err(TaskqError::UnknownConnection {
                connection: connection.to_string(),
            });
        }
        driver.parse()
    }

    /// Resolve a binding; empty arguments fall back to configured defaults.
    pub fn resolve(&self, connection: &str, queue: &str) -> Result<QueueConfig> {
        let connection = if connection.is_empty() {
            self.default_connection()?
        } else {
            connection.to_string()
        };
        let driver = self.driver(&connection)?;
        let queue = self.resolve_queue_name(&connection, queue);

        let concurrency = self.config.get_int(&connection_key(&connection, "concurrency"), 1);
        if concurrency < 1 {
            return Err(TaskqError::configuration(format!(
                "queue.connections.{}.concurrency must be at least 1, got {}",
                connection, concurrency
            )));
        }

        let retry_limit = self.config.get_int(&connection_key(&connection, "retry_limit"), 3);
        let retry_limit = u32::try_from(retry_limit).map_err(|_| {
            TaskqError::configuration(format!(
                "queue.connections.{}.retry_limit must be between 0 and {}, got {}",
                connection,
                u32::MAX,
                retry_limit
            ))
        })?;

        let poll_interval_ms = self.positive_int(&connection, "poll_interval_ms", 1000)?;
        let lease_secs = self.positive_int(&connection, "lease_secs", 300)?;
        let grace_secs = self
            .config
            .get_int(&connection_key(&connection, "shutdown_grace_secs"), 30)
            .max(0) as u64;
        let timeout_secs = self
            .config
            .get_int(&connection_key(&connection, "job_timeout_secs"), 0)
            .max(0) as u64;

        Ok(QueueConfig {
            queue_key: queue_key(&self.app_name(), &queue),
            queue,
            driver,
            concurrency: concurrency as usize,
            retry: RetryPolicy::new(self.backoff(&connection)?, retry_limit),
            poll_interval: Duration::from_millis(poll_interval_ms),
            lease: Duration::from_secs(lease_secs),
            job_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            shutdown_grace: Duration::from_secs(grace_secs),
            connection,
        })
    }

    fn resolve_queue_name(&self, connection: &str, queue: &str) -> String {
        if !queue.is_empty() {
            return queue.to_string();
        }
        let configured = self.config.get_string(&connection_key(connection, "queue"), "");
        if !configured.is_empty() {
            return configured;
        }
        match self.default_connection() {
            Ok(default) => self
                .config
                .get_string(&connection_key(&default, "queue"), "default"),
            Err(_) => "default".to_string(),
        }
    }

    fn positive_int(&self, connection: &str, key: &str, default: i64) -> Result<u64> {
        let value = self.config.get_int(&connection_key(connection, key), default);
        if value <= 0 {
            return Err(TaskqError::configuration(format!(
                "queue.connections.{}.{} must be positive, got {}",
                connection, key, value
            )));
        }
        Ok(value as u64)
    }

    fn backoff(&self, connection: &str) -> Result<RetryStrategy> {
        let key = |name: &str| connection_key(connection, &format!("backoff.{}", name));
        let base = Duration::from_millis(self.config.get_int(&key("base_ms"), 1000).max(0) as u64);
        let max = Duration::from_millis(
            self.config.get_int(&key("max_ms"), 15 * 60 * 1000).max(0) as u64,
        );

        match self
            .config
            .get_string(&key("strategy"), "exponential")
            .to_lowercase()
            .as_str()
        {
            "exponential" => {
                let multiplier = self.config.get_float(&key("multiplier"), 2.0);
                if !(multiplier >= 1.0) {
                    return Err(TaskqError::configuration(format!(
                        "backoff multiplier for {} must be >= 1, got {}",
                        connection, multiplier
                    )));
                }
                Ok(RetryStrategy::ExponentialBackoff {
                    initial_delay: base,
                    multiplier,
                    max_delay: max,
                    jitter: self.config.get_bool(&key("jitter"), false),
                })
            }
            "fixed" => Ok(RetryStrategy::fixed(base)),
            "linear" => {
                let increment = Duration::from_millis(
                    self.config
                        .get_int(&key("increment_ms"), base.as_millis() as i64)
                        .max(0) as u64,
                );
                Ok(RetryStrategy::linear_backoff(base, increment, max))
            }
            "none" | "immediate" => Ok(RetryStrategy::Immediate),
            other => Err(TaskqError::configuration(format!(
                "Unknown backoff strategy {:?} for connection {}",
                other, connection
            ))),
        }
    }
}

fn connection_key(connection: &str, key: &str) -> String {
    format!("queue.connections.{}.{}", connection, key)
}
