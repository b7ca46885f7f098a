//! Read-only configuration lookup.
//!
//! The dispatcher never owns configuration; it reads dotted paths such as
//! `queue.connections.redis.driver` through a [`ConfigSource`]. [`MapConfig`]
//! is the bundled implementation: a JSON tree filled by the application at
//! startup, optionally overlaid by prefixed environment variables.
//!
//! ```rust
//! use serde_json::json;
//! use taskq::config::{ConfigSource, MapConfig};
//!
//! let mut config = MapConfig::new();
//! config.add("queue", json!({
//!     "default": "memory",
//!     "connections": { "memory": { "driver": "memory", "concurrency": "4" } }
//! }));
//!
//! assert_eq!(config.get_string("queue.default", "sync"), "memory");
//! assert_eq!(config.get_int("queue.connections.memory.concurrency", 1), 4);
//! assert_eq!(config.get_int("queue.connections.memory.retry_limit", 3), 3);
//! ```

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Result, TaskqError};

pub mod queue;

pub use queue::{DriverKind, QueueConfig, QueueConfigResolver};

/// Key/value configuration lookup with default fallback.
///
/// Only [`get`](ConfigSource::get) is required. The typed getters treat a
/// missing value and an empty string alike and fall back to `default`;
/// strings are coerced to numbers and booleans where they parse.
pub trait ConfigSource: Send + Sync {
    /// Raw value at a dotted path.
    fn get(&self, path: &str) -> Option<Value>;

    fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Raw value, or `default` when unset or empty.
    fn get_or(&self, path: &str, default: Value) -> Value {
        match self.get(path) {
            None | Some(Value::Null) => default,
            Some(Value::String(s)) if s.is_empty() => default,
            Some(value) => value,
        }
    }

    /// Process environment variable `name`, or `default` when unset or empty.
    fn env(&self, name: &str, default: &str) -> String {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => default.to_string(),
        }
    }

    fn get_string(&self, path: &str, default: &str) -> String {
        match self.get(path) {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    fn get_int(&self, path: &str, default: i64) -> i64 {
        match self.get(path) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) if !s.trim().is_empty() => match s.trim().parse::<i64>() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Config value at {} is not an integer: {:?}", path, s);
                    default
                }
            },
            Some(Value::Bool(b)) => i64::from(b),
            _ => default,
        }
    }

    fn get_float(&self, path: &str, default: f64) -> f64 {
        match self.get(path) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) if !s.trim().is_empty() => match s.trim().parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Config value at {} is not a number: {:?}", path, s);
                    default
                }
            },
            _ => default,
        }
    }

    fn get_bool(&self, path: &str, default: bool) -> bool {
        match self.get(path) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "" => default,
                "true" | "yes" | "1" | "on" => true,
                "false" | "no" | "0" | "off" => false,
                other => {
                    warn!("Config value at {} is not a boolean: {:?}", path, other);
                    default
                }
            },
            _ => default,
        }
    }
}

/// In-memory configuration tree with an optional environment overlay.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    root: Map<String, Value>,
    env_prefix: Option<String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `{PREFIX}_{PATH}` environment variables override tree values.
    ///
    /// The variable name is the dotted path upper-cased with dots replaced
    /// by underscores, e.g. `TASKQ_QUEUE_DEFAULT` for `queue.default`.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Set the value at a dotted path, creating intermediate objects.
    ///
    /// Adding an object under an existing object merges the two, so sections
    /// can be contributed piecemeal.
    pub fn add(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.').peekable();
        let mut node = &mut self.root;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                let replacement = match (node.get_mut(segment), value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        merge(existing, incoming);
                        None
                    }
                    (_, value) => Some(value),
                };
                if let Some(value) = replacement {
                    node.insert(segment.to_string(), value);
                }
                return;
            }
            let entry = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    /// Load a `.env` file from the working directory or its parents.
    ///
    /// Returns `Ok(false)` when there is no such file; variables already set
    /// in the process environment are left untouched.
    pub fn load_dotenv() -> Result<bool> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(true),
            Err(e) if e.not_found() => Ok(false),
            Err(e) => Err(TaskqError::configuration(format!(
                "Failed to load .env file: {}",
                e
            ))),
        }
    }

    fn env_key(prefix: &str, path: &str) -> String {
        format!("{}_{}", prefix, path.replace('.', "_")).to_uppercase()
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut value = self.root.get(first)?;
        for segment in segments {
            value = value.as_object()?.get(segment)?;
        }
        Some(value)
    }
}

fn merge(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        let replacement = match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge(existing, nested);
                None
            }
            (_, value) => Some(value),
        };
        if let Some(value) = replacement {
            target.insert(key, value);
        }
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, path: &str) -> Option<Value> {
        if let Some(prefix) = &self.env_prefix {
            if let Ok(value) = std::env::var(Self::env_key(prefix, path)) {
                return Some(Value::String(value));
            }
        }
        self.lookup(path).cloned()
    }
}
