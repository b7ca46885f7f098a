//! Named connection registry.
//!
//! Dispatchers and workers look backends up by connection name. The first
//! lookup builds the backend from configuration; later lookups share it, so
//! a task dispatched through `Task` and a worker on the same connection see
//! the same memory queue or reuse the same Redis connection manager.
//!
//! Each connection has its own slot, so opening a slow backend only holds
//! up callers of that connection.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use super::{Storage, StorageConfig, StorageInstance};
use crate::config::{DriverKind, QueueConfigResolver};
use crate::error::{Result, TaskqError};

type Slot = Arc<OnceCell<Arc<dyn Storage>>>;

/// Lazily-built backends keyed by connection name.
pub struct Connections {
    resolver: QueueConfigResolver,
    backends: RwLock<HashMap<String, Slot>>,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections").finish_non_exhaustive()
    }
}

impl Connections {
    pub fn new(resolver: QueueConfigResolver) -> Self {
        Self {
            resolver,
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Serve `connection` from an existing backend instead of building one.
    ///
    /// Useful for sharing a backend across dispatchers or plugging in a
    /// custom [`Storage`] implementation.
    pub async fn insert(&self, connection: impl Into<String>, storage: Arc<dyn Storage>) {
        let connection = connection.into();
        debug!("Registered custom backend for connection {}", connection);
        let slot = Arc::new(OnceCell::new_with(Some(storage)));
        self.backends.write().await.insert(connection, slot);
    }

    async fn slot(&self, connection: &str) -> Slot {
        if let Some(slot) = self.backends.read().await.get(connection) {
            return Arc::clone(slot);
        }
        let mut backends = self.backends.write().await;
        Arc::clone(backends.entry(connection.to_string()).or_default())
    }

    /// Backend of a named connection, building it on first use.
    ///
    /// Fails with a configuration error for unknown or sync connections and
    /// with [`TaskqError::BackendUnavailable`] when the backend cannot be
    /// reached.
    pub async fn storage(&self, connection: &str) -> Result<Arc<dyn Storage>> {
        if let Some(storage) = self
            .backends
            .read()
            .await
            .get(connection)
            .and_then(|slot| slot.get())
        {
            return Ok(Arc::clone(storage));
        }

        let driver = self.resolver.driver(connection)?;
        if driver == DriverKind::Sync {
            return Err(TaskqError::configuration(format!(
                "Connection {} uses the sync driver and has no queue backend",
                connection
            )));
        }

        // Concurrent first lookups of one connection open a single backend
        let slot = self.slot(connection).await;
        let storage = slot
            .get_or_try_init(|| async {
                let config =
                    StorageConfig::from_source(self.resolver.source().as_ref(), connection, driver)?;
                let instance = StorageInstance::from_config(config).await?;
                info!("Opened {} backend for connection {}", driver, connection);
                Ok::<Arc<dyn Storage>, TaskqError>(Arc::new(instance))
            })
            .await?;
        Ok(Arc::clone(storage))
    }
}
