//! Dispatching tasks and chains
//!
//! A [`Task`] binds one job to arguments; a [`Chain`] is an ordered list of
//! such bindings that must run strictly one after another. Both resolve
//! their `(connection, queue)` target at dispatch time and either write a
//! [`WorkItem`] to the connection's backend or, on a sync connection, run
//! the job inline.

use chrono::Utc;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::core::WorkItem;
use crate::error::{Result, TaskqError};
use crate::processing::processor::run_handler;
use crate::processing::{Job, JobContext};
use crate::storage::Connections;

pub mod chain;
pub mod task;

pub use chain::{Chain, ChainedJob};
pub use task::Task;

/// Worker id reported to handlers that run at dispatch time
pub(crate) const SYNC_WORKER_ID: &str = "sync";

/// Write `item` to the backend of `config.connection`.
///
/// Backend failures surface as [`TaskqError::EnqueueFailed`]; configuration
/// problems keep their own variant.
pub(crate) async fn enqueue(connections: &Connections, config: &QueueConfig, item: &WorkItem) -> Result<()> {
    let storage = connections
        .storage(&config.connection)
        .await
        .map_err(enqueue_failed)?;

    let written = if item.available_at > item.enqueued_at {
        storage.enqueue_delayed(item).await
    } else {
        storage.enqueue(item).await
    };
    written.map_err(|e| TaskqError::EnqueueFailed {
        message: e.to_string(),
    })?;

    info!(
        item_id = %item.id,
        job = %item.job_signature,
        connection = %config.connection,
        queue = %config.queue_key,
        available_at = %item.available_at,
        "Dispatched job"
    );
    Ok(())
}

fn enqueue_failed(err: TaskqError) -> TaskqError {
    if err.is_configuration_error() {
        err
    } else {
        TaskqError::EnqueueFailed {
            message: err.to_string(),
        }
    }
}

/// Run `item` in the caller's task, waiting for `available_at` first.
pub(crate) async fn run_inline(job: &dyn Job, item: &WorkItem, config: &QueueConfig) -> Result<()> {
    if let Ok(wait) = (item.available_at - Utc::now()).to_std() {
        debug!(item_id = %item.id, wait_ms = wait.as_millis() as u64, "Delaying inline job");
        tokio::time::sleep(wait).await;
    }

    let args = item.decode_args()?;
    let context = JobContext::for_item(item, SYNC_WORKER_ID);
    run_handler(job, &args, &context, config.job_timeout)
        .await
        .map_err(|(_, err)| TaskqError::Handler {
            message: err.message,
        })?;

    debug!(item_id = %item.id, job = %item.job_signature, "Ran job inline");
    Ok(())
}
