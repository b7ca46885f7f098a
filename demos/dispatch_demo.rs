//! Dispatching single jobs and chains to an in-memory queue.
//!
//! This example shows how to:
//! - Register job definitions with a dispatcher
//! - Dispatch a job immediately and after a delay
//! - Dispatch a chain where a failing element stops the rest
//! - Run a worker and shut it down gracefully
//!
//! Run this example with:
//! ```
//! RUST_LOG=info cargo run --example dispatch_demo
//! ```

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use taskq::{
    Arg, ChainedJob, Dispatcher, Job, JobContext, JobError, JobEvent, MapConfig, Storage,
    WorkerArgs,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct SendEmail;

#[async_trait]
impl Job for SendEmail {
    fn signature(&self) -> &str {
        "send_email"
    }

    async fn handle(&self, args: &[Arg], ctx: &JobContext) -> Result<(), JobError> {
        let to = args
            .first()
            .and_then(Arg::as_str)
            .ok_or_else(|| JobError::fatal("send_email expects a recipient"))?;
        info!(item_id = %ctx.item_id, attempt = ctx.attempt, "📧 Sending email to {}", to);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

/// Declines the first card it sees, then accepts.
struct Charge {
    declines: AtomicU32,
}

#[async_trait]
impl Job for Charge {
    fn signature(&self) -> &str {
        "charge"
    }

    async fn handle(&self, args: &[Arg], ctx: &JobContext) -> Result<(), JobError> {
        let order = args.first().and_then(Arg::as_i64).unwrap_or_default();
        if self.declines.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(format!("card declined for order {}", order).into());
        }
        info!(order, attempt = ctx.attempt, "💳 Charged order");
        Ok(())
    }
}

struct Ship;

#[async_trait]
impl Job for Ship {
    fn signature(&self) -> &str {
        "ship"
    }

    async fn handle(&self, args: &[Arg], _ctx: &JobContext) -> Result<(), JobError> {
        let order = args.first().and_then(Arg::as_i64).unwrap_or_default();
        info!(order, "📦 Shipped order");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    println!("🚀 taskq - Dispatch Demo");
    println!("========================\n");

    MapConfig::load_dotenv()?;
    let mut config = MapConfig::new().with_env_prefix("TASKQ");
    config.add("app.name", json!("demo"));
    config.add(
        "queue",
        json!({
            "default": "memory",
            "connections": {
                "memory": {
                    "driver": "memory",
                    "concurrency": 4,
                    "retry_limit": 3,
                    "poll_interval_ms": 50,
                    "backoff": {"strategy": "exponential", "base_ms": 100, "max_ms": 1000}
                },
                "sync": {"driver": "sync"}
            }
        }),
    );

    let mut dispatcher = Dispatcher::new(Arc::new(config)).with_event_sink(Arc::new(|event: &JobEvent| {
        if let JobEvent::Retrying { job, attempt, .. } = event {
            println!("   🔁 {} scheduled for retry #{}", job, attempt);
        }
    }));

    let send_email: Arc<dyn Job> = Arc::new(SendEmail);
    let charge: Arc<dyn Job> = Arc::new(Charge {
        declines: AtomicU32::new(0),
    });
    let ship: Arc<dyn Job> = Arc::new(Ship);
    dispatcher.register(vec![
        Arc::clone(&send_email),
        Arc::clone(&charge),
        Arc::clone(&ship),
    ])?;
    println!("1. Registered jobs: {:?}\n", dispatcher.registry().signatures());

    println!("2. Dispatching jobs...");
    let welcome = dispatcher
        .job(Arc::clone(&send_email), vec![Arg::from("new-user@example.com")])
        .dispatch()
        .await?;
    println!("   Queued {} on {}", welcome.id, welcome.queue);

    let reminder = dispatcher
        .job(Arc::clone(&send_email), vec![Arg::from("late-user@example.com")])
        .dispatch_after(Duration::from_millis(300))
        .await?;
    println!("   Queued {} available at {}", reminder.id, reminder.available_at);

    dispatcher
        .job(Arc::clone(&send_email), vec![Arg::from("audit@example.com")])
        .on_connection("sync")
        .dispatch()
        .await?;
    println!("   Ran audit email inline on the sync connection\n");

    println!("3. Dispatching an order chain...");
    let head = dispatcher
        .chain(vec![
            ChainedJob::new(Arc::clone(&charge), vec![Arg::from(1001_i64)]),
            ChainedJob::new(Arc::clone(&ship), vec![Arg::from(1001_i64)]),
        ])
        .dispatch()
        .await?;
    println!("   Chain {:?} head {}\n", head.chain_id, head.id);

    println!("4. Running a worker...");
    let handle = dispatcher
        .worker(Some(WorkerArgs::new().concurrent(2)))?
        .start()
        .await?;

    let storage = dispatcher.connections().storage("memory").await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while storage.pending_count(&head.queue).await? > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // Let the last fetched item finish
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = handle.shutdown().await?;
    println!("\n5. Worker report");
    println!("   Processed:     {}", report.processed);
    println!("   Succeeded:     {}", report.succeeded);
    println!("   Retried:       {}", report.retried);
    println!("   Dead-lettered: {}", report.dead_lettered);
    println!("   Abandoned:     {}", report.abandoned);

    let dead = storage.dead_letters(&head.queue).await?;
    println!("   Dead letters:  {}", dead.len());
    println!("\n✅ Demo complete");
    Ok(())
}
