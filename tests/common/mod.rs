//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskq::{Arg, Dispatcher, Job, JobContext, JobError, JobEvent, MapConfig};

/// Queue configuration with fast polling and immediate retries.
pub fn fast_queue_config(retry_limit: u32) -> Value {
    json!({
        "default": "memory",
        "connections": {
            "memory": {
                "driver": "memory",
                "poll_interval_ms": 5,
                "retry_limit": retry_limit,
                "shutdown_grace_secs": 5,
                "backoff": {"strategy": "none"}
            },
            "delayed": {
                "driver": "memory",
                "poll_interval_ms": 5,
                "retry_limit": retry_limit,
                "backoff": {"strategy": "fixed", "base_ms": 60000}
            },
            "short_lease": {
                "driver": "memory",
                "poll_interval_ms": 5,
                "retry_limit": retry_limit,
                "lease_secs": 1,
                "shutdown_grace_secs": 5,
                "backoff": {"strategy": "none"}
            },
            "sync": {"driver": "sync"}
        }
    })
}

/// Dispatcher over [`fast_queue_config`] that records every event.
pub fn dispatcher(retry_limit: u32) -> (Dispatcher, EventLog) {
    let mut config = MapConfig::new();
    config.add("app", json!({"name": "it"}));
    config.add("queue", fast_queue_config(retry_limit));

    let log = EventLog::default();
    let dispatcher = Dispatcher::new(Arc::new(config)).with_event_sink(Arc::new(log.clone()));
    (dispatcher, log)
}

/// Collects emitted job events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<JobEvent>>>);

impl taskq::EventSink for EventLog {
    fn emit(&self, event: &JobEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl EventLog {
    pub fn events(&self) -> Vec<JobEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn for_job(&self, job: &str) -> Vec<JobEvent> {
        self.events().into_iter().filter(|e| e.job() == job).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

/// Job that records its executions and fails a configurable number of times.
pub struct ScriptedJob {
    signature: String,
    failures: u32,
    fatal: bool,
    calls: AtomicU32,
    trace: Option<Arc<Mutex<Vec<String>>>>,
    sleep: Duration,
}

impl ScriptedJob {
    pub fn ok(signature: &str) -> Self {
        Self {
            signature: signature.to_string(),
            failures: 0,
            fatal: false,
            calls: AtomicU32::new(0),
            trace: None,
            sleep: Duration::ZERO,
        }
    }

    /// Fails the first `failures` executions, then succeeds.
    pub fn failing(signature: &str, failures: u32) -> Self {
        Self {
            failures,
            ..Self::ok(signature)
        }
    }

    pub fn always_failing(signature: &str) -> Self {
        Self::failing(signature, u32::MAX)
    }

    pub fn fatal(signature: &str) -> Self {
        Self {
            fatal: true,
            ..Self::always_failing(signature)
        }
    }

    pub fn traced(mut self, trace: &Arc<Mutex<Vec<String>>>) -> Self {
        self.trace = Some(Arc::clone(trace));
        self
    }

    pub fn sleeping(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn signature(&self) -> &str {
        &self.signature
    }

    async fn handle(&self, args: &[Arg], _ctx: &JobContext) -> Result<(), JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(trace) = &self.trace {
            let label = match args.first().and_then(Arg::as_str) {
                Some(arg) => format!("{}:{}", self.signature, arg),
                None => self.signature.clone(),
            };
            trace.lock().unwrap().push(label);
        }
        if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }
        if call < self.failures {
            let message = format!("{} failed on call {}", self.signature, call + 1);
            return Err(if self.fatal {
                JobError::fatal(message)
            } else {
                JobError::retryable(message)
            });
        }
        Ok(())
    }
}

/// Polls `condition` every few milliseconds until it holds or five seconds pass.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
