//! The backend-agnostic representation of a dispatched task.
//!
//! A [`WorkItem`] is what a [`Task`](crate::dispatch::Task) writes and what a
//! worker fetches. Its serialized form is the persisted/wire shape shared by
//! every backend:
//!
//! ```text
//! {
//!   "id": "...",
//!   "job_signature": "send_email",
//!   "args_version": 1,
//!   "args": [{"type": "string", "value": "a@b.com"}],
//!   "chain_id": "...",          // optional
//!   "chain_position": 0,        // optional
//!   "chain_remaining": [...],   // omitted when empty
//!   "attempt_count": 0,
//!   "enqueued_at": "...",
//!   "available_at": "...",
//!   "queue": "taskq_queues:default",
//!   "state": {"state": "pending"}
//! }
//! ```
//!
//! Chain elements after the current one travel inside the item
//! (`chain_remaining`), so enqueuing the successor needs nothing but the
//! item itself and survives worker restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::arg::{ARGS_FORMAT_VERSION, Arg, decode_args, encode_args};
use super::item_state::ItemState;
use crate::error::{Result, TaskqError};

/// A job signature plus encoded arguments, waiting its turn in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub job_signature: String,
    pub args_version: u32,
    pub args: Value,
}

impl ChainStep {
    pub fn new(job_signature: impl Into<String>, args: &[Arg]) -> Result<Self> {
        Ok(Self {
            job_signature: job_signature.into(),
            args_version: ARGS_FORMAT_VERSION,
            args: encode_args(args)?,
        })
    }
}

/// A dispatched unit of work as stored by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier; deterministic for chain elements
    pub id: String,

    /// Signature of the registered job to run
    pub job_signature: String,

    /// Argument encoding version, see [`ARGS_FORMAT_VERSION`]
    pub args_version: u32,

    /// Encoded argument list
    pub args: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_position: Option<u32>,

    /// Elements still to run after this one, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain_remaining: Vec<ChainStep>,

    /// Retries already scheduled for this item
    pub attempt_count: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Workers must not run the item before this instant
    pub available_at: DateTime<Utc>,

    /// Physical queue key the item lives on
    pub queue: String,

    pub state: ItemState,

    /// Message of the most recent failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WorkItem {
    /// Creates a pending item available immediately.
    pub fn new(job_signature: impl Into<String>, args: &[Arg], queue: impl Into<String>) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            job_signature: job_signature.into(),
            args_version: ARGS_FORMAT_VERSION,
            args: encode_args(args)?,
            chain_id: None,
            chain_position: None,
            chain_remaining: Vec::new(),
            attempt_count: 0,
            enqueued_at: now,
            available_at: now,
            queue: queue.into(),
            state: ItemState::Pending,
            last_error: None,
        })
    }

    /// Creates the item for one chain element.
    ///
    /// The id is derived from the chain id and position so that enqueuing the
    /// same element twice stores it once.
    pub fn for_chain_step(
        chain_id: &str,
        position: u32,
        step: ChainStep,
        remaining: Vec<ChainStep>,
        queue: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::chain_item_id(chain_id, position),
            job_signature: step.job_signature,
            args_version: step.args_version,
            args: step.args,
            chain_id: Some(chain_id.to_string()),
            chain_position: Some(position),
            chain_remaining: remaining,
            attempt_count: 0,
            enqueued_at: now,
            available_at: now,
            queue: queue.into(),
            state: ItemState::Pending,
            last_error: None,
        }
    }

    /// Deterministic id of chain element `position`.
    pub fn chain_item_id(chain_id: &str, position: u32) -> String {
        format!("{}:{}", chain_id, position)
    }

    /// Sets `available_at`.
    pub fn with_available_at(mut self, available_at: DateTime<Utc>) -> Self {
        self.available_at = available_at;
        self
    }

    /// Decodes the argument list.
    pub fn decode_args(&self) -> Result<Vec<Arg>> {
        decode_args(self.args_version, &self.args)
    }

    /// Builds the item for the next chain element, if this one is not the last.
    pub fn next_chain_item(&self) -> Option<WorkItem> {
        let chain_id = self.chain_id.as_deref()?;
        let (next, rest) = self.chain_remaining.split_first()?;
        let position = self.chain_position.unwrap_or(0) + 1;
        Some(Self::for_chain_step(
            chain_id,
            position,
            next.clone(),
            rest.to_vec(),
            self.queue.clone(),
        ))
    }

    /// Number of chain elements that will never run if this item fails.
    pub fn chain_skipped(&self) -> usize {
        self.chain_remaining.len()
    }

    pub fn is_chain_element(&self) -> bool {
        self.chain_id.is_some()
    }

    /// Checks if a worker may fetch this item at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            ItemState::Pending => self.available_at <= now,
            ItemState::Reserved { .. } => self.state.lease_expired(now),
            _ => false,
        }
    }

    /// Updates the state, rejecting invalid transitions.
    pub fn set_state(&mut self, new_state: ItemState) -> Result<()> {
        if !self.state.can_transition_to(&new_state) {
            return Err(TaskqError::InvalidStateTransition {
                from: self.state.name().to_string(),
                to: new_state.name().to_string(),
            });
        }
        self.state = new_state;
        Ok(())
    }

    /// Serializes the item to JSON.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes an item from JSON.
    pub fn deserialize(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
