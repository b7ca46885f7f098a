//! Work item state management.
//!
//! Backends persist one of these states next to every stored
//! [`WorkItem`](super::WorkItem). The worker's per-item state machine
//! (fetched, running, succeeded, retrying, dead-lettered) maps onto them as:
//!
//! ```text
//! Pending ──fetch──→ Reserved ──ack──→ Succeeded
//!    ↑                  │
//!    └──retry/lease─────┤
//!                       └──dead_letter──→ DeadLettered ──requeue──→ Pending
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting for `available_at` and a free worker
    Pending,

    /// Held by one worker until the lease expires
    Reserved {
        /// ID of the worker holding the lease
        worker_id: String,
        /// Token identifying this particular reservation
        lease_id: String,
        /// When the item was fetched
        reserved_at: DateTime<Utc>,
        /// After this instant another worker may fetch the item again
        lease_expires_at: DateTime<Utc>,
    },

    /// Acknowledged by a worker; retained so a replayed enqueue of the
    /// same id stays a no-op
    Succeeded {
        /// When the item was acknowledged
        completed_at: DateTime<Utc>,
    },

    /// Terminal failure recorded in the dead-letter sink
    DeadLettered {
        /// When the item was dead-lettered
        failed_at: DateTime<Utc>,
    },
}

impl ItemState {
    /// Returns the name of the current state as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Reserved { .. } => "reserved",
            ItemState::Succeeded { .. } => "succeeded",
            ItemState::DeadLettered { .. } => "dead_lettered",
        }
    }

    /// Checks if no worker will pick the item up again on its own.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded { .. } | ItemState::DeadLettered { .. }
        )
    }

    /// Checks if this state can transition to the given target state.
    pub fn can_transition_to(&self, target: &ItemState) -> bool {
        use ItemState::*;

        match (self, target) {
            (Pending, Reserved { .. }) => true,
            // Inline run on the sync driver
            (Pending, Succeeded { .. }) => true,

            (Reserved { .. }, Succeeded { .. }) => true,
            (Reserved { .. }, Pending) => true,
            (Reserved { .. }, DeadLettered { .. }) => true,
            // Re-fetch after the previous lease expired
            (Reserved { .. }, Reserved { .. }) => true,

            // Operator requeue
            (DeadLettered { .. }, Pending) => true,

            _ => false,
        }
    }

    /// Creates a new Reserved state with a lease of `lease` from now.
    pub fn reserved(worker_id: impl Into<String>, lease: chrono::Duration) -> Self {
        let now = Utc::now();
        ItemState::Reserved {
            worker_id: worker_id.into(),
            lease_id: uuid::Uuid::new_v4().to_string(),
            reserved_at: now,
            lease_expires_at: now + lease,
        }
    }

    /// Creates a new Succeeded state.
    pub fn succeeded() -> Self {
        ItemState::Succeeded {
            completed_at: Utc::now(),
        }
    }

    /// Creates a new DeadLettered state.
    pub fn dead_lettered() -> Self {
        ItemState::DeadLettered {
            failed_at: Utc::now(),
        }
    }

    /// The worker holding the lease, if any.
    pub fn holder(&self) -> Option<&str> {
        match self {
            ItemState::Reserved { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }

    /// Token of the current reservation, if any.
    pub fn lease_id(&self) -> Option<&str> {
        match self {
            ItemState::Reserved { lease_id, .. } => Some(lease_id),
            _ => None,
        }
    }

    /// Moves the lease deadline to `lease` from now. Other states are left alone.
    pub fn renew(&mut self, lease: chrono::Duration) {
        if let ItemState::Reserved {
            lease_expires_at, ..
        } = self
        {
            *lease_expires_at = Utc::now() + lease;
        }
    }

    /// Checks if a reservation has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self, ItemState::Reserved { lease_expires_at, .. } if *lease_expires_at <= now)
    }
}
