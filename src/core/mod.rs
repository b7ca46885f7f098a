//! Core types for taskq.
//!
//! This module contains the data model shared by dispatchers, workers and
//! backends: typed arguments, work items, their lifecycle states and
//! terminal failure records.

pub mod arg;
pub mod failure;
pub mod item_state;
pub mod work_item;

pub use arg::{ARGS_FORMAT_VERSION, Arg, decode_args, encode_args};
pub use failure::{DeadLetter, Failure, FailureKind};
pub use item_state::ItemState;
pub use work_item::{ChainStep, WorkItem};
