//! Incremental, lease-guarded mirror of chat workspace history.
//!
//! A [`coordinator::SyncCoordinator`] fans a tenant-level run out into one
//! task per channel, executes the tasks on a bounded worker pool and records
//! per-channel checkpoints so that interrupted runs resume where they left
//! off.

pub mod adapter;
pub mod classify;
pub mod cmd;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod progress;
pub mod queue;
pub mod store;
pub mod types;
pub mod util;

pub use error::{Error, Result};
