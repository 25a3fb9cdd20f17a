//! Core of the queuectl background job queue.
//!
//! This crate provides:
//! - The job model and its lifecycle states
//! - The [`JobStore`] contract, including the atomic claim
//! - The retry policy (exponential backoff, dead-lettering)
//! - Config-backed defaults for newly enqueued jobs
//! - An in-memory store for tests and embedding

pub mod config;
mod error;
mod memory;
pub mod queue;
pub mod retry;
mod store;
mod types;

pub use config::{ConfigKey, QueueDefaults};
pub use error::QueueError;
pub use memory::MemoryJobStore;
pub use queue::JobRequest;
pub use retry::{Decision, Execution};
pub use store::{JobStore, check_finalize_target};
pub use types::{Job, JobState, MAX_LIST_LIMIT, NewJob, StateCounts};
