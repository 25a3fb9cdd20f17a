//! Worker side of queuectl.
//!
//! This crate provides:
//! - A shell executor that runs a job's command and captures its streams
//! - The poll loop: claim, execute, decide, finalize, repeat until shut down

mod executor;
mod worker;

pub use executor::{Executor, ShellExecutor};
pub use worker::{Tick, Worker, WorkerConfig};
