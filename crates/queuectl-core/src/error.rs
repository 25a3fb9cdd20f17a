//! Error types for queue operations.

use thiserror::Error;

use crate::JobState;

/// Errors that can occur in queue operations.
///
/// Command failures are not errors here: they are recorded on the job and
/// drive the `failed`/`dead` transitions.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A job with this id already exists.
    #[error("a job with id '{0}' already exists")]
    DuplicateId(String),

    /// The referenced job does not exist or is not in the required state.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The backing store could not be reached or failed mid-operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A state change outside the lifecycle graph was requested.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// The enqueue request is malformed.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    /// Whether this error means the store itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
