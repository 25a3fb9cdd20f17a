//! The persistence contract the job engine runs against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Decision, Job, JobState, NewJob, QueueError, StateCounts};

/// Storage for jobs and configuration entries.
///
/// Implementations must make [`JobStore::claim_next`] a single atomic
/// operation: under any number of concurrent callers, each eligible job is
/// returned to at most one of them.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job. Fails with `DuplicateId` without touching
    /// the existing record.
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError>;

    /// Claim the oldest ready job: state `pending`/`failed`, `available_at <= now`,
    /// ordered by `available_at` then `created_at`. The claimed job moves to
    /// `processing` with `attempts + 1` and the updated record is returned.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;

    /// Record the outcome of an attempt on a job currently in `processing`.
    async fn finalize(&self, id: &str, decision: &Decision) -> Result<(), QueueError>;

    /// Move a `dead` job back to `pending` with `attempts = 0` and a cleared error.
    async fn retry_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<Job, QueueError>;

    /// Fetch a single job.
    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;

    async fn counts_by_state(&self) -> Result<StateCounts, QueueError>;

    /// Jobs in `state`, newest first, at most `min(limit, MAX_LIST_LIMIT)`.
    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError>;

    async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Insert or overwrite a configuration entry.
    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError>;
}

/// Validate that `decision` is a legal way out of `processing`.
pub fn check_finalize_target(decision: &Decision) -> Result<(), QueueError> {
    if JobState::Processing.can_transition_to(decision.state) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            from: JobState::Processing,
            to: decision.state,
        })
    }
}
