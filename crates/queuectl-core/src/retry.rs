//! Retry policy: maps an execution result on a claimed job to its next state.

use chrono::{DateTime, Duration, Utc};

use crate::{Job, JobState};

/// Result of running a job's command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Exit status 0.
    Succeeded { output: String, error: String },
    /// Non-zero exit, signal, or launch failure.
    Failed { output: String, error: String },
}

impl Execution {
    pub fn is_success(&self) -> bool {
        matches!(self, Execution::Succeeded { .. })
    }
}

/// What the store should record for a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// One of `completed`, `failed` or `dead`.
    pub state: JobState,
    pub output: String,
    pub error: String,
    /// New `available_at`, only set when the job is scheduled for retry.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Delay before the next attempt: `base ^ attempts` seconds.
///
/// `attempts` is the post-claim count, so the first retry uses exponent 1.
/// Saturates rather than overflowing.
pub fn backoff_delay(base_backoff_seconds: u32, attempts: u32) -> Duration {
    let secs = u64::from(base_backoff_seconds).saturating_pow(attempts);
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Decide the next state of a claimed job.
///
/// `job` must be the record returned by the claim, i.e. in `processing` with
/// `attempts` already incremented.
pub fn decide(job: &Job, execution: Execution, now: DateTime<Utc>) -> Decision {
    debug_assert_eq!(job.state, JobState::Processing);

    match execution {
        Execution::Succeeded { output, error } => Decision {
            state: JobState::Completed,
            output: output.trim().to_string(),
            error: error.trim().to_string(),
            retry_at: None,
        },
        Execution::Failed { output, error } if job.attempts >= job.max_retries => Decision {
            state: JobState::Dead,
            output: output.trim().to_string(),
            error: error.trim().to_string(),
            retry_at: None,
        },
        Execution::Failed { output, error } => {
            let delay = backoff_delay(job.base_backoff_seconds, job.attempts);
            Decision {
                state: JobState::Failed,
                output: output.trim().to_string(),
                error: error.trim().to_string(),
                retry_at: Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)),
            }
        }
    }
}
