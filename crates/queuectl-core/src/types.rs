//! Job types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Upper bound on the number of jobs returned by a listing.
pub const MAX_LIST_LIMIT: usize = 20;

/// A queued job as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id, assigned at enqueue time.
    pub id: String,
    /// Shell command to execute.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of times this job has been claimed.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_retries: u32,
    /// Base of the exponential retry delay, in seconds.
    pub base_backoff_seconds: u32,
    /// Earliest time the job may be claimed.
    pub available_at: DateTime<Utc>,
    /// Captured stdout of the last attempt.
    pub output: String,
    /// Captured stderr (or synthesized failure message) of the last attempt.
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Command exited with status 0.
    Completed,
    /// Last attempt failed; claimable again once `available_at` passes.
    Failed,
    /// Retries exhausted. Only an explicit DLQ retry moves it on.
    Dead,
}

impl JobState {
    /// Every state, in display order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// States a worker may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending | Failed, Processing)
                | (Processing, Completed | Failed | Dead)
                | (Dead, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::InvalidJob(format!("unknown job state '{s}'")))
    }
}

/// A fully resolved job ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    pub max_retries: u32,
    pub base_backoff_seconds: u32,
    pub available_at: DateTime<Utc>,
}

impl NewJob {
    /// Build the initial `pending` record for this job.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries,
            base_backoff_seconds: self.base_backoff_seconds,
            available_at: self.available_at,
            output: String::new(),
            error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Job {
    /// Check if this job can be claimed at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.available_at <= now
    }
}

/// Number of jobs in each state. Every state is present, zero-filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateCounts(BTreeMap<JobState, u64>);

impl StateCounts {
    pub fn get(&self, state: JobState) -> u64 {
        self.0.get(&state).copied().unwrap_or(0)
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        *self.0.entry(state).or_insert(0) += count;
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, u64)> + '_ {
        self.0.iter().map(|(state, count)| (*state, *count))
    }
}

impl Default for StateCounts {
    fn default() -> Self {
        Self(JobState::ALL.into_iter().map(|state| (state, 0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use test_case::test_case;

    fn pending_job() -> Job {
        NewJob {
            id: "job1".to_string(),
            command: "echo hi".to_string(),
            max_retries: 3,
            base_backoff_seconds: 2,
            available_at: Utc::now() - Duration::seconds(1),
        }
        .into_job(Utc::now())
    }

    #[test_case("pending", JobState::Pending)]
    #[test_case("processing", JobState::Processing)]
    #[test_case("completed", JobState::Completed)]
    #[test_case("failed", JobState::Failed)]
    #[test_case("dead", JobState::Dead)]
    fn test_state_parses(input: &str, expected: JobState) {
        assert_eq!(input.parse::<JobState>().unwrap(), expected);
        assert_eq!(expected.to_string(), input);
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!(matches!(
            "running".parse::<JobState>(),
            Err(QueueError::InvalidJob(_))
        ));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_new_job_starts_pending() {
        let job = pending_job();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.output.is_empty());
        assert!(job.error.is_empty());
    }

    #[test]
    fn test_claimable_only_when_ready() {
        let mut job = pending_job();
        assert!(job.is_claimable_at(Utc::now()));

        // Not ready yet
        job.available_at = Utc::now() + Duration::hours(1);
        assert!(!job.is_claimable_at(Utc::now()));

        job.available_at = Utc::now() - Duration::seconds(1);
        job.state = JobState::Failed;
        assert!(job.is_claimable_at(Utc::now()));

        for state in [JobState::Processing, JobState::Completed, JobState::Dead] {
            job.state = state;
            assert!(!job.is_claimable_at(Utc::now()), "{state} should not be claimable");
        }
    }

    #[test]
    fn test_transition_graph() {
        use JobState::*;
        let allowed = [
            (Pending, Processing),
            (Failed, Processing),
            (Processing, Completed),
            (Processing, Failed),
            (Processing, Dead),
            (Dead, Pending),
        ];

        for from in JobState::ALL {
            for to in JobState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_counts_zero_filled() {
        let mut counts = StateCounts::default();
        assert_eq!(counts.iter().count(), 5);
        assert_eq!(counts.total(), 0);

        counts.add(JobState::Dead, 2);
        counts.add(JobState::Pending, 1);
        assert_eq!(counts.get(JobState::Dead), 2);
        assert_eq!(counts.get(JobState::Completed), 0);
        assert_eq!(counts.total(), 3);
    }
}
