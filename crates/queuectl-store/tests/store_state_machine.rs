//! Stateful property testing for the SQLite job store.
//!
//! Drives enqueue/claim/finalize/DLQ sequences against a real database file
//! and checks every job against a reference model after each step. Time is a
//! logical clock so backoff windows are deterministic.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use proptest::strategy::Union;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use queuectl_core::retry::{backoff_delay, decide};
use queuectl_core::{Execution, JobState, JobStore, NewJob, QueueError};
use queuectl_store::SqliteJobStore;

const EPOCH_MS: i64 = 1_700_000_000_000;

/// Operations that can be performed against the store.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Enqueue a new job, ready after `delay_secs`.
    Enqueue {
        max_retries: u32,
        base: u32,
        delay_secs: i64,
    },
    /// Claim the next ready job.
    Claim,
    /// Record a successful run of a processing job.
    Succeed { id: String },
    /// Record a failed run of a processing job.
    Fail { id: String },
    /// Move a job out of the DLQ (a no-op unless it is dead).
    RetryDlq { id: String },
    /// Advance the logical clock.
    AdvanceClock { secs: i64 },
}

#[derive(Clone, Debug)]
pub struct ModelJob {
    pub id: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub base: u32,
    pub available_at_ms: i64,
}

/// Reference model of the queue.
#[derive(Clone, Debug)]
pub struct QueueModel {
    pub clock_ms: i64,
    /// Jobs in insertion order.
    pub jobs: Vec<ModelJob>,
    pub last_claim: Option<String>,
}

impl QueueModel {
    fn ids_where(&self, pred: impl Fn(&ModelJob) -> bool) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| pred(j))
            .map(|j| j.id.clone())
            .collect()
    }

    fn job_mut(&mut self, id: &str) -> Option<&mut ModelJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn in_state(&self, id: &str, state: JobState) -> bool {
        self.jobs.iter().any(|j| j.id == id && j.state == state)
    }
}

impl ReferenceStateMachine for QueueModel {
    type State = Self;
    type Transition = StoreOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self {
            clock_ms: EPOCH_MS,
            jobs: Vec::new(),
            last_claim: None,
        })
        .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let mut options: Vec<(u32, BoxedStrategy<StoreOperation>)> = vec![
            (
                3,
                (0u32..4, 1u32..4, 0i64..5)
                    .prop_map(|(max_retries, base, delay_secs)| StoreOperation::Enqueue {
                        max_retries,
                        base,
                        delay_secs,
                    })
                    .boxed(),
            ),
            (3, Just(StoreOperation::Claim).boxed()),
            (
                2,
                (1i64..20)
                    .prop_map(|secs| StoreOperation::AdvanceClock { secs })
                    .boxed(),
            ),
        ];

        let processing = state.ids_where(|j| j.state == JobState::Processing);
        if !processing.is_empty() {
            options.push((
                2,
                proptest::sample::select(processing.clone())
                    .prop_map(|id| StoreOperation::Succeed { id })
                    .boxed(),
            ));
            options.push((
                3,
                proptest::sample::select(processing)
                    .prop_map(|id| StoreOperation::Fail { id })
                    .boxed(),
            ));
        }

        let known = state.ids_where(|_| true);
        if !known.is_empty() {
            options.push((
                1,
                proptest::sample::select(known)
                    .prop_map(|id| StoreOperation::RetryDlq { id })
                    .boxed(),
            ));
        }

        Union::new_weighted(options).boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        let now = state.clock_ms;
        match transition {
            StoreOperation::Enqueue {
                max_retries,
                base,
                delay_secs,
            } => {
                let id = format!("job{}", state.jobs.len());
                state.jobs.push(ModelJob {
                    id,
                    state: JobState::Pending,
                    attempts: 0,
                    max_retries: *max_retries,
                    base: *base,
                    available_at_ms: now + delay_secs * 1000,
                });
            }
            StoreOperation::Claim => {
                let next = state
                    .jobs
                    .iter()
                    .enumerate()
                    .filter(|(_, j)| j.state.is_claimable() && j.available_at_ms <= now)
                    .min_by_key(|(idx, j)| (j.available_at_ms, *idx))
                    .map(|(idx, _)| idx);

                state.last_claim = next.map(|idx| {
                    let job = &mut state.jobs[idx];
                    job.state = JobState::Processing;
                    job.attempts += 1;
                    job.id.clone()
                });
            }
            StoreOperation::Succeed { id } => {
                if let Some(job) = state.job_mut(id) {
                    job.state = JobState::Completed;
                }
            }
            StoreOperation::Fail { id } => {
                if let Some(job) = state.job_mut(id) {
                    if job.attempts >= job.max_retries {
                        job.state = JobState::Dead;
                    } else {
                        let delay = backoff_delay(job.base, job.attempts);
                        job.state = JobState::Failed;
                        job.available_at_ms = now + delay.num_milliseconds();
                    }
                }
            }
            StoreOperation::RetryDlq { id } => {
                if let Some(job) = state.job_mut(id) {
                    if job.state == JobState::Dead {
                        job.state = JobState::Pending;
                        job.attempts = 0;
                        job.available_at_ms = now;
                    }
                }
            }
            StoreOperation::AdvanceClock { secs } => {
                state.clock_ms += secs * 1000;
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        // Shrinking can drop the enqueue or claim a later step depends on
        match transition {
            StoreOperation::Succeed { id } | StoreOperation::Fail { id } => {
                state.in_state(id, JobState::Processing)
            }
            StoreOperation::RetryDlq { id } => state.jobs.iter().any(|j| &j.id == id),
            _ => true,
        }
    }
}

/// Test harness holding a store backed by a temp file.
pub struct StoreHarness {
    runtime: Runtime,
    _dir: tempfile::TempDir,
    store: SqliteJobStore,
    clock_ms: i64,
    enqueued: usize,
    last_claim: Option<String>,
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

impl StoreHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = SqliteJobStore::open(dir.path().join("jobs.db")).expect("Failed to open store");

        Self {
            runtime,
            _dir: dir,
            store,
            clock_ms: EPOCH_MS,
            enqueued: 0,
            last_claim: None,
        }
    }

    fn apply_operation(&mut self, op: &StoreOperation) {
        let now = at(self.clock_ms);
        let store = &self.store;

        match op {
            StoreOperation::Enqueue {
                max_retries,
                base,
                delay_secs,
            } => {
                let job = NewJob {
                    id: format!("job{}", self.enqueued),
                    command: "true".to_string(),
                    max_retries: *max_retries,
                    base_backoff_seconds: *base,
                    available_at: at(self.clock_ms + delay_secs * 1000),
                };
                self.enqueued += 1;
                self.runtime.block_on(store.enqueue(job)).unwrap();
            }
            StoreOperation::Claim => {
                let claimed = self
                    .runtime
                    .block_on(store.claim_next(now))
                    .unwrap()
                    .map(|job| job.id);
                self.last_claim = claimed;
            }
            StoreOperation::Succeed { id } | StoreOperation::Fail { id } => {
                self.runtime.block_on(async {
                    let job = store.get(id).await.unwrap().unwrap();
                    let execution = match op {
                        StoreOperation::Succeed { .. } => Execution::Succeeded {
                            output: "done".to_string(),
                            error: String::new(),
                        },
                        _ => Execution::Failed {
                            output: String::new(),
                            error: "boom".to_string(),
                        },
                    };
                    store.finalize(id, &decide(&job, execution, now)).await.unwrap();
                });
            }
            StoreOperation::RetryDlq { id } => {
                if let Err(e) = self.runtime.block_on(store.retry_from_dlq(id, now)) {
                    assert!(matches!(e, QueueError::NotFound(_)), "unexpected error: {e}");
                }
            }
            StoreOperation::AdvanceClock { secs } => {
                self.clock_ms += secs * 1000;
            }
        }
    }
}

impl StateMachineTest for StoreHarness {
    type SystemUnderTest = Self;
    type Reference = QueueModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        // Invariant: the claim picked the same job the model picked
        assert_eq!(state.last_claim, ref_state.last_claim);

        state.runtime.block_on(async {
            // Invariant: every job matches the model
            for expected in &ref_state.jobs {
                let job = state.store.get(&expected.id).await.unwrap().unwrap();
                assert_eq!(job.state, expected.state, "state of {}", expected.id);
                assert_eq!(job.attempts, expected.attempts, "attempts of {}", expected.id);
                assert_eq!(
                    job.available_at.timestamp_millis(),
                    expected.available_at_ms,
                    "available_at of {}",
                    expected.id
                );

                // Invariant: only an exhausted budget is dead
                if job.state == JobState::Dead {
                    assert!(job.attempts >= job.max_retries);
                }
            }

            // Invariant: counts agree with the model and cover every job
            let counts = state.store.counts_by_state().await.unwrap();
            assert_eq!(counts.total(), ref_state.jobs.len() as u64);
            for job_state in JobState::ALL {
                let expected = ref_state.jobs.iter().filter(|j| j.state == job_state).count();
                assert_eq!(counts.get(job_state), expected as u64, "count of {job_state}");
            }
        });
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 2000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn store_state_machine_test(sequential 1..40 => StoreHarness);
}
