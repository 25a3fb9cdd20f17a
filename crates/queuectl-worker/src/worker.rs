//! Worker poll loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use queuectl_core::retry::decide;
use queuectl_core::{Decision, Job, JobState, JobStore, QueueError};

use crate::{Executor, ShellExecutor};

/// Sleep between polls when no job is ready.
const IDLE_INTERVAL: Duration = Duration::from_secs(2);

/// Sleep after a store error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Pause between observing shutdown and releasing the store.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Poll loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub idle_interval: Duration,
    pub error_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: IDLE_INTERVAL,
            error_backoff: ERROR_BACKOFF,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Outcome of a single poll.
#[derive(Debug)]
pub enum Tick {
    /// No job was ready.
    Idle,
    /// A job was claimed, run and its outcome recorded; carries the job as finalized.
    Processed(Job),
    /// The claim failed, or the outcome could not be recorded.
    StoreError(QueueError),
}

/// A single-threaded worker: one job in flight at a time.
pub struct Worker<S: ?Sized, E = ShellExecutor> {
    store: Arc<S>,
    executor: E,
    config: WorkerConfig,
}

impl<S> Worker<S, ShellExecutor>
where
    S: JobStore + ?Sized,
{
    /// Create a worker that runs commands through the system shell.
    pub fn new(store: Arc<S>, config: WorkerConfig) -> Self {
        Self::with_executor(store, ShellExecutor::new(), config)
    }
}

impl<S, E> Worker<S, E>
where
    S: JobStore + ?Sized,
    E: Executor,
{
    pub fn with_executor(store: Arc<S>, executor: E, config: WorkerConfig) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Claim and run at most one job.
    pub async fn tick(&self) -> Tick {
        match self.store.claim_next(Utc::now()).await {
            Ok(Some(job)) => match self.process(job).await {
                Ok(job) => Tick::Processed(job),
                Err(e) => Tick::StoreError(e),
            },
            Ok(None) => Tick::Idle,
            Err(e) => Tick::StoreError(e),
        }
    }

    /// Execute a claimed job and record the outcome.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, attempts = job.attempts))]
    async fn process(&self, job: Job) -> Result<Job, QueueError> {
        info!(command = %job.command, "executing job");

        let execution = self.executor.execute(&job.command).await;
        let decision = decide(&job, execution, Utc::now());

        match decision.state {
            JobState::Completed => info!("job completed"),
            JobState::Failed => warn!(
                retry_at = ?decision.retry_at,
                error = %decision.error,
                "job failed, scheduled retry"
            ),
            JobState::Dead => error!(
                max_retries = job.max_retries,
                error = %decision.error,
                "job exhausted retries, moved to dead-letter queue"
            ),
            _ => {}
        }

        self.record(&job.id, &decision).await?;

        Ok(Job {
            state: decision.state,
            available_at: decision.retry_at.unwrap_or(job.available_at),
            output: decision.output,
            error: decision.error,
            ..job
        })
    }

    /// Finalize a job, retrying until the store is reachable again.
    ///
    /// Only an unavailable store is retried; the job would otherwise be left
    /// in `processing` with nothing to move it out.
    async fn record(&self, id: &str, decision: &Decision) -> Result<(), QueueError> {
        loop {
            match self.store.finalize(id, decision).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unavailable() => {
                    error!(error = %e, "failed to record job result, retrying");
                    sleep(self.config.error_backoff).await;
                }
                Err(e) => {
                    error!(error = %e, "job result rejected by store");
                    return Err(e);
                }
            }
        }
    }

    /// Run the poll loop until `shutdown_rx` turns true.
    ///
    /// Shutdown is checked between jobs only; a running command is never
    /// interrupted. Sleeps between polls wake early on shutdown.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("worker starting");

        loop {
            if *shutdown_rx.borrow() {
                info!("shutdown requested, not claiming new jobs");
                break;
            }

            let pause = match self.tick().await {
                Tick::Processed(_) => continue,
                Tick::Idle => self.config.idle_interval,
                Tick::StoreError(e) => {
                    error!(error = %e, "store error");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel closed");
                        break;
                    }
                }
                _ = sleep(pause) => {}
            }
        }

        sleep(self.config.shutdown_grace).await;
        drop(self.store);
        info!("worker shut down gracefully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use queuectl_core::{Execution, MemoryJobStore, NewJob};

    struct Scripted {
        succeed: bool,
    }

    #[async_trait]
    impl Executor for Scripted {
        async fn execute(&self, command: &str) -> Execution {
            if self.succeed {
                Execution::Succeeded {
                    output: format!("ran {command}\n"),
                    error: String::new(),
                }
            } else {
                Execution::Failed {
                    output: String::new(),
                    error: "process exited with code 1".to_string(),
                }
            }
        }
    }

    fn job(id: &str, max_retries: u32) -> NewJob {
        NewJob {
            id: id.to_string(),
            command: "work".to_string(),
            max_retries,
            base_backoff_seconds: 2,
            available_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_tick_idle_on_empty_store() {
        let worker = Worker::with_executor(
            Arc::new(MemoryJobStore::new()),
            Scripted { succeed: true },
            WorkerConfig::default(),
        );
        assert!(matches!(worker.tick().await, Tick::Idle));
    }

    #[tokio::test]
    async fn test_tick_completes_job() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(job("a", 3)).await.unwrap();
        let worker = Worker::with_executor(
            Arc::clone(&store),
            Scripted { succeed: true },
            WorkerConfig::default(),
        );

        let Tick::Processed(done) = worker.tick().await else {
            panic!("expected a processed job");
        };
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.output, "ran work");

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored, Job { updated_at: stored.updated_at, ..done });
    }

    #[tokio::test]
    async fn test_tick_failure_schedules_retry() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(job("a", 3)).await.unwrap();
        let worker = Worker::with_executor(
            Arc::clone(&store),
            Scripted { succeed: false },
            WorkerConfig::default(),
        );

        let Tick::Processed(failed) = worker.tick().await else {
            panic!("expected a processed job");
        };
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.available_at > Utc::now());

        // Backing off, so nothing is ready
        assert!(matches!(worker.tick().await, Tick::Idle));
    }

    #[tokio::test]
    async fn test_tick_reports_store_error() {
        let store = Arc::new(MemoryJobStore::new());
        store.set_available(false);
        let worker = Worker::with_executor(store, Scripted { succeed: true }, WorkerConfig::default());

        match worker.tick().await {
            Tick::StoreError(e) => assert!(e.is_unavailable()),
            other => panic!("expected store error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_returns_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(job("untouched", 3)).await.unwrap();

        let config = WorkerConfig {
            shutdown_grace: Duration::ZERO,
            ..WorkerConfig::default()
        };
        Worker::with_executor(Arc::clone(&store), Scripted { succeed: true }, config)
            .run(rx)
            .await;

        let job = store.get("untouched").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
    }
}
