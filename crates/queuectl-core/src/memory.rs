//! In-memory job store.
//!
//! Same semantics as the persistent store, held behind a single mutex. Used in
//! tests and anywhere a throwaway queue is enough. Availability can be
//! switched off to simulate an unreachable store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::check_finalize_target;
use crate::{Decision, Job, JobState, JobStore, MAX_LIST_LIMIT, NewJob, QueueError, StateCounts};

#[derive(Default)]
struct Inner {
    /// Jobs in insertion order.
    jobs: Vec<Job>,
    config: HashMap<String, String>,
}

/// A [`JobStore`] backed by process memory.
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    config_available: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            config_available: AtomicBool::new(true),
        }
    }

    /// Make every operation fail with `StoreUnavailable` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make only configuration reads fail while `false`.
    pub fn set_config_available(&self, available: bool) {
        self.config_available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.inner
            .lock()
            .map_err(|_| QueueError::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let mut inner = self.lock()?;
        if inner.jobs.iter().any(|j| j.id == job.id) {
            return Err(QueueError::DuplicateId(job.id));
        }

        let job = job.into_job(Utc::now());
        inner.jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut inner = self.lock()?;

        // min_by_key keeps the first of equal keys, so insertion order breaks ties
        let Some(job) = inner
            .jobs
            .iter_mut()
            .filter(|j| j.is_claimable_at(now))
            .min_by_key(|j| (j.available_at, j.created_at))
        else {
            return Ok(None);
        };

        job.state = JobState::Processing;
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn finalize(&self, id: &str, decision: &Decision) -> Result<(), QueueError> {
        check_finalize_target(decision)?;

        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.state == JobState::Processing)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        job.state = decision.state;
        job.output = decision.output.clone();
        job.error = decision.error.clone();
        if let Some(at) = decision.retry_at {
            job.available_at = at;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.state == JobState::Dead)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        job.state = JobState::Pending;
        job.attempts = 0;
        job.error.clear();
        job.available_at = now;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.lock()?.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn counts_by_state(&self) -> Result<StateCounts, QueueError> {
        let inner = self.lock()?;
        let mut counts = StateCounts::default();
        for job in &inner.jobs {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let inner = self.lock()?;
        let mut matching: Vec<(usize, &Job)> = inner
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.state == state)
            .collect();

        // Newest first; later insertions win ties
        matching.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));

        Ok(matching
            .into_iter()
            .take(limit.min(MAX_LIST_LIMIT))
            .map(|(_, j)| j.clone())
            .collect())
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        if !self.config_available.load(Ordering::SeqCst) {
            return Err(QueueError::StoreUnavailable(
                "config collection unavailable".to_string(),
            ));
        }
        Ok(self.lock()?.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.lock()?
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
