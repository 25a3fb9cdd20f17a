//! Front-end operations that combine the store with config resolution.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::config::resolve_defaults;
use crate::{Job, JobStore, NewJob, QueueError};

/// An enqueue request as submitted by a user.
///
/// Omitted retry fields are filled from stored config, then hardcoded defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_backoff_seconds: Option<u32>,
    /// Earliest time the job may run. Defaults to now.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobRequest {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Parse a request from its JSON form.
    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        serde_json::from_str(raw).map_err(|e| QueueError::InvalidJob(e.to_string()))
    }
}

/// Enqueue a job, resolving omitted fields from configuration.
#[tracing::instrument(skip(store, request), fields(job_id = %request.id))]
pub async fn enqueue(store: &dyn JobStore, request: JobRequest) -> Result<Job, QueueError> {
    if request.id.trim().is_empty() || request.command.trim().is_empty() {
        return Err(QueueError::InvalidJob(
            "'id' and 'command' are required".to_string(),
        ));
    }
    if request.base_backoff_seconds == Some(0) {
        return Err(QueueError::InvalidJob(
            "base_backoff_seconds must be positive".to_string(),
        ));
    }

    let defaults = resolve_defaults(store).await;
    let job = NewJob {
        id: request.id,
        command: request.command,
        max_retries: request.max_retries.unwrap_or(defaults.max_retries),
        base_backoff_seconds: request
            .base_backoff_seconds
            .unwrap_or(defaults.base_backoff_seconds),
        available_at: request.run_at.unwrap_or_else(Utc::now),
    };

    let job = store.enqueue(job).await?;
    info!(
        max_retries = job.max_retries,
        base_backoff_seconds = job.base_backoff_seconds,
        "job enqueued"
    );
    Ok(job)
}

/// Requeue a dead-lettered job.
#[tracing::instrument(skip(store))]
pub async fn retry_dead(store: &dyn JobStore, id: &str) -> Result<Job, QueueError> {
    let job = store.retry_from_dlq(id, Utc::now()).await?;
    info!("job requeued from DLQ");
    Ok(job)
}
