//! Queue commands that only need the job store.

use queuectl_core::config::{resolve_defaults, set_config};
use queuectl_core::queue::{enqueue, retry_dead};
use queuectl_core::{JobRequest, JobState, JobStore, MAX_LIST_LIMIT, QueueError};

use crate::format::{render_defaults, render_jobs};

/// `queuectl enqueue '<json>'`
pub async fn enqueue_json(store: &dyn JobStore, raw: &str) -> Result<String, QueueError> {
    let request = JobRequest::from_json(raw)?;
    let job = enqueue(store, request).await?;
    Ok(format!("Job enqueued: {}", job.id))
}

/// `queuectl list --state <state>`; `dlq list` is the `dead` listing.
pub async fn list(store: &dyn JobStore, state: JobState) -> Result<String, QueueError> {
    let jobs = store.list_by_state(state, MAX_LIST_LIMIT).await?;
    Ok(render_jobs(state, &jobs))
}

/// `queuectl dlq retry <id>`
pub async fn retry_from_dlq(store: &dyn JobStore, id: &str) -> Result<String, QueueError> {
    match retry_dead(store, id).await {
        Ok(job) => Ok(format!("Job {} successfully re-queued from DLQ.", job.id)),
        Err(QueueError::NotFound(_)) => Err(QueueError::NotFound(format!(
            "{id} is not in the DLQ (state: 'dead')"
        ))),
        Err(e) => Err(e),
    }
}

/// `queuectl config set <key> <value>`
pub async fn config_set(store: &dyn JobStore, key: &str, value: &str) -> Result<String, QueueError> {
    set_config(store, key, value).await?;
    Ok(format!("Config set: {key} = {}", value.trim()))
}

/// `queuectl config show`
pub async fn config_show(store: &dyn JobStore) -> String {
    render_defaults(&resolve_defaults(store).await)
}
