//! SQLite database for jobs and configuration.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use queuectl_core::{
    Decision, Job, JobState, JobStore, MAX_LIST_LIMIT, NewJob, QueueError, StateCounts,
    check_finalize_target,
};

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, base_backoff_seconds, \
     available_at_ms, output, error, created_at_ms, updated_at_ms";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending'
            CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
        attempts INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        base_backoff_seconds INTEGER NOT NULL,
        available_at_ms INTEGER NOT NULL,
        output TEXT NOT NULL DEFAULT '',
        error TEXT NOT NULL DEFAULT '',
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, available_at_ms, created_at_ms);
    CREATE INDEX IF NOT EXISTS idx_jobs_listing ON jobs(state, created_at_ms);

    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// SQLite-backed [`JobStore`].
///
/// Each instance owns one connection. Worker processes open their own
/// instance against the same database file; the claim runs in an immediate
/// transaction so concurrent connections serialize on the write lock.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(store_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_err)?;

        // WAL lets readers proceed while a worker holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;

        info!(path = %path.display(), "job database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| QueueError::StoreUnavailable("connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| QueueError::StoreUnavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp_millis();
            let sql = format!(
                "INSERT INTO jobs
                 (id, command, state, attempts, max_retries, base_backoff_seconds,
                  available_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(id) DO NOTHING
                 RETURNING {JOB_COLUMNS}"
            );

            let inserted = conn
                .query_row(
                    &sql,
                    params![
                        job.id,
                        job.command,
                        job.max_retries,
                        job.base_backoff_seconds,
                        job.available_at.timestamp_millis(),
                        now,
                    ],
                    row_to_job,
                )
                .optional()
                .map_err(store_err)?;

            // ON CONFLICT DO NOTHING returns no row and leaves the original untouched
            inserted.ok_or(QueueError::DuplicateId(job.id))
        })
        .await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let job = self
            .with_conn(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(store_err)?;

                let sql = format!(
                    "UPDATE jobs
                     SET state = 'processing', attempts = attempts + 1, updated_at_ms = ?1
                     WHERE rowid = (
                         SELECT rowid FROM jobs
                         WHERE state IN ('pending', 'failed') AND available_at_ms <= ?1
                         ORDER BY available_at_ms ASC, created_at_ms ASC, rowid ASC
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                );
                let job = tx
                    .query_row(&sql, params![now.timestamp_millis()], row_to_job)
                    .optional()
                    .map_err(store_err)?;

                tx.commit().map_err(store_err)?;
                Ok(job)
            })
            .await?;

        if let Some(ref job) = job {
            debug!(job_id = %job.id, attempts = job.attempts, "claimed job");
        }
        Ok(job)
    }

    #[tracing::instrument(skip(self, decision), fields(state = %decision.state))]
    async fn finalize(&self, id: &str, decision: &Decision) -> Result<(), QueueError> {
        check_finalize_target(decision)?;

        let id = id.to_string();
        let decision = decision.clone();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE jobs
                     SET state = ?2, output = ?3, error = ?4,
                         available_at_ms = COALESCE(?5, available_at_ms), updated_at_ms = ?6
                     WHERE id = ?1 AND state = 'processing'",
                    params![
                        id,
                        decision.state.as_str(),
                        decision.output,
                        decision.error,
                        decision.retry_at.map(|at| at.timestamp_millis()),
                        Utc::now().timestamp_millis(),
                    ],
                )
                .map_err(store_err)?;

            if updated == 0 {
                return Err(QueueError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn retry_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE jobs
                 SET state = 'pending', attempts = 0, error = '',
                     available_at_ms = ?2, updated_at_ms = ?2
                 WHERE id = ?1 AND state = 'dead'
                 RETURNING {JOB_COLUMNS}"
            );
            let requeued = conn
                .query_row(&sql, params![id, now.timestamp_millis()], row_to_job)
                .optional()
                .map_err(store_err)?;
            requeued.ok_or(QueueError::NotFound(id))
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
            conn.query_row(&sql, params![id], row_to_job)
                .optional()
                .map_err(store_err)
        })
        .await
    }

    async fn counts_by_state(&self) -> Result<StateCounts, QueueError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .map_err(store_err)?;

            let rows = stmt
                .query_map([], |row| Ok((state_at(row, 0)?, row.get::<_, i64>(1)?)))
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;

            let mut counts = StateCounts::default();
            for (state, count) in rows {
                counts.add(state, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let limit = limit.min(MAX_LIST_LIMIT) as i64;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state = ?1
                 ORDER BY created_at_ms DESC, rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql).map_err(store_err)?;

            let rows = stmt
                .query_map(params![state.as_str(), limit], row_to_job)
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;
            Ok(rows)
        })
        .await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, QueueError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)
        })
        .await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }
}

fn store_err(e: rusqlite::Error) -> QueueError {
    QueueError::StoreUnavailable(e.to_string())
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state: state_at(row, 2)?,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        base_backoff_seconds: row.get(5)?,
        available_at: timestamp_at(row, 6)?,
        output: row.get(7)?,
        error: row.get(8)?,
        created_at: timestamp_at(row, 9)?,
        updated_at: timestamp_at(row, 10)?,
    })
}

fn state_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobState> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}
