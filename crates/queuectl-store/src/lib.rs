//! Persistent job store for queuectl.
//!
//! Jobs and configuration live in a single SQLite file shared by every worker
//! process. The claim is one `UPDATE ... RETURNING` statement inside an
//! immediate transaction, so at most one connection can win a given job.

mod sqlite;

pub use sqlite::SqliteJobStore;
