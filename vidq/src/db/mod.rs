//! Durable job storage.
//!
//! The scheduler only talks to [`JobStore`]. `SQLite` backs the service;
//! [`MemoryStore`] backs tests and ephemeral runs.

mod connection;
mod memory;
mod queries;

use chrono::{DateTime, Utc};

use crate::error::JobResult;
use crate::models::{Job, JobStatus};

pub use connection::SqliteStore;
pub use memory::MemoryStore;

/// CRUD over persisted job records. No concurrency logic of its own.
pub trait JobStore: Send + Sync {
    /// Insert or replace the record, logs included.
    fn upsert(&self, job: &Job) -> JobResult<()>;

    fn get(&self, id: &str) -> JobResult<Option<Job>>;

    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> JobResult<bool>;

    fn list_by_status(&self, status: JobStatus) -> JobResult<Vec<Job>>;

    /// Remove completed jobs that finished before `cutoff`.
    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> JobResult<usize>;

    /// Batch move every failed record back to queued.
    fn reset_failed_to_queued(&self) -> JobResult<usize>;
}
