//! `SQLite` connection management.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::queries::JobQueries;
use super::JobStore;
use crate::error::{JobError, JobResult};
use crate::models::{Job, JobStatus};

/// Durable job store backed by a single `SQLite` file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Get the default database path (`~/.vidq/jobs.db`).
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".vidq").join("jobs.db"))
    }

    /// Open or create the database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        Self::initialize(&conn).context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize the database schema.
    fn initialize(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS transcoding_jobs (
                job_id TEXT PRIMARY KEY,
                input_path TEXT NOT NULL,
                output_path TEXT NOT NULL,
                target_format TEXT NOT NULL,
                target_resolution TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                finished_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                logged_at TEXT NOT NULL,
                line TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES transcoding_jobs(job_id)
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON transcoding_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_job_logs_job_id ON job_logs(job_id);
            ",
        )
    }

    pub(super) fn conn(&self) -> JobResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| JobError::persistence("database lock poisoned"))
    }
}

impl JobStore for SqliteStore {
    fn upsert(&self, job: &Job) -> JobResult<()> {
        JobQueries::upsert(&mut *self.conn()?, job)
    }

    fn get(&self, id: &str) -> JobResult<Option<Job>> {
        JobQueries::get_by_id(&*self.conn()?, id)
    }

    fn delete(&self, id: &str) -> JobResult<bool> {
        JobQueries::delete(&mut *self.conn()?, id)
    }

    fn list_by_status(&self, status: JobStatus) -> JobResult<Vec<Job>> {
        JobQueries::list_by_status(&*self.conn()?, status)
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> JobResult<usize> {
        JobQueries::purge_completed_before(&mut *self.conn()?, cutoff)
    }

    fn reset_failed_to_queued(&self) -> JobResult<usize> {
        JobQueries::reset_failed_to_queued(&*self.conn()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let store = SqliteStore::open_at(&path).unwrap();
        assert!(path.exists());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        drop(SqliteStore::open_at(&path).unwrap());
        let store = SqliteStore::open_at(&path).unwrap();
        assert!(store.list_by_status(JobStatus::Queued).unwrap().is_empty());
    }
}
