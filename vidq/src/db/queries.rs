//! Database query implementations.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::error::{JobError, JobResult};
use crate::models::{Job, JobSpec, JobStatus, LogLine, Resolution, VideoFormat};

/// Parse a timestamp string flexibly from various formats.
fn parse_timestamp(s: &str) -> JobResult<DateTime<Utc>> {
    // Try RFC3339 first
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Try common SQLite datetime format: "YYYY-MM-DD HH:MM:SS"
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    // Try with fractional seconds: "YYYY-MM-DD HH:MM:SS.SSS"
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }

    Err(JobError::persistence(format!("Invalid timestamp format: {s}")))
}

/// Fixed-width UTC form, so text comparison in SQL orders correctly.
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const JOB_COLUMNS: &str = "job_id, input_path, output_path, target_format, target_resolution, \
     priority, status, progress, error_message, attempts, started_at, finished_at, created_at, updated_at";

/// Queries for the `transcoding_jobs` and `job_logs` tables.
pub struct JobQueries;

impl JobQueries {
    /// Insert or replace a job row together with its full log list.
    pub fn upsert(conn: &mut Connection, job: &Job) -> JobResult<()> {
        let tx = conn.transaction()?;
        tx.execute(
            r"INSERT INTO transcoding_jobs (job_id, input_path, output_path, target_format, target_resolution,
                  priority, status, progress, error_message, attempts, started_at, finished_at, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
              ON CONFLICT(job_id) DO UPDATE SET
                  input_path = excluded.input_path,
                  output_path = excluded.output_path,
                  target_format = excluded.target_format,
                  target_resolution = excluded.target_resolution,
                  priority = excluded.priority,
                  status = excluded.status,
                  progress = excluded.progress,
                  error_message = excluded.error_message,
                  attempts = excluded.attempts,
                  started_at = excluded.started_at,
                  finished_at = excluded.finished_at,
                  updated_at = excluded.updated_at",
            params![
                job.id,
                job.spec.input_path.to_string_lossy().into_owned(),
                job.spec.output_path.to_string_lossy().into_owned(),
                job.spec.format.as_str(),
                job.spec.resolution.as_str(),
                job.priority,
                job.status.as_str(),
                job.progress,
                job.error_message,
                job.attempts,
                job.started_at.map(format_timestamp),
                job.finished_at.map(format_timestamp),
                format_timestamp(job.created_at),
                format_timestamp(job.updated_at),
            ],
        )?;

        tx.execute("DELETE FROM job_logs WHERE job_id = ?1", params![job.id])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO job_logs (job_id, logged_at, line) VALUES (?1, ?2, ?3)")?;
            for log in &job.logs {
                stmt.execute(params![job.id, format_timestamp(log.at), log.line])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a job by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> JobResult<Option<Job>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM transcoding_jobs WHERE job_id = ?1"
        ))?;

        let result = stmt.query_row(params![id], |row| Ok(Self::row_to_job(row)));

        match result {
            Ok(job) => {
                let mut job = job?;
                job.logs = Self::logs_for(conn, &job.id)?;
                Ok(Some(job))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List jobs with a given status, oldest first.
    pub fn list_by_status(conn: &Connection, status: JobStatus) -> JobResult<Vec<Job>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM transcoding_jobs WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], |row| Ok(Self::row_to_job(row)))?;

        let mut jobs = Vec::new();
        for row in rows {
            let mut job = row??;
            job.logs = Self::logs_for(conn, &job.id)?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Delete a job and its logs. Returns whether a row existed.
    pub fn delete(conn: &mut Connection, id: &str) -> JobResult<bool> {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM job_logs WHERE job_id = ?1", params![id])?;
        let count = tx.execute("DELETE FROM transcoding_jobs WHERE job_id = ?1", params![id])?;
        tx.commit()?;
        Ok(count > 0)
    }

    /// Remove completed jobs that finished before `cutoff`.
    pub fn purge_completed_before(conn: &mut Connection, cutoff: DateTime<Utc>) -> JobResult<usize> {
        let cutoff = format_timestamp(cutoff);
        let tx = conn.transaction()?;
        tx.execute(
            r"DELETE FROM job_logs WHERE job_id IN (
                  SELECT job_id FROM transcoding_jobs
                  WHERE status = 'completed' AND updated_at < ?1)",
            params![cutoff],
        )?;
        let count = tx.execute(
            r"DELETE FROM transcoding_jobs
              WHERE status = 'completed' AND updated_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(count)
    }

    /// Move every failed job back to queued.
    pub fn reset_failed_to_queued(conn: &Connection) -> JobResult<usize> {
        let count = conn.execute(
            r"UPDATE transcoding_jobs
              SET status = 'queued', progress = 0, error_message = NULL,
                  updated_at = ?1
              WHERE status = 'failed'",
            params![format_timestamp(Utc::now())],
        )?;
        Ok(count)
    }

    fn logs_for(conn: &Connection, job_id: &str) -> JobResult<Vec<LogLine>> {
        let mut stmt =
            conn.prepare("SELECT logged_at, line FROM job_logs WHERE job_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut logs = Vec::new();
        for row in rows {
            let (at, line) = row?;
            logs.push(LogLine {
                at: parse_timestamp(&at)?,
                line,
            });
        }
        Ok(logs)
    }

    /// Convert a row to a Job (without logs).
    fn row_to_job(row: &rusqlite::Row<'_>) -> JobResult<Job> {
        let format_str: String = row.get(3)?;
        let format: VideoFormat = format_str.parse()?;
        let resolution_str: String = row.get(4)?;

        let status_str: String = row.get(6)?;
        let status = JobStatus::from_str(&status_str)
            .ok_or_else(|| JobError::persistence(format!("Invalid job status: {status_str}")))?;

        let optional_timestamp = |idx: usize| -> JobResult<Option<DateTime<Utc>>> {
            row.get::<_, Option<String>>(idx)?
                .map(|s| parse_timestamp(&s))
                .transpose()
        };

        Ok(Job {
            id: row.get(0)?,
            spec: JobSpec {
                input_path: PathBuf::from(row.get::<_, String>(1)?),
                output_path: PathBuf::from(row.get::<_, String>(2)?),
                format,
                resolution: Resolution::from_label(&resolution_str),
            },
            priority: row.get(5)?,
            status,
            progress: row.get::<_, u8>(7)?.min(100),
            error_message: row.get(8)?,
            attempts: row.get(9)?,
            started_at: optional_timestamp(10)?,
            finished_at: optional_timestamp(11)?,
            created_at: parse_timestamp(&row.get::<_, String>(12)?)?,
            updated_at: parse_timestamp(&row.get::<_, String>(13)?)?,
            logs: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::{JobStore, SqliteStore};
    use crate::models::new_job_id;

    fn job(status: JobStatus) -> Job {
        let mut job = Job::new(
            new_job_id(),
            JobSpec {
                input_path: PathBuf::from("/videos/in.mov"),
                output_path: PathBuf::from("/videos/out"),
                format: VideoFormat::Mov,
                resolution: Resolution::Uhd2160,
            },
            3,
        );
        job.status = status;
        job
    }

    #[test]
    fn test_upsert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut job = job(JobStatus::Queued);
        job.append_log("queued");
        store.upsert(&job).unwrap();

        job.start().unwrap();
        job.advance_progress(40).unwrap();
        job.append_log("frame=10");
        store.upsert(&job).unwrap();

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Started);
        assert_eq!(loaded.progress, 40);
        assert_eq!(loaded.priority, 3);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.spec, job.spec);
        assert!(loaded.started_at.is_some());
        assert_eq!(
            loaded.logs.iter().map(|l| l.line.as_str()).collect::<Vec<_>>(),
            vec!["queued", "frame=10"]
        );
    }

    #[test]
    fn test_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = job(JobStatus::Queued);
        store.upsert(&job).unwrap();
        assert!(store.delete(&job.id).unwrap());
        assert!(!store.delete(&job.id).unwrap());
        assert!(store.get(&job.id).unwrap().is_none());
    }

    #[test]
    fn test_purge_completed_before() {
        let store = SqliteStore::open_in_memory().unwrap();

        let mut old = job(JobStatus::Completed);
        old.updated_at = Utc::now() - Duration::days(10);
        old.append_log("done");
        let mut recent = job(JobStatus::Completed);
        recent.updated_at = Utc::now();
        let mut failed = job(JobStatus::Failed);
        failed.updated_at = Utc::now() - Duration::days(10);

        for j in [&old, &recent, &failed] {
            store.upsert(j).unwrap();
        }

        let purged = store
            .purge_completed_before(Utc::now() - Duration::days(7))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.get(&recent.id).unwrap().is_some());
        assert!(store.get(&failed.id).unwrap().is_some());
    }

    #[test]
    fn test_reset_failed_to_queued() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut failed = job(JobStatus::Failed);
        failed.error_message = Some("boom".to_string());
        failed.progress = 60;
        failed.started_at = Some(Utc::now() - Duration::minutes(5));
        failed.finished_at = Some(Utc::now() - Duration::minutes(1));
        store.upsert(&failed).unwrap();
        store.upsert(&job(JobStatus::Completed)).unwrap();

        assert_eq!(store.reset_failed_to_queued().unwrap(), 1);

        let loaded = store.get(&failed.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.progress, 0);
        assert!(loaded.error_message.is_none());
        assert!(loaded.started_at.is_some());
        assert!(loaded.finished_at.is_some());
        assert_eq!(store.list_by_status(JobStatus::Queued).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_resolution_defaults_to_720p() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = job(JobStatus::Queued);
        store.upsert(&job).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE transcoding_jobs SET target_resolution = '4k' WHERE job_id = ?1",
                params![job.id],
            )
            .unwrap();

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.spec.resolution, Resolution::Hd720);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-02T03:04:05.123456Z").is_ok());
        assert!(parse_timestamp("2024-01-02 03:04:05").is_ok());
        assert!(parse_timestamp("2024-01-02 03:04:05.250").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
