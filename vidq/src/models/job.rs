//! Job model and the lifecycle state machine.
//!
//! ```text
//! Queued ──▶ Started ──▶ Completed
//!   │         │  ▲  └──▶ Failed ──(retry)──▶ Queued
//!   │         ▼  │
//!   │        Paused
//!   └──────────┴──────▶ Cancelled
//! ```
//!
//! Every transition is a method on [`Job`]. An illegal request returns
//! [`JobError::InvalidState`] and leaves the record untouched.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::format::{Resolution, VideoFormat};
use crate::error::{JobError, JobResult};

/// Generate a job ID (`UUIDv7`, time-ordered).
pub fn new_job_id() -> String {
    Uuid::now_v7().to_string()
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the work queue.
    Queued,
    /// Owned by a worker and executing.
    Started,
    /// Suspended at a worker checkpoint.
    Paused,
    /// Transcoder finished successfully.
    Completed,
    /// Transcoder or execution-time validation failed.
    Failed,
    /// Cancelled by request. Never revived.
    Cancelled,
}

impl JobStatus {
    /// Convert status to string for database storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse status from database string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" | "pending" => Some(Self::Queued),
            "started" | "in_progress" => Some(Self::Started),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a worker currently owns the job.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::Paused)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One timestamped line of execution output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub line: String,
}

impl LogLine {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            line: line.into(),
        }
    }
}

/// What to transcode and how. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub format: VideoFormat,
    pub resolution: Resolution,
}

impl JobSpec {
    /// Check paths and that the input exists and can be opened.
    ///
    /// Format and resolution are closed enums, so they are checked when the
    /// request is parsed.
    pub fn validate(&self) -> JobResult<()> {
        if self.input_path.as_os_str().is_empty() {
            return Err(JobError::validation("input file cannot be empty"));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(JobError::validation("output file cannot be empty"));
        }

        let input = self.input_path.display();
        let meta = std::fs::metadata(&self.input_path)
            .map_err(|_| JobError::validation(format!("input file does not exist: {input}")))?;
        if !meta.is_file() {
            return Err(JobError::validation(format!(
                "input is not a regular file: {input}"
            )));
        }
        std::fs::File::open(&self.input_path)
            .map_err(|e| JobError::validation(format!("input file is not readable: {input}: {e}")))?;

        Ok(())
    }
}

/// One transcoding request and its mutable lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, kept across retries.
    pub id: String,
    #[serde(flatten)]
    pub spec: JobSpec,
    /// Higher is served first.
    pub priority: i32,
    pub status: JobStatus,
    /// Percentage, 0 to 100.
    pub progress: u8,
    /// Set only while the job is Failed.
    pub error_message: Option<String>,
    /// Number of times a worker has started this job.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the current attempt.
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(id: String, spec: JobSpec, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            priority,
            status: JobStatus::Queued,
            progress: 0,
            error_message: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
        }
    }

    fn require(&self, allowed: &[JobStatus], action: &'static str) -> JobResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(JobError::invalid_state(&self.id, self.status, action))
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Queued → Started.
    pub fn start(&mut self) -> JobResult<()> {
        self.require(&[JobStatus::Queued], "start")?;
        self.status = JobStatus::Started;
        self.attempts += 1;
        self.started_at.get_or_insert_with(Utc::now);
        self.touch();
        Ok(())
    }

    /// Started → Completed. Progress is forced to 100.
    pub fn complete(&mut self) -> JobResult<()> {
        self.require(&[JobStatus::Started], "complete")?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.finished_at.get_or_insert_with(Utc::now);
        self.touch();
        Ok(())
    }

    /// Started → Failed.
    pub fn fail(&mut self, message: impl Into<String>) -> JobResult<()> {
        self.require(&[JobStatus::Started], "fail")?;
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.finished_at.get_or_insert_with(Utc::now);
        self.touch();
        Ok(())
    }

    /// Started → Paused.
    pub fn pause(&mut self) -> JobResult<()> {
        self.require(&[JobStatus::Started], "pause")?;
        self.status = JobStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Paused → Started.
    pub fn resume(&mut self) -> JobResult<()> {
        self.require(&[JobStatus::Paused], "resume")?;
        self.status = JobStatus::Started;
        self.touch();
        Ok(())
    }

    /// Any non-terminal status → Cancelled.
    pub fn cancel(&mut self) -> JobResult<()> {
        if self.status.is_terminal() {
            return Err(JobError::invalid_state(&self.id, self.status, "cancel"));
        }
        self.status = JobStatus::Cancelled;
        self.finished_at.get_or_insert_with(Utc::now);
        self.touch();
        Ok(())
    }

    /// Failed → Queued for another attempt under the same ID.
    ///
    /// `started_at` and `finished_at` keep the first attempt's values.
    pub fn reset_for_retry(&mut self) -> JobResult<()> {
        self.require(&[JobStatus::Failed], "retry")?;
        self.status = JobStatus::Queued;
        self.error_message = None;
        self.progress = 0;
        self.touch();
        Ok(())
    }

    /// Change priority. Completed and cancelled jobs are frozen.
    pub fn set_priority(&mut self, priority: i32) -> JobResult<()> {
        self.require(
            &[
                JobStatus::Queued,
                JobStatus::Started,
                JobStatus::Paused,
                JobStatus::Failed,
            ],
            "reprioritize",
        )?;
        self.priority = priority;
        self.touch();
        Ok(())
    }

    /// Raise progress, never lower it. Returns whether the value changed.
    ///
    /// Values above 100 are clamped.
    pub fn advance_progress(&mut self, percent: u8) -> JobResult<bool> {
        if !self.status.is_active() {
            return Err(JobError::invalid_state(&self.id, self.status, "update progress of"));
        }
        let percent = percent.min(100);
        if percent <= self.progress {
            return Ok(false);
        }
        self.progress = percent;
        self.touch();
        Ok(true)
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        self.logs.push(LogLine::now(line));
    }
}
