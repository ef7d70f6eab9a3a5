//! Service configuration.
//!
//! Defaults, overridden by `VIDQ_*` environment variables (a `.env` file is
//! loaded first), then by explicit `serve` flags.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{JobError, JobResult};
use crate::scheduler::{EnqueuePolicy, SchedulerConfig};

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP port, bound on 127.0.0.1.
    pub port: u16,
    /// Concurrent workers
    pub workers: usize,
    /// Maximum number of waiting jobs
    pub queue_capacity: usize,
    pub enqueue_policy: EnqueuePolicy,
    /// FFmpeg executable, resolved on `PATH`
    pub ffmpeg_path: String,
    /// Per-invocation limit. `None` lets FFmpeg run as long as it needs.
    pub job_timeout: Option<Duration>,
    /// `None` uses `~/.vidq/jobs.db`.
    pub db_path: Option<PathBuf>,
    /// Keep jobs in memory only.
    pub ephemeral: bool,
    /// Completed jobs older than this are purged.
    pub retention_days: u32,
    pub maintenance_interval: Duration,
    /// How long running jobs may finish after a shutdown signal.
    pub shutdown_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: 2,
            queue_capacity: 100,
            enqueue_policy: EnqueuePolicy::Reject,
            ffmpeg_path: "ffmpeg".to_string(),
            job_timeout: None,
            db_path: None,
            ephemeral: false,
            retention_days: 7,
            maintenance_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> JobResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; malformed ones are a config error.
    pub fn from_lookup<F>(lookup: F) -> JobResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let timeout_secs: u64 = parse_var(&lookup, "VIDQ_JOB_TIMEOUT_SECS", 0)?;

        let config = Self {
            port: parse_var(&lookup, "VIDQ_PORT", defaults.port)?,
            workers: parse_var(&lookup, "VIDQ_WORKERS", defaults.workers)?,
            queue_capacity: parse_var(&lookup, "VIDQ_QUEUE_CAPACITY", defaults.queue_capacity)?,
            enqueue_policy: parse_var(&lookup, "VIDQ_ENQUEUE_POLICY", defaults.enqueue_policy)?,
            ffmpeg_path: lookup("VIDQ_FFMPEG").unwrap_or(defaults.ffmpeg_path),
            job_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            db_path: lookup("VIDQ_DB_PATH").map(PathBuf::from),
            ephemeral: defaults.ephemeral,
            retention_days: parse_var(&lookup, "VIDQ_RETENTION_DAYS", defaults.retention_days)?,
            maintenance_interval: Duration::from_secs(parse_var(
                &lookup,
                "VIDQ_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval.as_secs(),
            )?),
            shutdown_grace: Duration::from_secs(parse_var(
                &lookup,
                "VIDQ_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
        };
        Ok(config)
    }

    pub fn validate(&self) -> JobResult<()> {
        if self.workers == 0 {
            return Err(JobError::config("worker count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(JobError::config("queue capacity must be at least 1"));
        }
        if self.ffmpeg_path.trim().is_empty() {
            return Err(JobError::config("ffmpeg path cannot be empty"));
        }
        if self.retention_days == 0 {
            return Err(JobError::config("retention must be at least 1 day"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(JobError::config("maintenance interval must be positive"));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            policy: self.enqueue_policy,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> JobResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| JobError::config(format!("invalid value for {key}: '{raw}'"))),
    }
}
