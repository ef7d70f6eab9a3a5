//! Data models for transcoding jobs.

mod format;
mod job;
mod request;

pub use format::{Resolution, VideoFormat};
pub use job::{new_job_id, Job, JobSpec, JobStatus, LogLine};
pub use request::{JobNotification, TranscodeRequest};
