//! Inbound payloads: job submissions and webhook notifications.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::format::{Resolution, VideoFormat};
use super::job::{JobSpec, JobStatus};
use crate::error::JobResult;

/// Submission payload.
///
/// Format and resolution arrive as plain strings so that an unknown label is
/// reported as a validation failure rather than a malformed body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    #[serde(default)]
    pub input_path: String,
    #[serde(default)]
    pub output_path: String,
    pub format: String,
    pub resolution: String,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl TranscodeRequest {
    /// Parse labels into a [`JobSpec`]. Does not touch the filesystem.
    pub fn to_spec(&self) -> JobResult<JobSpec> {
        let format: VideoFormat = self.format.parse()?;
        let resolution: Resolution = self.resolution.parse()?;
        Ok(JobSpec {
            input_path: PathBuf::from(self.input_path.trim()),
            output_path: PathBuf::from(self.output_path.trim()),
            format,
            resolution,
        })
    }
}

/// Externally triggered status update, as posted to `/webhook`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;

    #[test]
    fn test_to_spec() {
        let req: TranscodeRequest = serde_json::from_str(
            r#"{"input_path":" /in.mov ","output_path":"/out","format":"MP4","resolution":"1080p","priority":3}"#,
        )
        .unwrap();
        let spec = req.to_spec().unwrap();
        assert_eq!(spec.input_path, PathBuf::from("/in.mov"));
        assert_eq!(spec.format, VideoFormat::Mp4);
        assert_eq!(spec.resolution, Resolution::Fhd1080);
        assert_eq!(req.priority, Some(3));
    }

    #[test]
    fn test_unknown_labels_are_validation_errors() {
        let req = TranscodeRequest {
            input_path: "/in".into(),
            output_path: "/out".into(),
            format: "flv".into(),
            resolution: "720p".into(),
            priority: None,
        };
        assert!(matches!(req.to_spec(), Err(JobError::Validation(_))));

        let req = TranscodeRequest {
            format: "mkv".into(),
            resolution: "8k".into(),
            ..req
        };
        assert!(matches!(req.to_spec(), Err(JobError::Validation(_))));
    }

    #[test]
    fn test_notification_defaults() {
        let n: JobNotification = serde_json::from_str(r#"{"job_id":"abc"}"#).unwrap();
        assert!(n.status.is_none() && n.progress.is_none() && n.message.is_none());
        let n: JobNotification =
            serde_json::from_str(r#"{"job_id":"abc","status":"paused"}"#).unwrap();
        assert_eq!(n.status, Some(JobStatus::Paused));
    }
}
