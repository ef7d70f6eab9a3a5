//! External transcoder capability.
//!
//! Workers only see the [`Transcoder`] trait. The production implementation
//! shells out to FFmpeg; tests substitute a deterministic fake.

mod ffmpeg;
mod progress;

#[cfg(test)]
pub mod fake;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::JobResult;
use crate::models::{JobSpec, Resolution, VideoFormat};

pub use ffmpeg::{ffmpeg_available, FfmpegTranscoder};
pub use progress::ProgressTracker;

/// Parameters for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeParams {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub format: VideoFormat,
    pub resolution: Resolution,
}

impl TranscodeParams {
    /// Final output file: `output_path` with the container suffix appended
    /// unless it already carries it.
    pub fn output_file(&self) -> PathBuf {
        let suffix = self.format.as_str();
        let has_suffix = self
            .output_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(suffix));
        if has_suffix {
            self.output_path.clone()
        } else {
            let mut path = self.output_path.clone().into_os_string();
            path.push(".");
            path.push(suffix);
            PathBuf::from(path)
        }
    }
}

impl From<&JobSpec> for TranscodeParams {
    fn from(spec: &JobSpec) -> Self {
        Self {
            input_path: spec.input_path.clone(),
            output_path: spec.output_path.clone(),
            format: spec.format,
            resolution: spec.resolution,
        }
    }
}

/// Something observed while the transcoder runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeEvent {
    Log(String),
    Progress(u8),
}

/// Per-invocation handles passed to [`Transcoder::run`].
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    events: mpsc::Sender<TranscodeEvent>,
}

impl RunContext {
    pub const fn new(cancel: CancellationToken, events: mpsc::Sender<TranscodeEvent>) -> Self {
        Self { cancel, events }
    }

    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report an event. Dropped silently if nobody listens anymore.
    pub async fn emit(&self, event: TranscodeEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    pub output_file: PathBuf,
    /// Combined stdout/stderr of the run.
    pub output: String,
}

/// Capability to run one transcode to completion.
///
/// Implementations must not retry. A non-zero exit becomes
/// `JobError::TranscodeExecution` with the captured output, and an
/// invocation stopped through the run context returns `JobError::Cancelled`.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Short name for logs and health output.
    fn name(&self) -> &str;

    async fn run(&self, params: &TranscodeParams, ctx: RunContext) -> JobResult<TranscodeOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(output: &str, format: VideoFormat) -> TranscodeParams {
        TranscodeParams {
            input_path: PathBuf::from("/in.mov"),
            output_path: PathBuf::from(output),
            format,
            resolution: Resolution::Hd720,
        }
    }

    #[test]
    fn test_output_file_appends_suffix() {
        assert_eq!(
            params("/out/video", VideoFormat::Mp4).output_file(),
            PathBuf::from("/out/video.mp4")
        );
        assert_eq!(
            params("/out/video.final", VideoFormat::Mkv).output_file(),
            PathBuf::from("/out/video.final.mkv")
        );
    }

    #[test]
    fn test_output_file_keeps_matching_suffix() {
        assert_eq!(
            params("/out/video.MOV", VideoFormat::Mov).output_file(),
            PathBuf::from("/out/video.MOV")
        );
    }
}
