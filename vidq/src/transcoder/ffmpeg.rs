//! FFmpeg-backed transcoder.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ProgressTracker, RunContext, TranscodeEvent, TranscodeOutcome, TranscodeParams, Transcoder};
use crate::error::{JobError, JobResult};
use crate::process::{spawn_process, ProcessOptions, ProcessOutput, ProcessResult};

const VIDEO_CODEC: &str = "libx264";
const PRESET: &str = "fast";
const CRF: u8 = 22;

/// Check whether the FFmpeg binary can be found.
pub fn ffmpeg_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Runs one `ffmpeg` process per job.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    timeout: Option<Duration>,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Kill invocations that run longer than `timeout`.
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the argument list for one invocation.
    pub fn build_args(params: &TranscodeParams, output_file: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            params.input_path.to_string_lossy().to_string(),
            "-s".to_string(),
            params.resolution.dimensions().to_string(),
            "-c:v".to_string(),
            VIDEO_CODEC.to_string(),
            "-preset".to_string(),
            PRESET.to_string(),
            "-crf".to_string(),
            CRF.to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            output_file.to_string_lossy().to_string(),
        ]
    }

    fn classify(&self, result: &ProcessResult) -> JobResult<()> {
        if result.cancelled {
            return Err(JobError::Cancelled);
        }
        if result.timed_out {
            let limit = self.timeout.unwrap_or_default();
            return Err(JobError::transcode_failed(
                format!("{} timed out after {}s", self.program, limit.as_secs()),
                result.combined_output(),
            ));
        }
        if !result.status.success() {
            let code = result
                .code()
                .map_or_else(|| "a signal".to_string(), |c| c.to_string());
            return Err(JobError::transcode_failed(
                format!("{} exited with {code}", self.program),
                result.combined_output(),
            ));
        }
        Ok(())
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn run(&self, params: &TranscodeParams, ctx: RunContext) -> JobResult<TranscodeOutcome> {
        let output_file = params.output_file();
        let options = ProcessOptions::new(&self.program)
            .args(Self::build_args(params, &output_file))
            .env("AV_LOG_FORCE_NOCOLOR", "1")
            .timeout(self.timeout);

        debug!(
            input = %params.input_path.display(),
            output = %output_file.display(),
            resolution = %params.resolution,
            "Invoking ffmpeg"
        );

        let (tx, mut rx) = mpsc::channel::<ProcessOutput>(256);
        let process = spawn_process(options, ctx.cancel_token().clone(), Some(tx));

        let relay = async {
            let mut tracker = ProgressTracker::new();
            while let Some(line) = rx.recv().await {
                match line {
                    ProcessOutput::Stdout(line) => {
                        if let Some(percent) = tracker.observe_progress(&line) {
                            ctx.emit(TranscodeEvent::Progress(percent)).await;
                        }
                    }
                    ProcessOutput::Stderr(line) => {
                        if let Some(percent) = tracker.observe_stderr(&line) {
                            ctx.emit(TranscodeEvent::Progress(percent)).await;
                        }
                        ctx.emit(TranscodeEvent::Log(line)).await;
                    }
                }
            }
        };

        let (result, ()) = tokio::join!(process, relay);
        let result = result.map_err(|e| {
            JobError::transcode_failed(format!("failed to launch {}: {e:#}", self.program), "")
        })?;

        self.classify(&result)?;

        Ok(TranscodeOutcome {
            output_file,
            output: result.combined_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::models::{Resolution, VideoFormat};

    fn params(dir: &Path) -> TranscodeParams {
        TranscodeParams {
            input_path: dir.join("in.mov"),
            output_path: dir.join("out"),
            format: VideoFormat::Mkv,
            resolution: Resolution::Fhd1080,
        }
    }

    /// Write an executable shell script standing in for ffmpeg.
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn drain(rx: &mut mpsc::Receiver<TranscodeEvent>) -> Vec<TranscodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_build_args() {
        let params = TranscodeParams {
            input_path: PathBuf::from("/videos/in.mov"),
            output_path: PathBuf::from("/videos/out"),
            format: VideoFormat::Mp4,
            resolution: Resolution::Sd480,
        };
        let args = FfmpegTranscoder::build_args(&params, &params.output_file());
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-nostdin",
                "-y",
                "-i",
                "/videos/in.mov",
                "-s",
                "640x480",
                "-c:v",
                "libx264",
                "-preset",
                "fast",
                "-crf",
                "22",
                "-progress",
                "pipe:1",
                "-nostats",
                "/videos/out.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_success_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_ffmpeg(
            dir.path(),
            r#"echo "out_time_us=2500000"
sleep 0.2
echo "  Duration: 00:00:10.00, start: 0.000000" >&2
sleep 0.2
echo "out_time_us=5000000"
echo "progress=continue"
echo "progress=end"
for last; do :; done
: > "$last""#,
        );
        let transcoder = FfmpegTranscoder::new(script.to_string_lossy());
        let (tx, mut rx) = mpsc::channel(64);
        let ctx = RunContext::new(CancellationToken::new(), tx);

        let params = params(dir.path());
        let outcome = transcoder.run(&params, ctx).await.unwrap();

        assert_eq!(outcome.output_file, dir.path().join("out.mkv"));
        assert!(outcome.output_file.exists());

        let events = drain(&mut rx);
        // The position seen before the banner is reported once it arrives
        assert!(events.contains(&TranscodeEvent::Progress(25)));
        assert!(events.contains(&TranscodeEvent::Progress(50)));
        assert!(events.contains(&TranscodeEvent::Progress(99)));
        assert!(events
            .iter()
            .any(|e| matches!(e, TranscodeEvent::Log(line) if line.contains("Duration"))));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_ffmpeg(
            dir.path(),
            "echo 'progress=continue'\necho 'in.mov: Invalid data found when processing input' >&2\nexit 1",
        );
        let transcoder = FfmpegTranscoder::new(script.to_string_lossy());
        let (tx, _rx) = mpsc::channel(64);
        let ctx = RunContext::new(CancellationToken::new(), tx);

        let err = transcoder.run(&params(dir.path()), ctx).await.unwrap_err();
        match err {
            JobError::TranscodeExecution { message, output } => {
                assert!(message.ends_with("exited with 1"));
                assert!(output.contains("Invalid data found"));
                assert!(output.contains("progress=continue"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_ffmpeg(dir.path(), "sleep 10");
        let transcoder = FfmpegTranscoder::new(script.to_string_lossy());
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(cancel.clone(), tx);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = transcoder.run(&params(dir.path()), ctx).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_ffmpeg(dir.path(), "sleep 10");
        let transcoder = FfmpegTranscoder::new(script.to_string_lossy())
            .with_timeout(Some(Duration::from_millis(100)));
        let (tx, _rx) = mpsc::channel(64);
        let ctx = RunContext::new(CancellationToken::new(), tx);

        let err = transcoder.run(&params(dir.path()), ctx).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-12345");
        let (tx, _rx) = mpsc::channel(64);
        let ctx = RunContext::new(CancellationToken::new(), tx);

        let err = transcoder.run(&params(dir.path()), ctx).await.unwrap_err();
        assert!(matches!(err, JobError::TranscodeExecution { .. }));
        assert!(err.to_string().contains("failed to launch"));
    }

    #[test]
    fn test_ffmpeg_available() {
        assert!(ffmpeg_available("sh"));
        assert!(!ffmpeg_available("definitely-not-a-binary-12345"));
    }
}
