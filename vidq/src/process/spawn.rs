//! Async process spawning with combined output capture.
//!
//! Provides:
//! - Line-by-line capture of stdout and stderr, kept in arrival order
//! - Optional forwarding of each line to an observer channel
//! - Timeout support
//! - Cooperative cancellation that kills the child

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output line from a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Line from stdout.
    Stdout(String),
    /// Line from stderr.
    Stderr(String),
}

impl ProcessOutput {
    pub fn line(&self) -> &str {
        match self {
            Self::Stdout(line) | Self::Stderr(line) => line,
        }
    }
}

/// Configuration options for spawning a process.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// The program to execute.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Environment variables to set (merged with current env).
    pub env: HashMap<String, String>,

    /// Timeout for the entire process execution.
    pub timeout: Option<Duration>,

    /// Buffer size for the output channel (default: 1000).
    pub buffer_size: usize,
}

impl ProcessOptions {
    /// Create new options for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: None,
            buffer_size: 1000,
        }
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set an optional timeout for the process.
    pub const fn timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout = duration;
        self
    }
}

/// Result from a finished process.
#[derive(Debug)]
pub struct ProcessResult {
    /// Exit status of the process.
    pub status: ExitStatus,

    /// Every stdout and stderr line, in arrival order.
    pub output: Vec<ProcessOutput>,

    /// Whether the process was killed due to timeout.
    pub timed_out: bool,

    /// Whether the process was killed due to cancellation.
    pub cancelled: bool,
}

impl ProcessResult {
    /// Check if the process exited successfully on its own.
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    /// Combined stdout and stderr as a single string.
    pub fn combined_output(&self) -> String {
        self.output
            .iter()
            .map(ProcessOutput::line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get the exit code, if available.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Spawn a process, collect its combined output and wait for it to exit.
///
/// Each line is also forwarded to `observer` when one is given. When
/// `cancel` fires or the timeout elapses the child is killed and the
/// result is flagged accordingly; this is not an error.
pub async fn spawn_process(
    options: ProcessOptions,
    cancel: CancellationToken,
    observer: Option<mpsc::Sender<ProcessOutput>>,
) -> Result<ProcessResult> {
    let mut cmd = Command::new(&options.program);
    cmd.args(&options.args);

    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    debug!(program = %options.program, args = ?options.args, "Spawning process");

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn process: {}", options.program))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (tx, mut rx) = mpsc::channel::<ProcessOutput>(options.buffer_size);

    // Spawn stdout reader task
    if let Some(stdout) = stdout {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(ProcessOutput::Stdout(line)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Spawn stderr reader task
    if let Some(stderr) = stderr {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(ProcessOutput::Stderr(line)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Drop the original sender so the channel closes when readers finish
    drop(tx);

    let mut output = Vec::new();

    let collect_future = async {
        while let Some(line) = rx.recv().await {
            if let Some(ref observer) = observer {
                let _ = observer.send(line.clone()).await;
            }
            output.push(line);
        }
    };

    let interrupt = tokio::select! {
        () = collect_future => None,
        () = cancel.cancelled() => Some(Interrupt::Cancelled),
        () = deadline(options.timeout) => Some(Interrupt::TimedOut),
    };

    let (timed_out, cancelled) = match interrupt {
        None => (false, false),
        Some(reason) => {
            let label = match reason {
                Interrupt::TimedOut => "timeout",
                Interrupt::Cancelled => "cancellation",
            };
            warn!(program = %options.program, "Killing process on {label}");
            if let Err(e) = child.kill().await {
                warn!(program = %options.program, "Failed to kill process: {e}");
            }
            // Keep whatever the readers had already queued
            while let Ok(line) = rx.try_recv() {
                output.push(line);
            }
            (
                matches!(reason, Interrupt::TimedOut),
                matches!(reason, Interrupt::Cancelled),
            )
        }
    };

    let status = child
        .wait()
        .await
        .context("Failed to wait for process to exit")?;

    Ok(ProcessResult {
        status,
        output,
        timed_out,
        cancelled,
    })
}
