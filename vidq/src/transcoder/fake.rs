//! Deterministic transcoder for scheduler tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{RunContext, TranscodeEvent, TranscodeOutcome, TranscodeParams, Transcoder};
use crate::error::{JobError, JobResult};

#[derive(Debug, Default)]
pub struct FakeTranscoder {
    /// When set, each run blocks until a permit is released.
    gate: Option<Arc<Semaphore>>,
    progress: Vec<u8>,
    /// Fail this many runs before succeeding.
    failures: AtomicUsize,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    /// Output paths in the order runs began.
    seen: Mutex<Vec<PathBuf>>,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every run until [`FakeTranscoder::release`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, steps: Vec<u8>) -> Self {
        self.progress = steps;
        self
    }

    pub fn failing(self, times: usize) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }

    /// Let `n` held runs proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().clone()
    }

    async fn hold(&self, ctx: &RunContext) -> JobResult<()> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                () = ctx.cancel_token().cancelled() => return Err(JobError::Cancelled),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run(&self, params: &TranscodeParams, ctx: RunContext) -> JobResult<TranscodeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(params.output_path.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        ctx.emit(TranscodeEvent::Log(format!(
            "fake transcode of {}",
            params.input_path.display()
        )))
        .await;
        for step in &self.progress {
            ctx.emit(TranscodeEvent::Progress(*step)).await;
        }

        self.hold(&ctx).await?;

        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(JobError::transcode_failed(
                "fake exited with 1",
                "Invalid data found when processing input",
            ));
        }

        Ok(TranscodeOutcome {
            output_file: params.output_file(),
            output: String::new(),
        })
    }
}
