//! Worker loop: dequeue, run one job end to end, record the result.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::ActiveHandle;
use super::Shared;
use crate::error::{JobError, JobResult};
use crate::models::{Job, JobStatus};
use crate::transcoder::{RunContext, TranscodeEvent, TranscodeOutcome, TranscodeParams};

const EVENT_BUFFER: usize = 64;

pub(super) async fn run_worker(index: usize, shared: Arc<Shared>) {
    info!(worker = index, transcoder = shared.transcoder.name(), "Worker started");

    while let Some((job, handle)) = shared.queue.dequeue_into(&shared.registry).await {
        let id = job.id.clone();
        // A panic inside the job must not take the worker down with it
        let task = tokio::spawn(execute(Arc::clone(&shared), job, handle));
        if let Err(e) = task.await {
            error!(worker = index, job_id = %id, "Job task aborted: {e}");
            let _control = shared.control.lock().await;
            shared
                .registry
                .finish(
                    &id,
                    |job| fail_in_place(job, "worker task aborted"),
                    |job| {
                        let _ = shared.record(job);
                    },
                )
                .await;
        }
    }

    info!(worker = index, "Worker stopped");
}

async fn execute(shared: Arc<Shared>, job: Job, handle: ActiveHandle) {
    let ActiveHandle { cancel, mut state } = handle;
    info!(
        job_id = %job.id,
        attempt = job.attempts,
        input = %job.spec.input_path.display(),
        "Job started"
    );
    {
        // The registry copy may already carry a control operation's change
        let _control = shared.control.lock().await;
        if let Some(current) = shared.registry.get(&job.id).await {
            let _ = shared.record(&current);
        }
    }

    let result = if checkpoint(&mut state, &cancel).await {
        run_transcoder(&shared, &job, &cancel).await
    } else {
        Err(JobError::Cancelled)
    };

    // A pause requested during the run holds the result here
    if result.is_ok() && !checkpoint(&mut state, &cancel).await {
        finalize(&shared, &job.id, Err(JobError::Cancelled)).await;
        return;
    }

    finalize(&shared, &job.id, result).await;
}

async fn run_transcoder(
    shared: &Shared,
    job: &Job,
    cancel: &CancellationToken,
) -> JobResult<TranscodeOutcome> {
    job.spec.validate()?;

    let params = TranscodeParams::from(&job.spec);
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let ctx = RunContext::new(cancel.clone(), tx);

    let run = shared.transcoder.run(&params, ctx);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = rx.recv() => apply_event(shared, &job.id, event).await,
        }
    };
    while let Ok(event) = rx.try_recv() {
        apply_event(shared, &job.id, event).await;
    }
    result
}

async fn apply_event(shared: &Shared, id: &str, event: TranscodeEvent) {
    match event {
        TranscodeEvent::Log(line) => {
            shared
                .registry
                .transition(id, |job| {
                    job.append_log(line);
                    Ok(())
                })
                .await;
        }
        TranscodeEvent::Progress(percent) => {
            let mut changed = false;
            let updated = shared
                .registry
                .transition(id, |job| {
                    changed = job.advance_progress(percent)?;
                    Ok(())
                })
                .await;
            if let Some(Ok(job)) = updated {
                if changed {
                    shared.publish(&job);
                }
            }
        }
    }
}

/// Wait while the job is paused. Returns false once it is cancelled or
/// interrupted.
async fn checkpoint(state: &mut watch::Receiver<JobStatus>, cancel: &CancellationToken) -> bool {
    tokio::select! {
        status = state.wait_for(|s| *s != JobStatus::Paused) => {
            status.is_ok_and(|s| *s != JobStatus::Cancelled)
        }
        () = cancel.cancelled() => false,
    }
}

async fn finalize(shared: &Shared, id: &str, result: JobResult<TranscodeOutcome>) {
    let _control = shared.control.lock().await;
    let Some(job) = shared
        .registry
        .finish(
            id,
            |job| settle(job, result),
            |job| {
                let _ = shared.record(job);
            },
        )
        .await
    else {
        return;
    };

    match job.status {
        JobStatus::Completed => info!(job_id = %job.id, "Job completed"),
        JobStatus::Cancelled => info!(job_id = %job.id, "Job cancelled"),
        _ => warn!(
            job_id = %job.id,
            error = job.error_message.as_deref().unwrap_or_default(),
            "Job failed"
        ),
    }
}

/// Move a job into its terminal state. A cancelled job stays cancelled.
fn settle(job: &mut Job, result: JobResult<TranscodeOutcome>) {
    if job.status == JobStatus::Cancelled {
        return;
    }
    match result {
        Ok(outcome) => {
            if job.status == JobStatus::Paused {
                let _ = job.resume();
            }
            debug!(
                job_id = %job.id,
                lines = outcome.output.lines().count(),
                "Transcoder finished"
            );
            job.append_log(format!("output written to {}", outcome.output_file.display()));
            if let Err(e) = job.complete() {
                warn!(job_id = %job.id, "Could not complete job: {e}");
            }
        }
        Err(JobError::Cancelled) => fail_in_place(job, "execution interrupted"),
        Err(e) => {
            if let Some(output) = e.captured_output() {
                debug!(job_id = %job.id, output, "Transcoder diagnostics");
            }
            fail_in_place(job, &e.to_string());
        }
    }
}

fn fail_in_place(job: &mut Job, message: &str) {
    if job.status == JobStatus::Cancelled {
        return;
    }
    if job.status == JobStatus::Paused {
        let _ = job.resume();
    }
    if let Err(e) = job.fail(message) {
        warn!(job_id = %job.id, "Could not fail job: {e}");
    }
}
