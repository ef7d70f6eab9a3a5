//! Active-job registry.
//!
//! Holds every Started or Paused job. All mutation of live jobs goes
//! through one lock guarding the map; the lock is only held for the map
//! operation itself.
//!
//! A cancelled job keeps its entry until the owning worker finishes it, but
//! no longer counts as active.

use std::collections::HashMap;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::JobResult;
use crate::models::{Job, JobStatus};

struct Entry {
    job: Job,
    cancel: CancellationToken,
    state: watch::Sender<JobStatus>,
}

/// What the owning worker holds for a registered job.
#[derive(Debug)]
pub struct ActiveHandle {
    /// Fired on cancel and on shutdown.
    pub cancel: CancellationToken,
    /// Tracks status changes made by control operations.
    pub state: watch::Receiver<JobStatus>,
}

#[derive(Default)]
pub struct Registry {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, job: Job) -> ActiveHandle {
        let cancel = CancellationToken::new();
        let (state, rx) = watch::channel(job.status);
        let handle = ActiveHandle {
            cancel: cancel.clone(),
            state: rx,
        };
        self.jobs.lock().await.insert(
            job.id.clone(),
            Entry { job, cancel, state },
        );
        handle
    }

    /// Apply a state-machine operation to a live job.
    ///
    /// Returns `None` when the job is not registered. A status change is
    /// published to the owning worker, and reaching Cancelled fires the
    /// job's cancellation token.
    pub async fn transition<F>(&self, id: &str, f: F) -> Option<JobResult<Job>>
    where
        F: FnOnce(&mut Job) -> JobResult<()>,
    {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(id)?;
        let before = entry.job.status;
        if let Err(e) = f(&mut entry.job) {
            return Some(Err(e));
        }

        let after = entry.job.status;
        if after != before {
            entry.state.send_replace(after);
            if after == JobStatus::Cancelled {
                entry.cancel.cancel();
            }
        }
        Some(Ok(entry.job.clone()))
    }

    /// Deregister a job, applying a last update on the way out.
    ///
    /// `commit` sees the final record before the entry is removed, so a
    /// reader finds the job either here or in its committed form.
    pub async fn finish<F, C>(&self, id: &str, f: F, commit: C) -> Option<Job>
    where
        F: FnOnce(&mut Job),
        C: FnOnce(&Job),
    {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(id)?;
        f(&mut entry.job);
        commit(&entry.job);
        jobs.remove(id).map(|entry| entry.job)
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().await.get(id).map(|e| e.job.clone())
    }

    /// Copy of every Started or Paused job, oldest start first.
    pub async fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|e| e.job.status.is_active())
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// Number of Started or Paused jobs.
    pub async fn len(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|e| e.job.status.is_active())
            .count()
    }

    /// Fire every cancellation token without touching status.
    ///
    /// Workers record the interrupted jobs as failed.
    pub async fn interrupt_all(&self) -> usize {
        let jobs = self.jobs.lock().await;
        for entry in jobs.values() {
            entry.cancel.cancel();
        }
        jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::JobError;
    use crate::models::{new_job_id, JobSpec, Resolution, VideoFormat};

    fn started_job() -> Job {
        let mut job = Job::new(
            new_job_id(),
            JobSpec {
                input_path: PathBuf::from("/in.mov"),
                output_path: PathBuf::from("/out"),
                format: VideoFormat::Mp4,
                resolution: Resolution::Hd720,
            },
            0,
        );
        job.start().unwrap();
        job
    }

    #[tokio::test]
    async fn test_cancel_fires_token() {
        let registry = Registry::new();
        let job = started_job();
        let handle = registry.register(job.clone()).await;

        let cancelled = registry.transition(&job.id, Job::cancel).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(handle.cancel.is_cancelled());
        assert_eq!(*handle.state.borrow(), JobStatus::Cancelled);

        // Second cancel is rejected and leaves the record alone
        let err = registry.transition(&job.id, Job::cancel).await.unwrap().unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        assert_eq!(registry.get(&job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_active() {
        let registry = Registry::new();
        let running = started_job();
        let cancelled = started_job();
        let _a = registry.register(running.clone()).await;
        let _b = registry.register(cancelled.clone()).await;

        registry.transition(&cancelled.id, Job::cancel).await.unwrap().unwrap();

        let active: Vec<String> = registry.snapshot().await.into_iter().map(|j| j.id).collect();
        assert_eq!(active, vec![running.id.clone()]);
        assert_eq!(registry.len().await, 1);
        // Still reachable until the worker lets go of it
        assert_eq!(
            registry.get(&cancelled.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_pause_notifies_worker() {
        let registry = Registry::new();
        let job = started_job();
        let mut handle = registry.register(job.clone()).await;

        registry.transition(&job.id, Job::pause).await.unwrap().unwrap();
        assert!(handle.state.has_changed().unwrap());
        assert_eq!(*handle.state.borrow_and_update(), JobStatus::Paused);
        assert!(!handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let registry = Registry::new();
        assert!(registry.transition("nope", Job::pause).await.is_none());
        assert!(registry.finish("nope", |_| {}, |_| {}).await.is_none());
    }

    #[tokio::test]
    async fn test_finish_removes_entry() {
        let registry = Registry::new();
        let job = started_job();
        let _handle = registry.register(job.clone()).await;
        assert_eq!(registry.len().await, 1);

        let mut committed = None;
        let done = registry
            .finish(
                &job.id,
                |j| {
                    j.complete().unwrap();
                },
                |j| committed = Some(j.status),
            )
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(committed, Some(JobStatus::Completed));
        assert_eq!(registry.len().await, 0);
        assert!(registry.get(&job.id).await.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_all_keeps_status() {
        let registry = Registry::new();
        let a = started_job();
        let b = started_job();
        let ha = registry.register(a.clone()).await;
        let hb = registry.register(b.clone()).await;

        assert_eq!(registry.interrupt_all().await, 2);
        assert!(ha.cancel.is_cancelled() && hb.cancel.is_cancelled());
        assert_eq!(registry.get(&a.id).await.unwrap().status, JobStatus::Started);
    }
}
