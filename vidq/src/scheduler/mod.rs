//! Job scheduling and lifecycle engine.
//!
//! A [`Scheduler`] owns the bounded queue, the active-job registry, a handle
//! to durable storage and the transcoder. It is cheap to clone and is passed
//! to every caller; there is no global state.
//!
//! Lookups go queue, then registry, then store. A job moves from the queue
//! to the registry atomically, so a live job is always found in one of them.
//!
//! Control operations and the worker's start and finish records are
//! serialized on one lock, so a decision made from the store cannot race a
//! worker writing the same job.

mod pool;
mod queue;
mod registry;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::JobStore;
use crate::error::{JobError, JobResult};
use crate::models::{new_job_id, Job, JobNotification, JobSpec, JobStatus, LogLine, TranscodeRequest};
use crate::transcoder::Transcoder;

use queue::{JobQueue, Slot};
use registry::Registry;

pub use pool::WorkerPool;
pub use queue::EnqueuePolicy;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Maximum number of waiting jobs.
    pub queue_capacity: usize,
    /// Behaviour of `submit` and `retry` on a full queue.
    pub policy: EnqueuePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 100,
            policy: EnqueuePolicy::Reject,
        }
    }
}

/// Broadcast on every status or progress change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            priority: job.priority,
            error_message: job.error_message.clone(),
            at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_jobs: usize,
}

/// Outcome of [`Scheduler::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
}

pub(crate) struct Shared {
    control: Mutex<()>,
    queue: JobQueue,
    registry: Registry,
    store: Arc<dyn JobStore>,
    transcoder: Arc<dyn Transcoder>,
    events: broadcast::Sender<JobEvent>,
    config: SchedulerConfig,
}

impl Shared {
    fn persist(&self, job: &Job) -> JobResult<()> {
        self.store
            .upsert(job)
            .inspect_err(|e| warn!(job_id = %job.id, "Failed to persist job: {e}"))
    }

    fn publish(&self, job: &Job) {
        // No subscribers is fine
        let _ = self.events.send(JobEvent::from(job));
    }

    /// Publish, then persist. In-memory state is never rolled back.
    fn record(&self, job: &Job) -> JobResult<()> {
        self.publish(job);
        self.persist(job)
    }
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(()),
                queue: JobQueue::new(config.queue_capacity),
                registry: Registry::new(),
                store,
                transcoder,
                events,
                config,
            }),
        }
    }

    /// Spawn the configured number of workers.
    pub fn start(&self) -> WorkerPool {
        WorkerPool::spawn(Arc::clone(&self.shared), self.shared.config.workers)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn transcoder_name(&self) -> &str {
        self.shared.transcoder.name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Validate a request and queue it as a new job.
    pub async fn submit(&self, request: TranscodeRequest) -> JobResult<Job> {
        let spec = request.to_spec()?;
        self.submit_spec(spec, request.priority.unwrap_or(0)).await
    }

    pub async fn submit_spec(&self, spec: JobSpec, priority: i32) -> JobResult<Job> {
        spec.validate()?;
        let job = self
            .admit(Job::new(new_job_id(), spec, priority), self.shared.config.policy)
            .await?;
        info!(
            job_id = %job.id,
            priority,
            format = %job.spec.format,
            resolution = %job.spec.resolution,
            "Job submitted"
        );
        Ok(job)
    }

    /// The single bounded entry point: reserve a slot, persist, then push.
    async fn admit(&self, job: Job, policy: EnqueuePolicy) -> JobResult<Job> {
        let slot = self.shared.queue.reserve(policy).await?;
        self.place(slot, job).await
    }

    async fn place(&self, slot: Slot<'_>, job: Job) -> JobResult<Job> {
        self.shared.persist(&job)?;
        self.shared.queue.push(slot, job.clone()).await;
        self.shared.publish(&job);
        Ok(job)
    }

    pub async fn status(&self, id: &str) -> JobResult<Job> {
        if let Some(job) = self.live(id).await {
            return Ok(job);
        }
        self.stored(id)
    }

    pub async fn logs(&self, id: &str) -> JobResult<Vec<LogLine>> {
        Ok(self.status(id).await?.logs)
    }

    /// Snapshot of every Started or Paused job.
    pub async fn list_active(&self) -> Vec<Job> {
        self.shared.registry.snapshot().await
    }

    /// Waiting jobs in service order.
    pub async fn list_queued(&self) -> Vec<Job> {
        self.shared.queue.snapshot().await
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.shared.config.workers,
            queue_depth: self.shared.queue.len().await,
            queue_capacity: self.shared.queue.capacity(),
            active_jobs: self.shared.registry.len().await,
        }
    }

    /// Cancel a queued, running or paused job.
    ///
    /// The status is Cancelled when this returns; the external process is
    /// stopped asynchronously.
    pub async fn cancel(&self, id: &str) -> JobResult<Job> {
        let _control = self.shared.control.lock().await;
        let job = if let Some(mut job) = self.shared.queue.remove(id).await {
            job.cancel()?;
            job
        } else if let Some(result) = self.shared.registry.transition(id, Job::cancel).await {
            result?
        } else {
            let mut job = self.stored(id)?;
            job.cancel()?;
            job
        };

        info!(job_id = %job.id, "Job cancelled");
        self.shared.record(&job)?;
        Ok(job)
    }

    pub async fn pause(&self, id: &str) -> JobResult<Job> {
        let _control = self.shared.control.lock().await;
        match self.shared.registry.transition(id, Job::pause).await {
            Some(result) => {
                let job = result?;
                info!(job_id = %job.id, "Job paused");
                self.shared.record(&job)?;
                Ok(job)
            }
            None => Err(self.not_active(id, "pause").await),
        }
    }

    pub async fn resume(&self, id: &str) -> JobResult<Job> {
        let _control = self.shared.control.lock().await;
        match self.shared.registry.transition(id, Job::resume).await {
            Some(result) => {
                let job = result?;
                info!(job_id = %job.id, "Job resumed");
                self.shared.record(&job)?;
                Ok(job)
            }
            None => Err(self.not_active(id, "resume").await),
        }
    }

    /// Requeue a failed job under the same ID.
    ///
    /// The job is re-validated and enters behind every waiting job of the
    /// same priority.
    pub async fn retry(&self, id: &str) -> JobResult<Job> {
        if let Some(job) = self.live(id).await {
            return Err(JobError::invalid_state(id, job.status, "retry"));
        }
        let slot = self.shared.queue.reserve(self.shared.config.policy).await?;

        let _control = self.shared.control.lock().await;
        if let Some(job) = self.live(id).await {
            return Err(JobError::invalid_state(id, job.status, "retry"));
        }
        let mut job = self.stored(id)?;
        job.reset_for_retry()?;
        job.spec.validate()?;
        job.append_log(format!("retry requested (attempt {})", job.attempts + 1));

        let job = self.place(slot, job).await?;
        info!(job_id = %job.id, "Job requeued for retry");
        Ok(job)
    }

    /// Retry every failed job, one at a time. Returns how many were requeued.
    pub async fn retry_failed(&self) -> JobResult<usize> {
        let mut requeued = 0;
        for job in self.shared.store.list_by_status(JobStatus::Failed)? {
            match self.retry(&job.id).await {
                Ok(_) => requeued += 1,
                Err(e @ (JobError::QueueFull { .. } | JobError::ShuttingDown)) => {
                    warn!("Stopping batch retry: {e}");
                    break;
                }
                Err(e) => warn!(job_id = %job.id, "Skipping failed job: {e}"),
            }
        }
        info!(requeued, "Batch retry finished");
        Ok(requeued)
    }

    /// Change the priority of a job that is not finished.
    ///
    /// A waiting job is reordered immediately. A running job only keeps the
    /// new value for a later retry.
    pub async fn set_priority(&self, id: &str, priority: i32) -> JobResult<Job> {
        let _control = self.shared.control.lock().await;
        let set = |job: &mut Job| job.set_priority(priority);
        let job = if let Some(result) = self.shared.queue.modify(id, set).await {
            result?
        } else if let Some(result) = self.shared.registry.transition(id, set).await {
            result?
        } else {
            let mut job = self.stored(id)?;
            job.set_priority(priority)?;
            job
        };

        info!(job_id = %job.id, priority, "Job priority changed");
        self.shared.record(&job)?;
        Ok(job)
    }

    /// Append an externally supplied line to a job's log.
    pub async fn append_log(&self, id: &str, line: &str) -> JobResult<Job> {
        let _control = self.shared.control.lock().await;
        let append = |job: &mut Job| {
            job.append_log(line);
            Ok(())
        };
        let job = if let Some(result) = self.shared.queue.modify(id, append).await {
            result?
        } else if let Some(result) = self.shared.registry.transition(id, append).await {
            result?
        } else {
            let mut job = self.stored(id)?;
            job.append_log(line);
            job
        };
        self.shared.persist(&job)?;
        Ok(job)
    }

    /// Apply an externally triggered update.
    ///
    /// Unsupported target statuses are rejected before anything changes.
    pub async fn apply_notification(&self, notification: JobNotification) -> JobResult<Job> {
        let id = notification.job_id.trim();
        if id.is_empty() {
            return Err(JobError::validation("job_id cannot be empty"));
        }

        if let Some(status) = notification.status {
            if !matches!(
                status,
                JobStatus::Cancelled | JobStatus::Paused | JobStatus::Started
            ) {
                let current = self.status(id).await?;
                return Err(JobError::invalid_state(
                    id,
                    current.status,
                    "apply webhook status to",
                ));
            }
        }

        if let Some(message) = notification.message.as_deref() {
            self.append_log(id, message).await?;
        }

        if let Some(percent) = notification.progress {
            let advance = |job: &mut Job| job.advance_progress(percent).map(|_| ());
            match self.shared.registry.transition(id, advance).await {
                Some(result) => self.shared.publish(&result?),
                None => return Err(self.not_active(id, "update progress of").await),
            }
        }

        match notification.status {
            Some(JobStatus::Cancelled) => self.cancel(id).await,
            Some(JobStatus::Paused) => self.pause(id).await,
            Some(JobStatus::Started) => self.resume(id).await,
            _ => self.status(id).await,
        }
    }

    /// Reconcile durable state after a restart.
    ///
    /// Jobs left running are marked failed; jobs left waiting are queued
    /// again, waiting for room if the queue is full.
    pub async fn recover(&self) -> JobResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for status in [JobStatus::Started, JobStatus::Paused] {
            for listed in self.shared.store.list_by_status(status)? {
                let _control = self.shared.control.lock().await;
                if self.live(&listed.id).await.is_some() {
                    continue;
                }
                // Re-read: the listing may predate a worker's final record
                let Some(mut job) = self
                    .shared
                    .store
                    .get(&listed.id)?
                    .filter(|job| job.status.is_active())
                else {
                    continue;
                };
                if job.status == JobStatus::Paused {
                    job.resume()?;
                }
                job.fail("interrupted by service restart")?;
                self.shared.record(&job)?;
                report.interrupted += 1;
            }
        }

        for listed in self.shared.store.list_by_status(JobStatus::Queued)? {
            if self.live(&listed.id).await.is_some() {
                continue;
            }
            let slot = self.shared.queue.reserve(EnqueuePolicy::Block).await?;

            let _control = self.shared.control.lock().await;
            if self.live(&listed.id).await.is_some() {
                continue;
            }
            let Some(job) = self
                .shared
                .store
                .get(&listed.id)?
                .filter(|job| job.status == JobStatus::Queued)
            else {
                continue;
            };
            self.shared.queue.push(slot, job.clone()).await;
            self.shared.publish(&job);
            report.requeued += 1;
        }

        info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Recovered persisted jobs"
        );
        Ok(report)
    }

    /// Delete completed jobs older than `retention`.
    pub fn purge_completed(&self, retention: chrono::Duration) -> JobResult<usize> {
        let purged = self
            .shared
            .store
            .purge_completed_before(Utc::now() - retention)?;
        if purged > 0 {
            info!(purged, "Purged completed jobs");
        }
        Ok(purged)
    }

    /// Run `purge_completed` every `every` until the handle is aborted.
    pub fn spawn_maintenance(&self, every: Duration, retention: chrono::Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.purge_completed(retention) {
                    warn!("Maintenance purge failed: {e}");
                }
            }
        })
    }

    async fn live(&self, id: &str) -> Option<Job> {
        if let Some(job) = self.shared.queue.get(id).await {
            return Some(job);
        }
        self.shared.registry.get(id).await
    }

    fn stored(&self, id: &str) -> JobResult<Job> {
        self.shared
            .store
            .get(id)?
            .ok_or_else(|| JobError::not_found(id))
    }

    /// Error for a registry-only operation on a job that is not running.
    async fn not_active(&self, id: &str, action: &'static str) -> JobError {
        if let Some(job) = self.shared.queue.get(id).await {
            return JobError::invalid_state(id, job.status, action);
        }
        match self.stored(id) {
            Ok(job) => JobError::invalid_state(id, job.status, action),
            Err(e) => e,
        }
    }
}
