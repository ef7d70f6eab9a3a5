//! Bounded, priority-ordered ready list.
//!
//! Capacity is enforced with a slot semaphore; waiting workers park on an
//! item semaphore. Entries are served by priority (highest first), then by
//! enqueue order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit, TryAcquireError};
use tracing::warn;

use super::registry::{ActiveHandle, Registry};
use crate::error::{JobError, JobResult};
use crate::models::Job;

/// What `reserve` does when every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueuePolicy {
    /// Wait for a worker to free a slot.
    Block,
    /// Fail with `QueueFull` immediately.
    #[default]
    Reject,
}

impl EnqueuePolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for EnqueuePolicy {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(JobError::config(format!(
                "unknown enqueue policy '{other}' (expected block or reject)"
            ))),
        }
    }
}

struct Entry {
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct ReadyList {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl ReadyList {
    /// Apply `f` to every entry through a rebuilt heap.
    fn rebuild<T>(&mut self, f: impl FnOnce(&mut Vec<Entry>) -> T) -> T {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let out = f(&mut entries);
        self.heap = BinaryHeap::from(entries);
        out
    }
}

/// A reserved queue slot. Dropping it without pushing releases the slot.
pub struct Slot<'a>(SemaphorePermit<'a>);

pub struct JobQueue {
    ready: Mutex<ReadyList>,
    slots: Semaphore,
    items: Semaphore,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: Mutex::new(ReadyList::default()),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim room for one job.
    pub async fn reserve(&self, policy: EnqueuePolicy) -> JobResult<Slot<'_>> {
        let permit = match policy {
            EnqueuePolicy::Block => self
                .slots
                .acquire()
                .await
                .map_err(|_| JobError::ShuttingDown)?,
            EnqueuePolicy::Reject => self.slots.try_acquire().map_err(|e| match e {
                TryAcquireError::NoPermits => JobError::QueueFull {
                    capacity: self.capacity,
                },
                TryAcquireError::Closed => JobError::ShuttingDown,
            })?,
        };
        Ok(Slot(permit))
    }

    /// Place a job into a reserved slot.
    pub async fn push(&self, slot: Slot<'_>, job: Job) {
        slot.0.forget();
        {
            let mut ready = self.ready.lock().await;
            let seq = ready.next_seq;
            ready.next_seq += 1;
            ready.heap.push(Entry { seq, job });
        }
        self.items.add_permits(1);
    }

    /// Reserve and push in one step.
    #[cfg(test)]
    pub async fn enqueue(&self, job: Job, policy: EnqueuePolicy) -> JobResult<()> {
        let slot = self.reserve(policy).await?;
        self.push(slot, job).await;
        Ok(())
    }

    /// Wait for the best ready job, mark it Started and register it.
    ///
    /// The hand-off happens under the queue lock, so a job is always
    /// visible in exactly one of the queue or the registry. Returns `None`
    /// once the queue is closed.
    pub async fn dequeue_into(&self, registry: &Registry) -> Option<(Job, ActiveHandle)> {
        loop {
            // Removals leave surplus item permits behind; an empty pop just
            // waits again.
            self.items.acquire().await.ok()?.forget();

            let mut ready = self.ready.lock().await;
            let Some(entry) = ready.heap.pop() else {
                continue;
            };
            self.slots.add_permits(1);

            let mut job = entry.job;
            if let Err(e) = job.start() {
                warn!(job_id = %job.id, "Dropping unstartable queue entry: {e}");
                continue;
            }
            let handle = registry.register(job.clone()).await;
            drop(ready);
            return Some((job, handle));
        }
    }

    /// Take a waiting job out of the queue.
    pub async fn remove(&self, id: &str) -> Option<Job> {
        let removed = self.ready.lock().await.rebuild(|entries| {
            let idx = entries.iter().position(|e| e.job.id == id)?;
            Some(entries.swap_remove(idx).job)
        });
        if removed.is_some() {
            self.slots.add_permits(1);
        }
        removed
    }

    /// Mutate a waiting job in place. Ordering reflects the change at once.
    pub async fn modify<F>(&self, id: &str, f: F) -> Option<JobResult<Job>>
    where
        F: FnOnce(&mut Job) -> JobResult<()>,
    {
        self.ready.lock().await.rebuild(|entries| {
            let entry = entries.iter_mut().find(|e| e.job.id == id)?;
            Some(f(&mut entry.job).map(|()| entry.job.clone()))
        })
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.ready
            .lock()
            .await
            .heap
            .iter()
            .find(|e| e.job.id == id)
            .map(|e| e.job.clone())
    }

    /// Waiting jobs in service order.
    pub async fn snapshot(&self) -> Vec<Job> {
        let ready = self.ready.lock().await;
        let mut entries: Vec<&Entry> = ready.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.ready.lock().await.heap.len()
    }

    /// Stop accepting work and wake every waiting worker.
    pub fn close(&self) {
        self.slots.close();
        self.items.close();
    }
}
