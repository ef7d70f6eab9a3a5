//! In-process job store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::JobStore;
use crate::error::{JobError, JobResult};
use crate::models::{Job, JobStatus};

/// Keeps records in a map. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> JobResult<MutexGuard<'_, HashMap<String, Job>>> {
        self.jobs
            .lock()
            .map_err(|_| JobError::persistence("memory store lock poisoned"))
    }
}

impl JobStore for MemoryStore {
    fn upsert(&self, job: &Job) -> JobResult<()> {
        self.jobs()?.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> JobResult<Option<Job>> {
        Ok(self.jobs()?.get(id).cloned())
    }

    fn delete(&self, id: &str) -> JobResult<bool> {
        Ok(self.jobs()?.remove(id).is_some())
    }

    fn list_by_status(&self, status: JobStatus) -> JobResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs()?
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> JobResult<usize> {
        let mut jobs = self.jobs()?;
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.status != JobStatus::Completed || job.updated_at >= cutoff
        });
        Ok(before - jobs.len())
    }

    fn reset_failed_to_queued(&self) -> JobResult<usize> {
        let mut count = 0;
        for job in self.jobs()?.values_mut() {
            if job.reset_for_retry().is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Duration;

    use super::*;
    use crate::models::{new_job_id, JobSpec, Resolution, VideoFormat};

    fn job() -> Job {
        Job::new(
            new_job_id(),
            JobSpec {
                input_path: PathBuf::from("/in.mp4"),
                output_path: PathBuf::from("/out"),
                format: VideoFormat::Avi,
                resolution: Resolution::Sd480,
            },
            0,
        )
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryStore::new();
        let mut a = job();
        store.upsert(&a).unwrap();
        assert_eq!(store.list_by_status(JobStatus::Queued).unwrap().len(), 1);

        a.start().unwrap();
        a.fail("boom").unwrap();
        store.upsert(&a).unwrap();
        assert_eq!(store.reset_failed_to_queued().unwrap(), 1);
        assert_eq!(
            store.get(&a.id).unwrap().unwrap().status,
            JobStatus::Queued
        );

        assert!(store.delete(&a.id).unwrap());
        assert!(store.get(&a.id).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_purge() {
        let store = MemoryStore::new();
        let mut old = job();
        old.start().unwrap();
        old.complete().unwrap();
        old.updated_at = Utc::now() - Duration::days(30);
        store.upsert(&old).unwrap();
        store.upsert(&job()).unwrap();

        let purged = store
            .purge_completed_before(Utc::now() - Duration::days(7))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(&old.id).unwrap().is_none());
    }
}
