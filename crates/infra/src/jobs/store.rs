//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use jobthrottle_core::JobId;

use super::types::{FailedJob, Job, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a queued (non-failed) job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the job that has been available longest at `now`, starting a
    /// new attempt.
    /// Returns None if no jobs are available.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Move a terminally failed job to the failed-jobs list.
    fn fail(&self, job: Job, failed_at: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// List failed jobs, oldest failure first.
    fn list_failed(&self, limit: usize) -> Result<Vec<FailedJob>, JobStoreError>;

    /// Move a failed job back to pending with fresh counters.
    fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Delete a failed job.
    fn delete_failed(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Drop completed jobs last updated before `older_than`. Returns how many
    /// were removed.
    fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} has not failed")]
    NotFailed(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub released: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    /// Jobs that may still run.
    pub fn outstanding(&self) -> usize {
        self.pending + self.running + self.released
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    failed: RwLock<HashMap<JobId, FailedJob>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, JobStoreError> {
    lock.read()
        .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, JobStoreError> {
    lock.write()
        .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = write(&self.jobs)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(read(&self.jobs)?.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = write(&self.jobs)?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = write(&self.jobs)?;

        // Longest-waiting ready job first; released jobs queue behind
        // everything that became available before them.
        let next = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| j.available_at())
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running(now);
                job.clone()
            })
        }))
    }

    fn fail(&self, job: Job, failed_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let (error, reason) = match &job.status {
            JobStatus::Failed { error, reason } => (error.clone(), *reason),
            _ => return Err(JobStoreError::NotFailed(job.id)),
        };

        let mut jobs = write(&self.jobs)?;
        let mut failed = write(&self.failed)?;

        jobs.remove(&job.id);
        failed.insert(
            job.id,
            FailedJob {
                job,
                failed_at,
                error,
                reason,
            },
        );

        Ok(())
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<FailedJob>, JobStoreError> {
        let mut result: Vec<_> = read(&self.failed)?.values().cloned().collect();
        result.sort_by_key(|e| e.failed_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = write(&self.jobs)?;
        let mut failed = write(&self.failed)?;

        let entry = failed.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.budget_exceeded_events = 0;
        job.scheduled_at = None;
        job.updated_at = now;
        job.history.clear();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_failed(&self, job_id: JobId) -> Result<(), JobStoreError> {
        write(&self.failed)?
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut jobs = write(&self.jobs)?;
        let before = jobs.len();
        jobs.retain(|_, job| !(matches!(job.status, JobStatus::Completed) && job.updated_at < older_than));
        Ok(before - jobs.len())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = read(&self.jobs)?;
        let failed = read(&self.failed)?;

        let mut stats = JobStats {
            failed: failed.len(),
            ..JobStats::default()
        };

        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Released { .. } => stats.released += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn fail(&self, job: Job, failed_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).fail(job, failed_at)
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<FailedJob>, JobStoreError> {
        (**self).list_failed(limit)
    }

    fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).retry_failed(job_id, now)
    }

    fn delete_failed(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_failed(job_id)
    }

    fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).purge_completed(older_than)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
