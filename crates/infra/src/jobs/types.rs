//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobthrottle_core::{FailureReason, JobAttemptState, JobError, JobId};

use crate::store::to_chrono;

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Given back to the queue; runnable again after `delay`
    Released { delay: Duration },
    /// Completed successfully
    Completed,
    /// Terminal failure, kept with its original cause
    Failed { error: JobError, reason: FailureReason },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    /// Can be claimed by a worker (once ready).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Released { .. })
    }
}

/// A queued job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, stable across attempts
    pub id: JobId,
    /// Name of the job definition that runs it
    pub name: String,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Attempts started so far
    pub attempts: u32,
    /// 0 = unlimited
    pub max_tries: u32,
    /// Budget-exceeded events tolerated (0 = unlimited)
    pub max_exceptions: u32,
    /// No retries after this instant
    pub retry_until: Option<DateTime<Utc>>,
    pub budget_exceeded_events: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job may next run (delayed dispatch or release)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// One record per finished attempt
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
    pub duration_ms: u64,
}

impl Job {
    /// Create a new job with a single try and no deadline.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_tries: 1,
            max_exceptions: 0,
            retry_until: None,
            budget_exceeded_events: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_max_exceptions(mut self, max_exceptions: u32) -> Self {
        self.max_exceptions = max_exceptions;
        self
    }

    pub fn with_retry_until(mut self, at: DateTime<Utc>) -> Self {
        self.retry_until = Some(at);
        self
    }

    /// Stamp the enqueue time (queue order follows it).
    pub fn enqueued_at(mut self, now: DateTime<Utc>) -> Self {
        self.created_at = now;
        self.updated_at = now;
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// When the job became (or becomes) runnable.
    pub fn available_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    /// Check if the job is ready to execute.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at.is_none_or(|at| now >= at)
    }

    pub fn attempt_state(&self) -> JobAttemptState {
        JobAttemptState {
            attempts: self.attempts,
            max_tries: self.max_tries,
            max_exceptions: self.max_exceptions,
            retry_until: self.retry_until,
            budget_exceeded_events: self.budget_exceeded_events,
        }
    }

    /// Mark job as running (starts a new attempt).
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.scheduled_at = None;
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.finish(JobStatus::Completed, started_at, now);
    }

    /// Put the job back in the queue after `delay`.
    pub fn mark_released(&mut self, delay: Duration, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.scheduled_at = Some(now + to_chrono(delay));
        self.finish(JobStatus::Released { delay }, started_at, now);
    }

    /// Mark job as failed for good.
    pub fn mark_failed(
        &mut self,
        error: JobError,
        reason: FailureReason,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.scheduled_at = None;
        self.finish(JobStatus::Failed { error, reason }, started_at, now);
    }

    pub fn record_budget_exceeded(&mut self) {
        self.budget_exceeded_events = self.budget_exceeded_events.saturating_add(1);
    }

    fn finish(&mut self, status: JobStatus, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = status.clone();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            status,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Entry in the failed-jobs list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: Job,
    pub failed_at: DateTime<Utc>,
    pub error: JobError,
    pub reason: FailureReason,
}
