//! The job runtime seen by the throttling core.
//!
//! The runtime owns attempt bookkeeping and re-queueing. The core reads the
//! counters and hands back decisions; it never loops or sleeps on the job's
//! behalf.

use std::time::Duration;

use chrono::{DateTime, Utc};

use jobthrottle_core::{FailureReason, JobAttemptState, JobError, JobId};

pub trait JobRuntime {
    fn job_id(&self) -> JobId;

    /// Attempts started so far, including the current one.
    fn attempts(&self) -> u32;

    fn max_tries(&self) -> u32;

    fn max_exceptions(&self) -> u32;

    fn retry_until(&self) -> Option<DateTime<Utc>>;

    /// Budget-exceeded events applied to this instance so far.
    fn budget_exceeded_events(&self) -> u32;

    /// Give the job back to the queue, runnable again after `delay`.
    fn release(&mut self, delay: Duration);

    /// Count one more budget-exceeded event against this instance.
    fn record_budget_exceeded(&mut self);

    /// Terminal failure with the original cause.
    ///
    /// Job code calling this must stop working on the job afterwards.
    fn fail(&mut self, cause: JobError, reason: FailureReason);

    fn attempt_state(&self) -> JobAttemptState {
        JobAttemptState {
            attempts: self.attempts(),
            max_tries: self.max_tries(),
            max_exceptions: self.max_exceptions(),
            retry_until: self.retry_until(),
            budget_exceeded_events: self.budget_exceeded_events(),
        }
    }
}
