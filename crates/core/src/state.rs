//! Per-instance attempt state, owned by the job runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::FailureReason;

/// Snapshot of a job instance's attempt bookkeeping.
///
/// The runtime owns and mutates this; throttles and the policy engine only
/// read it. `0` for `max_tries` or `max_exceptions` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptState {
    /// Attempts started so far, including the current one.
    pub attempts: u32,
    pub max_tries: u32,
    /// Budget-exceeded events tolerated before the job fails.
    pub max_exceptions: u32,
    pub retry_until: Option<DateTime<Utc>>,
    /// Budget-exceeded events already applied to this instance.
    pub budget_exceeded_events: u32,
}

impl Default for JobAttemptState {
    fn default() -> Self {
        Self {
            attempts: 0,
            max_tries: 1,
            max_exceptions: 0,
            retry_until: None,
            budget_exceeded_events: 0,
        }
    }
}

impl JobAttemptState {
    pub fn new(attempts: u32, max_tries: u32) -> Self {
        Self {
            attempts,
            max_tries,
            ..Default::default()
        }
    }

    pub fn with_max_exceptions(mut self, max_exceptions: u32) -> Self {
        self.max_exceptions = max_exceptions;
        self
    }

    pub fn with_retry_until(mut self, retry_until: DateTime<Utc>) -> Self {
        self.retry_until = Some(retry_until);
        self
    }

    pub fn with_budget_exceeded_events(mut self, events: u32) -> Self {
        self.budget_exceeded_events = events;
        self
    }

    pub fn tries_exhausted(&self) -> bool {
        self.max_tries != 0 && self.attempts >= self.max_tries
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.retry_until.is_some_and(|until| now > until)
    }

    /// Whether `pending` more budget-exceeded events would use up the
    /// instance's exception allowance.
    pub fn exception_budget_exhausted(&self, pending: u32) -> bool {
        self.max_exceptions != 0
            && self.budget_exceeded_events.saturating_add(pending) >= self.max_exceptions
    }

    /// First terminal condition that holds, if any.
    pub fn terminal_reason(&self, now: DateTime<Utc>, pending_budget_events: u32) -> Option<FailureReason> {
        if self.tries_exhausted() {
            Some(FailureReason::MaxTriesExceeded)
        } else if self.deadline_passed(now) {
            Some(FailureReason::DeadlinePassed)
        } else if self.exception_budget_exhausted(pending_budget_events) {
            Some(FailureReason::ExceptionBudgetExhausted)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn zero_means_unlimited() {
        let state = JobAttemptState::new(1_000, 0);
        assert!(!state.tries_exhausted());
        assert!(!state.exception_budget_exhausted(50));
    }

    #[test]
    fn tries_exhausted_at_limit() {
        assert!(!JobAttemptState::new(2, 3).tries_exhausted());
        assert!(JobAttemptState::new(3, 3).tries_exhausted());
    }

    #[test]
    fn deadline_is_exclusive() {
        let now = Utc::now();
        let state = JobAttemptState::new(1, 5).with_retry_until(now);
        assert!(!state.deadline_passed(now));
        assert!(state.deadline_passed(now + Duration::seconds(1)));
    }

    #[test]
    fn pending_events_count_toward_exception_budget() {
        let state = JobAttemptState::new(1, 10)
            .with_max_exceptions(2)
            .with_budget_exceeded_events(1);
        assert!(!state.exception_budget_exhausted(0));
        assert!(state.exception_budget_exhausted(1));
    }

    #[test]
    fn max_tries_reported_before_deadline() {
        let now = Utc::now();
        let state = JobAttemptState::new(3, 3).with_retry_until(now - Duration::minutes(1));
        assert_eq!(state.terminal_reason(now, 0), Some(FailureReason::MaxTriesExceeded));
    }
}
