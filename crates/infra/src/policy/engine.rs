//! Retry/attempt policy engine.
//!
//! Decides, after every failed attempt, whether the job instance goes back to
//! the queue (and after how long) or fails for good. Precedence on error:
//!
//! 1. unrecoverable errors fail immediately
//! 2. recoverable errors matched by the exception throttle are counted; within
//!    budget they retry with the default delay, over budget with the
//!    throttle's backoff
//! 3. anything else retries with the default delay
//!
//! Independently of the path, the instance fails once its attempts, deadline
//! or exception allowance run out.

use std::sync::Arc;

use tracing::{debug, info, warn};

use jobthrottle_core::{
    Clock, FailureReason, JobAttemptState, JobError, SystemClock, ThrottleDecision, ThrottleKey, Transition,
};

use crate::notify::{FailureNotification, FailureSink, JobCorrelation, TracingFailureSink};
use crate::runtime::JobRuntime;
use crate::store::CounterStore;
use crate::throttle::ExceptionThrottle;

use super::backoff::BackoffPolicy;

pub struct RetryEngine<S> {
    backoff: BackoffPolicy,
    exception_throttle: Option<ExceptionThrottle<S>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn FailureSink>,
}

impl<S> std::fmt::Debug for RetryEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("backoff", &self.backoff)
            .field("exception_throttle", &self.exception_throttle)
            .finish_non_exhaustive()
    }
}

impl<S: CounterStore> RetryEngine<S> {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            exception_throttle: None,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingFailureSink),
        }
    }

    pub fn with_exception_throttle(mut self, throttle: ExceptionThrottle<S>) -> Self {
        self.exception_throttle = Some(throttle);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn exception_throttle(&self) -> Option<&ExceptionThrottle<S>> {
        self.exception_throttle.as_ref()
    }

    /// Check run on a freshly claimed instance, before its body runs.
    ///
    /// Catches instances that were released (e.g. after losing a concurrency
    /// slot) and came back with no attempts or time left.
    pub fn on_claim(&self, state: &JobAttemptState) -> Option<Transition> {
        if state.max_tries != 0 && state.attempts > state.max_tries {
            return Some(Transition::fail(
                JobError::max_attempts_exceeded(format!(
                    "job has been attempted too many times ({} of {})",
                    state.attempts, state.max_tries
                )),
                FailureReason::MaxTriesExceeded,
            ));
        }

        if state.deadline_passed(self.clock.now()) {
            return Some(Transition::fail(
                JobError::max_attempts_exceeded("job retry deadline has passed"),
                FailureReason::DeadlinePassed,
            ));
        }

        None
    }

    /// Decide what happens after an attempt failed with `error`.
    pub fn on_failure(&self, key: Option<&ThrottleKey>, state: &JobAttemptState, error: JobError) -> Transition {
        if error.is_unrecoverable() {
            info!(error = %error, attempts = state.attempts, "unrecoverable error; failing without retry");
            return Transition::fail(error, FailureReason::Unrecoverable);
        }

        let now = self.clock.now();

        let throttled = match (&self.exception_throttle, key) {
            (Some(throttle), Some(key)) if error.is_recoverable() => Some((throttle, key)),
            _ => None,
        };

        if let Some((throttle, key)) = throttled {
            match throttle.should_throttle(key, &error) {
                Ok(ThrottleDecision::PassThrough) => {}
                Ok(ThrottleDecision::WithinBudget { count }) => {
                    if let Some(reason) = state.terminal_reason(now, 0) {
                        return Transition::fail(error, reason);
                    }
                    debug!(key = %key, count, "recoverable error within budget; default retry");
                    return Transition::retry(self.backoff.delay_for_attempt(state.attempts));
                }
                Ok(ThrottleDecision::BudgetExceeded { count, backoff }) => {
                    if let Some(reason) = state.terminal_reason(now, 1) {
                        return Transition::fail(error, reason);
                    }
                    debug!(key = %key, count, backoff_ms = backoff.as_millis() as u64, "retrying after throttle backoff");
                    return Transition::Retrying {
                        delay: backoff,
                        budget_exceeded: true,
                    };
                }
                Err(e) => {
                    // Unknown budget: back off as if exceeded, without
                    // charging the instance's exception allowance.
                    warn!(key = %key, error = %e, "counter store unavailable; assuming exception budget exceeded");
                    if let Some(reason) = state.terminal_reason(now, 0) {
                        return Transition::fail(error, reason);
                    }
                    return Transition::retry(throttle.config().backoff);
                }
            }
        }

        if let Some(reason) = state.terminal_reason(now, 0) {
            return Transition::fail(error, reason);
        }

        Transition::retry(self.backoff.delay_for_attempt(state.attempts))
    }

    /// Hand a decision to the runtime, notifying on terminal failure.
    pub fn apply<R: JobRuntime + ?Sized>(
        &self,
        transition: &Transition,
        runtime: &mut R,
        job_name: &str,
        key: Option<&ThrottleKey>,
    ) {
        match transition {
            Transition::Succeeded => {}
            Transition::Retrying {
                delay,
                budget_exceeded,
            } => {
                if *budget_exceeded {
                    runtime.record_budget_exceeded();
                }
                debug!(
                    job_id = %runtime.job_id(),
                    attempt = runtime.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "releasing job for retry"
                );
                runtime.release(*delay);
            }
            Transition::Failed { cause, reason } => {
                runtime.fail(cause.clone(), *reason);
                self.notify_failure(&*runtime, job_name, key, cause, *reason);
            }
        }
    }

    /// Send a failure notification for an instance that already failed.
    pub fn notify_failure<R: JobRuntime + ?Sized>(
        &self,
        runtime: &R,
        job_name: &str,
        key: Option<&ThrottleKey>,
        cause: &JobError,
        reason: FailureReason,
    ) {
        let window_exception_count = match (&self.exception_throttle, key) {
            (Some(throttle), Some(key)) => throttle.current_count(key).ok(),
            _ => None,
        };

        self.sink.notify(&FailureNotification {
            correlation: JobCorrelation {
                job_id: runtime.job_id(),
                job_name: job_name.to_string(),
                key: key.cloned(),
                state: runtime.attempt_state(),
            },
            cause: cause.clone(),
            reason,
            window_exception_count,
            failed_at: self.clock.now(),
        });
    }
}
