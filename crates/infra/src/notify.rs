//! Failure notifications.
//!
//! When a job instance ends in `Failed`, a [`FailureNotification`] goes to a
//! [`FailureSink`]. It carries the original error (type and message), the
//! reason, and the counters at the time of failure, so operators can tell
//! "ran out of attempts" from "ran out of exception budget" from "deadline
//! passed".

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use jobthrottle_core::{FailureReason, JobAttemptState, JobError, JobId, ThrottleKey};

/// Correlation data for one job instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCorrelation {
    pub job_id: JobId,
    pub job_name: String,
    pub key: Option<ThrottleKey>,
    pub state: JobAttemptState,
}

/// Payload sent to a [`FailureSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotification {
    pub correlation: JobCorrelation,
    /// The error that caused the failure; never a wrapper.
    pub cause: JobError,
    pub reason: FailureReason,
    /// Errors counted in the key's current exception window, when known.
    pub window_exception_count: Option<u64>,
    pub failed_at: DateTime<Utc>,
}

/// Destination for failure notifications (logging, alerting).
pub trait FailureSink: Send + Sync {
    fn notify(&self, notification: &FailureNotification);
}

impl<T: FailureSink + ?Sized> FailureSink for std::sync::Arc<T> {
    fn notify(&self, notification: &FailureNotification) {
        (**self).notify(notification)
    }
}

/// Emits each failure as a structured `error!` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn notify(&self, n: &FailureNotification) {
        let state = &n.correlation.state;
        error!(
            job_id = %n.correlation.job_id,
            job = %n.correlation.job_name,
            key = n.correlation.key.as_ref().map(ThrottleKey::as_str),
            reason = %n.reason,
            error_type = n.cause.type_name(),
            error_message = n.cause.message(),
            attempts = state.attempts,
            max_tries = state.max_tries,
            max_exceptions = state.max_exceptions,
            budget_exceeded_events = state.budget_exceeded_events,
            window_exception_count = n.window_exception_count,
            retry_until = ?state.retry_until,
            "job failed"
        );
    }
}

/// Keeps notifications in memory for tests/inspection.
#[derive(Debug, Default)]
pub struct RecordingFailureSink {
    notifications: Mutex<Vec<FailureNotification>>,
}

impl RecordingFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<FailureNotification> {
        self.notifications
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.notifications.lock().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FailureSink for RecordingFailureSink {
    fn notify(&self, notification: &FailureNotification) {
        // A poisoned sink still records.
        let mut n = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        n.push(notification.clone());
    }
}

/// Fan a notification out to several sinks.
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Box<dyn FailureSink>>,
}

impl FanOutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl FailureSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl FailureSink for FanOutSink {
    fn notify(&self, notification: &FailureNotification) {
        for sink in &self.sinks {
            sink.notify(notification);
        }
    }
}
