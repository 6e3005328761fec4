//! Decisions handed from the throttles and the policy engine to the runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::JobError;

/// Outcome of counting one error against an exception-rate throttle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleDecision {
    /// The error does not match the throttle's predicate; not counted.
    PassThrough,
    /// Counted; still inside the window's budget.
    WithinBudget { count: u64 },
    /// Counted and over budget; retry no sooner than `backoff`.
    BudgetExceeded { count: u64, backoff: Duration },
}

impl ThrottleDecision {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, ThrottleDecision::BudgetExceeded { .. })
    }

    /// Window count after this error, when it was counted.
    pub fn count(&self) -> Option<u64> {
        match self {
            ThrottleDecision::PassThrough => None,
            ThrottleDecision::WithinBudget { count } | ThrottleDecision::BudgetExceeded { count, .. } => {
                Some(*count)
            }
        }
    }
}

/// Why a job instance ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The error was marked unrecoverable.
    Unrecoverable,
    /// `attempts >= max_tries`.
    MaxTriesExceeded,
    /// The `retry_until` deadline passed.
    DeadlinePassed,
    /// Budget-exceeded events reached `max_exceptions`.
    ExceptionBudgetExhausted,
    /// The job called `fail` itself.
    FailedByJob,
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FailureReason::Unrecoverable => "unrecoverable error",
            FailureReason::MaxTriesExceeded => "ran out of attempts",
            FailureReason::DeadlinePassed => "retry deadline passed",
            FailureReason::ExceptionBudgetExhausted => "ran out of exception budget",
            FailureReason::FailedByJob => "failed by job",
        };
        f.write_str(s)
    }
}

/// State-machine transition for one job attempt.
///
/// `Running -> {Retrying, Failed, Succeeded}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Succeeded,
    /// Give the job back to the runtime, to run again after `delay`.
    Retrying {
        delay: Duration,
        /// The delay comes from an exceeded exception budget.
        budget_exceeded: bool,
    },
    /// Terminal. `cause` is the original error, never a wrapper.
    Failed { cause: JobError, reason: FailureReason },
}

impl Transition {
    pub fn retry(delay: Duration) -> Self {
        Transition::Retrying {
            delay,
            budget_exceeded: false,
        }
    }

    pub fn fail(cause: JobError, reason: FailureReason) -> Self {
        Transition::Failed { cause, reason }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Transition::Retrying { .. })
    }
}
