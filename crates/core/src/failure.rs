//! Job error model.
//!
//! Handlers report failures as [`JobError`]. The error keeps the original type
//! name and message so a failure notification can show what actually went
//! wrong, and carries a [`Recoverability`] mark the policy engine uses to pick
//! between retrying and failing for good.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failure may ever be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    /// Transient (e.g. 429 Too Many Requests); retry after a delay.
    Recoverable,
    /// Never retry; fail the job immediately.
    Unrecoverable,
    /// Not classified by the job; default retry policy applies.
    Unmarked,
}

/// A failure raised by a job body.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{type_name}: {message}")]
pub struct JobError {
    type_name: String,
    message: String,
    recoverability: Recoverability,
}

/// Type name used for failures synthesized by the runtime when a job is
/// picked up with no attempts (or time) left.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "MaxAttemptsExceeded";

impl JobError {
    /// An unmarked failure.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            recoverability: Recoverability::Unmarked,
        }
    }

    pub fn recoverable(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_name, message).with_recoverability(Recoverability::Recoverable)
    }

    pub fn unrecoverable(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_name, message).with_recoverability(Recoverability::Unrecoverable)
    }

    /// Capture any std error, keeping its concrete type name.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }

    /// Failure recorded when a job is claimed after its attempts ran out.
    pub fn max_attempts_exceeded(message: impl Into<String>) -> Self {
        Self::unrecoverable(MAX_ATTEMPTS_EXCEEDED, message)
    }

    pub fn with_recoverability(mut self, recoverability: Recoverability) -> Self {
        self.recoverability = recoverability;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn recoverability(&self) -> Recoverability {
        self.recoverability
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverability == Recoverability::Recoverable
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.recoverability == Recoverability::Unrecoverable
    }
}

fn short_type_name<E>() -> String {
    let full = std::any::type_name::<E>();
    // Keep generics intact, strip the module path of the outer type.
    let outer = full.split('<').next().unwrap_or(full);
    let start = outer.rfind("::").map(|i| i + 2).unwrap_or(0);
    full[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("too many requests")]
    struct RateLimited;

    #[test]
    fn from_error_keeps_type_and_message() {
        let err = JobError::from_error(&RateLimited);
        assert_eq!(err.type_name(), "RateLimited");
        assert_eq!(err.message(), "too many requests");
        assert_eq!(err.recoverability(), Recoverability::Unmarked);
    }

    #[test]
    fn marks_recoverability() {
        assert!(JobError::recoverable("Throttleable", "Recoverable error").is_recoverable());
        assert!(JobError::unrecoverable("Throttleable", "no retries").is_unrecoverable());
        assert!(JobError::max_attempts_exceeded("job has been attempted too many times").is_unrecoverable());
    }

    #[test]
    fn display_includes_type_name() {
        let err = JobError::new("Timeout", "upstream took too long");
        assert_eq!(err.to_string(), "Timeout: upstream took too long");
    }
}
