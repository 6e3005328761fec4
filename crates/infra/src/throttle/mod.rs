//! Throttles built on a [`CounterStore`](crate::store::CounterStore).
//!
//! - [`ConcurrencyThrottle`]: at most `allow` concurrent holders per key
//! - [`ExceptionThrottle`]: at most `max_attempts` counted errors per key per
//!   fixed decay window
//!
//! Neither throttle reschedules anything. They report, and the caller (the
//! policy engine or the job itself) turns the report into a decision.

use std::time::Duration;

pub mod concurrency;
pub mod exception;

pub use concurrency::{ConcurrencyConfig, ConcurrencyThrottle, SlotGuard};
pub use exception::{Classifier, ExceptionThrottle, ExceptionThrottleConfig};

/// Convert a (possibly fractional) number of minutes into a duration.
///
/// `minutes(1.0 / 6.0)` is ten seconds. Non-finite or negative input yields
/// zero; values past [`Duration::MAX`] saturate (and fail `validate()`).
pub fn minutes(minutes: f64) -> Duration {
    let secs = minutes * 60.0;
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Longest window or backoff a throttle config accepts (100 years).
pub const MAX_WINDOW: Duration = Duration::from_secs(36_500 * 24 * 60 * 60);
