//! Retry/attempt policy: default delays and the decision engine.

pub mod backoff;
pub mod engine;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use engine::RetryEngine;
