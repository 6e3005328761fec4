//! Throttling infrastructure: counter stores, throttles, retry policy and the
//! reference job runtime.

pub mod config;
pub mod jobs;
pub mod notify;
pub mod policy;
pub mod runtime;
pub mod store;
pub mod throttle;
