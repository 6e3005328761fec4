//! Reference job runtime: a queue, a worker pool and the glue that runs each
//! attempt through the throttles and the retry engine.
//!
//! ## Components
//!
//! - `Job`: one queued instance, stable id across attempts
//! - `JobStore`: queue plus failed-jobs list (in-memory)
//! - `JobDefinition`: handler, retry engine and optional concurrency limit
//! - `JobExecutor`: claims ready jobs and persists each decision

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorError, ExecutorStats, JobContext, JobDefinition, JobExecutor, JobExecutorConfig, JobExecutorHandle,
    JobHandler,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{FailedJob, Job, JobAttemptRecord, JobStatus};
