//! `jobthrottle-core`: throttling domain primitives.
//!
//! This crate contains **pure** building blocks (no store or runtime IO):
//! identifiers, throttle keys, job attempt state, the job error model and the
//! decisions the throttles and policy engine hand back to a job runtime.

pub mod decision;
pub mod error;
pub mod failure;
pub mod id;
pub mod key;
pub mod state;
pub mod time;

pub use decision::{FailureReason, ThrottleDecision, Transition};
pub use error::{ConfigError, ConfigResult};
pub use failure::{JobError, Recoverability};
pub use id::{HolderId, JobId};
pub use key::ThrottleKey;
pub use state::JobAttemptState;
pub use time::{Clock, ManualClock, SystemClock};
