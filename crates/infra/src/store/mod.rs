//! Distributed counter store adapters.
//!
//! The throttles coordinate across worker processes exclusively through a
//! [`CounterStore`]: a lock primitive (conditional set with TTL) and an atomic
//! increment-with-expiry counter. Implementations:
//!
//! - [`InMemoryCounterStore`]: single process, for tests/dev
//! - `RedisCounterStore` (feature `redis`): shared across processes
//!
//! Any [`StoreError`] must be read by callers as "assume throttled", never as
//! "clear to proceed".

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobthrottle_core::HolderId;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCounterStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCounterStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Counter store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or timed out. Transient.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected a command.
    #[error("counter store command failed: {0}")]
    Command(String),
    /// A key holds a value of the wrong kind (lock vs counter).
    #[error("key {0} holds a value of the wrong type")]
    WrongType(String),
    /// Internal lock poisoning (in-process stores).
    #[error("counter store lock poisoned")]
    Poisoned,
    /// The configured backend is not compiled in.
    #[error("unsupported counter store backend: {0}")]
    Unsupported(String),
}

/// A held lock entry (one concurrency slot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    pub key: String,
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    /// The entry disappears at this instant even if never released.
    pub expires_at: DateTime<Utc>,
}

/// Capability interface over the shared store.
///
/// Every operation must be atomic with respect to concurrent callers in any
/// process sharing the store.
pub trait CounterStore: Send + Sync {
    /// Set `key` to `holder` with a TTL if it is absent.
    ///
    /// Returns `None` when the key is already held.
    fn try_acquire_lock(&self, key: &str, holder: HolderId, ttl: Duration) -> StoreResult<Option<LockHandle>>;

    /// Delete the lock if it is still owned by `handle.holder`.
    ///
    /// Returns `false` when the lock had already expired or changed hands.
    fn release_lock(&self, handle: &LockHandle) -> StoreResult<bool>;

    /// Increment the counter at `key`, starting a fixed `window` expiry on the
    /// first increment. Returns the count after incrementing.
    fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64>;

    /// Current counter value (0 when absent or expired).
    fn peek(&self, key: &str) -> StoreResult<u64>;
}

impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    fn try_acquire_lock(&self, key: &str, holder: HolderId, ttl: Duration) -> StoreResult<Option<LockHandle>> {
        (**self).try_acquire_lock(key, holder, ttl)
    }

    fn release_lock(&self, handle: &LockHandle) -> StoreResult<bool> {
        (**self).release_lock(handle)
    }

    fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        (**self).increment_with_expiry(key, window)
    }

    fn peek(&self, key: &str) -> StoreResult<u64> {
        (**self).peek(key)
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
