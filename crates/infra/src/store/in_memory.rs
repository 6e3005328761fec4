//! In-memory counter store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use jobthrottle_core::{Clock, HolderId, SystemClock};

use super::{CounterStore, LockHandle, StoreError, StoreResult, to_chrono};

#[derive(Debug, Clone)]
enum Value {
    Lock { holder: HolderId },
    Counter(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// Process-local store with the same semantics as the Redis adapter.
///
/// - One mutex guards all keys, so every operation is atomic
/// - Expired entries behave as absent and are purged lazily
/// - Time comes from an injected [`Clock`]
/// - Can simulate an outage via [`InMemoryCounterStore::set_available`]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl std::fmt::Debug for InMemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCounterStore")
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggle simulated reachability. While unavailable every operation
    /// fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    fn with_live_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, DateTime<Utc>) -> StoreResult<T>) -> StoreResult<T> {
        self.check_available()?;
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let now = self.clock.now();
        entries.retain(|_, e| e.expires_at > now);
        f(&mut entries, now)
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn try_acquire_lock(&self, key: &str, holder: HolderId, ttl: Duration) -> StoreResult<Option<LockHandle>> {
        self.with_live_entries(|entries, now| {
            if entries.contains_key(key) {
                return Ok(None);
            }

            let expires_at = now + to_chrono(ttl);
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Lock { holder },
                    expires_at,
                },
            );

            Ok(Some(LockHandle {
                key: key.to_string(),
                holder,
                acquired_at: now,
                expires_at,
            }))
        })
    }

    fn release_lock(&self, handle: &LockHandle) -> StoreResult<bool> {
        self.with_live_entries(|entries, _now| {
            let owned = matches!(
                entries.get(&handle.key),
                Some(Entry { value: Value::Lock { holder }, .. }) if *holder == handle.holder
            );
            if owned {
                entries.remove(&handle.key);
            }
            Ok(owned)
        })
    }

    fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.with_live_entries(|entries, now| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Counter(0),
                expires_at: now + to_chrono(window),
            });

            match &mut entry.value {
                Value::Counter(count) => {
                    *count += 1;
                    Ok(*count)
                }
                Value::Lock { .. } => Err(StoreError::WrongType(key.to_string())),
            }
        })
    }

    fn peek(&self, key: &str) -> StoreResult<u64> {
        self.with_live_entries(|entries, _now| match entries.get(key) {
            None => Ok(0),
            Some(Entry { value: Value::Counter(count), .. }) => Ok(*count),
            Some(Entry { value: Value::Lock { .. }, .. }) => Err(StoreError::WrongType(key.to_string())),
        })
    }
}
