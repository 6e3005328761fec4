//! Concurrency throttle: bounded slots per key.
//!
//! Each key owns `allow` slot locks in the counter store. A caller takes the
//! first free slot, runs its body while holding it, then releases it. Every
//! slot carries a TTL of `every`, so a crashed holder locks nobody out for
//! longer than one window.
//!
//! With `reserve_for_window` the slot is *not* released after the body; it
//! stays consumed until its TTL runs out, which turns the mutex into a rate
//! limit of `allow` executions per `every`.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use jobthrottle_core::key::DEFAULT_KEY_PREFIX;
use jobthrottle_core::{ConfigError, ConfigResult, HolderId, ThrottleKey};

use crate::store::{CounterStore, LockHandle, StoreResult};

use super::MAX_WINDOW;

/// Concurrency throttle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum concurrent slots per key.
    pub allow: u32,
    /// Slot TTL (window length).
    pub every: Duration,
    /// How long to keep trying for a slot; zero tries once.
    pub block: Duration,
    /// Keep slots consumed until `every` elapses instead of releasing them.
    pub reserve_for_window: bool,
    /// Pause between acquisition rounds while blocking.
    pub poll_interval: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            allow: 1,
            every: Duration::from_secs(60),
            block: Duration::ZERO,
            reserve_for_window: false,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ConcurrencyConfig {
    /// `allow` slots per `every`.
    pub fn new(allow: u32, every: Duration) -> Self {
        Self {
            allow,
            every,
            ..Default::default()
        }
    }

    pub fn block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn reserve_for_window(mut self, reserve: bool) -> Self {
        self.reserve_for_window = reserve;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.allow == 0 {
            return Err(ConfigError::invalid_value("allow", "must be at least 1"));
        }
        if self.every.is_zero() {
            return Err(ConfigError::invalid_value("every", "window must be non-zero"));
        }
        if self.every > MAX_WINDOW {
            return Err(ConfigError::invalid_value("every", "window is too long"));
        }
        if self.poll_interval.is_zero() && !self.block.is_zero() {
            return Err(ConfigError::invalid_value(
                "poll_interval",
                "must be non-zero when blocking",
            ));
        }
        Ok(())
    }
}

/// Bounds concurrent executions for one throttle key.
#[derive(Debug, Clone)]
pub struct ConcurrencyThrottle<S> {
    store: S,
    key: ThrottleKey,
    config: ConcurrencyConfig,
    prefix: String,
}

impl<S: CounterStore> ConcurrencyThrottle<S> {
    pub fn new(store: S, key: ThrottleKey, config: ConcurrencyConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            key,
            config,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn key(&self) -> &ThrottleKey {
        &self.key
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// One pass over all slots; no waiting.
    pub fn try_acquire(&self) -> StoreResult<Option<SlotGuard<'_, S>>> {
        let holder = HolderId::new();
        for index in 0..self.config.allow {
            let slot_key = self.key.slot_key(&self.prefix, index);
            if let Some(handle) = self.store.try_acquire_lock(&slot_key, holder, self.config.every)? {
                debug!(key = %self.key, slot = index, holder = %holder, "acquired concurrency slot");
                return Ok(Some(SlotGuard {
                    throttle: self,
                    handle: Some(handle),
                }));
            }
        }
        Ok(None)
    }

    /// Try for a slot until `block` elapses.
    ///
    /// Store errors count as "no slot": the caller is blocked, never let
    /// through.
    pub fn acquire(&self) -> Option<SlotGuard<'_, S>> {
        let deadline = Instant::now() + self.config.block;

        loop {
            match self.try_acquire() {
                Ok(Some(slot)) => return Some(slot),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %self.key, error = %e, "counter store error while acquiring slot; treating as blocked");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %self.key, allow = self.config.allow, "no concurrency slot available");
                return None;
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Run `body` holding a slot, or `on_blocked` if none could be taken.
    ///
    /// The slot is given back (or left reserved) after `body` returns or
    /// unwinds; whatever `body` returns, errors included, is passed through.
    pub fn run<T>(&self, body: impl FnOnce() -> T, on_blocked: impl FnOnce() -> T) -> T {
        match self.acquire() {
            Some(slot) => {
                let out = body();
                drop(slot);
                out
            }
            None => on_blocked(),
        }
    }
}

/// A held concurrency slot. Released on drop unless the throttle reserves
/// slots for the whole window.
#[derive(Debug)]
pub struct SlotGuard<'a, S: CounterStore> {
    throttle: &'a ConcurrencyThrottle<S>,
    handle: Option<LockHandle>,
}

impl<S: CounterStore> SlotGuard<'_, S> {
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }
}

impl<S: CounterStore> Drop for SlotGuard<'_, S> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if self.throttle.config.reserve_for_window {
            debug!(slot = %handle.key, expires_at = %handle.expires_at, "slot kept reserved until window ends");
            return;
        }

        match self.throttle.store.release_lock(&handle) {
            Ok(true) => debug!(slot = %handle.key, "released concurrency slot"),
            Ok(false) => warn!(slot = %handle.key, "concurrency slot expired before release"),
            Err(e) => warn!(slot = %handle.key, error = %e, "failed to release concurrency slot; it will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jobthrottle_core::ManualClock;

    use super::*;
    use crate::store::InMemoryCounterStore;

    fn key() -> ThrottleKey {
        ThrottleKey::new("k").unwrap()
    }

    fn setup(config: ConcurrencyConfig) -> (ConcurrencyThrottle<Arc<InMemoryCounterStore>>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
        (ConcurrencyThrottle::new(store, key(), config).unwrap(), clock)
    }

    #[test]
    fn rejects_invalid_config() {
        let store = InMemoryCounterStore::arc();
        assert!(ConcurrencyThrottle::new(store.clone(), key(), ConcurrencyConfig::new(0, Duration::from_secs(1))).is_err());
        assert!(ConcurrencyThrottle::new(store.clone(), key(), ConcurrencyConfig::new(1, Duration::ZERO)).is_err());
        assert!(ConcurrencyThrottle::new(store, key(), ConcurrencyConfig::new(1, Duration::MAX)).is_err());
    }

    #[test]
    fn slots_are_bounded_by_allow() {
        let (throttle, _clock) = setup(ConcurrencyConfig::new(2, Duration::from_secs(60)));

        let a = throttle.acquire();
        let b = throttle.acquire();
        let c = throttle.acquire();

        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());

        drop(a);
        assert!(throttle.acquire().is_some());
    }

    #[test]
    fn body_result_passes_through_and_slot_is_released() {
        let (throttle, _clock) = setup(ConcurrencyConfig::new(1, Duration::from_secs(60)));

        let out: Result<(), &str> = throttle.run(|| Err("boom"), || Ok(()));
        assert_eq!(out, Err("boom"));

        // Released despite the error.
        assert!(throttle.acquire().is_some());
    }

    #[test]
    fn blocked_callers_take_fallback() {
        let (throttle, _clock) = setup(ConcurrencyConfig::new(1, Duration::from_secs(60)));
        let _held = throttle.acquire();

        let ran = throttle.run(|| "body", || "blocked");
        assert_eq!(ran, "blocked");
    }

    #[test]
    fn reserved_slots_stay_taken_until_window_ends() {
        let (throttle, clock) =
            setup(ConcurrencyConfig::new(2, Duration::from_secs(60)).reserve_for_window(true));
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            throttle.run(|| runs.fetch_add(1, Ordering::SeqCst), || 0);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_secs(60));
        throttle.run(|| runs.fetch_add(1, Ordering::SeqCst), || 0);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn crashed_holder_is_bounded_by_ttl() {
        let (throttle, clock) = setup(ConcurrencyConfig::new(1, Duration::from_secs(60)));
        let slot = throttle.acquire();
        std::mem::forget(slot);

        assert!(throttle.acquire().is_none());
        clock.advance(Duration::from_secs(61));
        assert!(throttle.acquire().is_some());
    }

    #[test]
    fn store_outage_blocks() {
        let store = InMemoryCounterStore::arc();
        let throttle =
            ConcurrencyThrottle::new(store.clone(), key(), ConcurrencyConfig::new(5, Duration::from_secs(60))).unwrap();
        store.set_available(false);

        assert_eq!(throttle.run(|| "body", || "blocked"), "blocked");
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let store = InMemoryCounterStore::arc();
        let config = ConcurrencyConfig::new(1, Duration::from_secs(60))
            .block(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(10));
        let throttle = Arc::new(ConcurrencyThrottle::new(store, key(), config).unwrap());

        let holder = throttle.try_acquire().unwrap().unwrap();
        let handle = holder.handle().cloned().unwrap();
        std::mem::forget(holder);

        let waiter = {
            let throttle = throttle.clone();
            std::thread::spawn(move || throttle.run(|| "body", || "blocked"))
        };

        std::thread::sleep(Duration::from_millis(50));
        throttle.store.release_lock(&handle).unwrap();

        assert_eq!(waiter.join().unwrap(), "body");
    }
}
