//! Exception-rate throttle.
//!
//! Counts classified errors per throttle key in a fixed decay window shared by
//! every job instance using that key. The first `max_attempts` errors in a
//! window are within budget; every one after that is reported as
//! budget-exceeded together with the configured backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use jobthrottle_core::key::DEFAULT_KEY_PREFIX;
use jobthrottle_core::{ConfigError, ConfigResult, JobError, ThrottleDecision, ThrottleKey};

use crate::store::{CounterStore, StoreResult};

use super::{MAX_WINDOW, minutes};

/// Classification predicate: `true` means "count this error".
pub type Classifier = Arc<dyn Fn(&JobError) -> bool + Send + Sync>;

/// Exception throttle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionThrottleConfig {
    /// Errors allowed per window before the budget is exceeded.
    pub max_attempts: u32,
    /// Window length, fixed from the first counted error.
    pub decay: Duration,
    /// Delay reported once the budget is exceeded.
    pub backoff: Duration,
}

impl Default for ExceptionThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            decay: minutes(10.0),
            backoff: Duration::ZERO,
        }
    }
}

impl ExceptionThrottleConfig {
    /// `max_attempts` errors per `decay_minutes` (fractions allowed).
    pub fn new(max_attempts: u32, decay_minutes: f64) -> Self {
        Self {
            max_attempts,
            decay: minutes(decay_minutes),
            ..Default::default()
        }
    }

    pub fn decay(mut self, decay: Duration) -> Self {
        self.decay = decay;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Backoff in (possibly fractional) minutes.
    pub fn backoff_minutes(self, backoff_minutes: f64) -> Self {
        self.backoff(minutes(backoff_minutes))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid_value("max_attempts", "must be at least 1"));
        }
        if self.decay.is_zero() {
            return Err(ConfigError::invalid_value("decay_minutes", "window must be non-zero"));
        }
        if self.decay > MAX_WINDOW {
            return Err(ConfigError::invalid_value("decay_minutes", "window is too long"));
        }
        if self.backoff > MAX_WINDOW {
            return Err(ConfigError::invalid_value("backoff", "backoff is too long"));
        }
        Ok(())
    }
}

/// Counts classified errors against a shared per-key budget.
#[derive(Clone)]
pub struct ExceptionThrottle<S> {
    store: S,
    config: ExceptionThrottleConfig,
    when: Classifier,
    prefix: String,
}

impl<S> fmt::Debug for ExceptionThrottle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionThrottle")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<S: CounterStore> ExceptionThrottle<S> {
    /// Build a throttle that counts every error until [`Self::when`] narrows it.
    pub fn new(store: S, config: ExceptionThrottleConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            when: Arc::new(|_| true),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    /// Only count errors matching `predicate`.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&JobError) -> bool + Send + Sync + 'static,
    {
        self.when = Arc::new(predicate);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn config(&self) -> &ExceptionThrottleConfig {
        &self.config
    }

    pub fn classifies(&self, error: &JobError) -> bool {
        (self.when)(error)
    }

    /// Classify `error`, count it if it matches, and compare against budget.
    ///
    /// Store errors are returned as-is; the caller must treat them as
    /// throttled.
    pub fn should_throttle(&self, key: &ThrottleKey, error: &JobError) -> StoreResult<ThrottleDecision> {
        if !self.classifies(error) {
            debug!(key = %key, error = %error, "error not classified; passing through");
            return Ok(ThrottleDecision::PassThrough);
        }

        let counter_key = key.exception_counter_key(&self.prefix);
        let count = self.store.increment_with_expiry(&counter_key, self.config.decay)?;

        if count <= u64::from(self.config.max_attempts) {
            debug!(key = %key, count, max_attempts = self.config.max_attempts, "exception within budget");
            Ok(ThrottleDecision::WithinBudget { count })
        } else {
            info!(
                key = %key,
                count,
                max_attempts = self.config.max_attempts,
                backoff_ms = self.config.backoff.as_millis() as u64,
                "exception budget exceeded"
            );
            Ok(ThrottleDecision::BudgetExceeded {
                count,
                backoff: self.config.backoff,
            })
        }
    }

    /// Errors counted in the key's current window.
    pub fn current_count(&self, key: &ThrottleKey) -> StoreResult<u64> {
        self.store.peek(&key.exception_counter_key(&self.prefix))
    }
}

#[cfg(test)]
mod tests {
    use jobthrottle_core::ManualClock;
    use proptest::prelude::*;

    use super::*;
    use crate::store::InMemoryCounterStore;

    fn key() -> ThrottleKey {
        ThrottleKey::new("k").unwrap()
    }

    fn setup(config: ExceptionThrottleConfig) -> (ExceptionThrottle<Arc<InMemoryCounterStore>>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
        let throttle = ExceptionThrottle::new(store, config)
            .unwrap()
            .when(|e: &JobError| e.type_name() == "Throttleable" && e.is_recoverable());
        (throttle, clock)
    }

    fn recoverable() -> JobError {
        JobError::recoverable("Throttleable", "Recoverable error")
    }

    #[test]
    fn unclassified_errors_are_not_counted() {
        let (throttle, _clock) = setup(ExceptionThrottleConfig::new(1, 1.0));
        let other = JobError::new("Io", "disk full");

        assert_eq!(throttle.should_throttle(&key(), &other).unwrap(), ThrottleDecision::PassThrough);
        assert_eq!(throttle.current_count(&key()).unwrap(), 0);
    }

    #[test]
    fn fourth_error_exceeds_budget_and_window_resets() {
        let config = ExceptionThrottleConfig::new(3, 1.0).backoff_minutes(1.0 / 6.0);
        let (throttle, clock) = setup(config);

        for expected in 1..=3 {
            assert_eq!(
                throttle.should_throttle(&key(), &recoverable()).unwrap(),
                ThrottleDecision::WithinBudget { count: expected }
            );
        }

        match throttle.should_throttle(&key(), &recoverable()).unwrap() {
            ThrottleDecision::BudgetExceeded { count, backoff } => {
                assert_eq!(count, 4);
                assert_eq!(backoff.as_secs(), 10);
            }
            other => panic!("expected budget exceeded, got {other:?}"),
        }

        clock.advance(Duration::from_secs(61));
        assert_eq!(
            throttle.should_throttle(&key(), &recoverable()).unwrap(),
            ThrottleDecision::WithinBudget { count: 1 }
        );
    }

    #[test]
    fn keys_have_independent_budgets() {
        let (throttle, _clock) = setup(ExceptionThrottleConfig::new(1, 1.0));
        let a = ThrottleKey::new("a").unwrap();
        let b = ThrottleKey::new("b").unwrap();

        throttle.should_throttle(&a, &recoverable()).unwrap();
        assert!(throttle.should_throttle(&a, &recoverable()).unwrap().is_budget_exceeded());
        assert!(!throttle.should_throttle(&b, &recoverable()).unwrap().is_budget_exceeded());
    }

    #[test]
    fn store_outage_is_surfaced() {
        let store = InMemoryCounterStore::arc();
        let throttle = ExceptionThrottle::new(store.clone(), ExceptionThrottleConfig::new(3, 1.0)).unwrap();
        store.set_available(false);

        assert!(throttle.should_throttle(&key(), &recoverable()).is_err());
    }

    #[test]
    fn rejects_invalid_config() {
        let store = InMemoryCounterStore::arc();
        assert!(ExceptionThrottle::new(store.clone(), ExceptionThrottleConfig::new(0, 1.0)).is_err());
        assert!(ExceptionThrottle::new(store, ExceptionThrottleConfig::new(3, 0.0)).is_err());
    }

    #[test]
    fn huge_minutes_are_rejected_not_panicking() {
        let store = InMemoryCounterStore::arc();

        let decay = ExceptionThrottleConfig::new(3, 1e20);
        assert_eq!(decay.decay, Duration::MAX);
        assert!(ExceptionThrottle::new(store.clone(), decay).is_err());

        let backoff = ExceptionThrottleConfig::new(3, 1.0).backoff_minutes(1e20);
        assert!(backoff.validate().is_err());
        assert!(ExceptionThrottle::new(store, backoff).is_err());
    }

    proptest! {
        /// Property: within one window, the first `max_attempts` qualifying
        /// errors are within budget and every later one exceeds it.
        #[test]
        fn budget_boundary_holds_for_any_sequence(
            max_attempts in 1u32..20,
            qualifying in prop::collection::vec(any::<bool>(), 1..60),
        ) {
            let (throttle, _clock) = setup(ExceptionThrottleConfig::new(max_attempts, 1.0));
            let mut counted = 0u64;

            for matches in qualifying {
                let error = if matches { recoverable() } else { JobError::new("Other", "x") };
                let decision = throttle.should_throttle(&key(), &error).unwrap();

                if !matches {
                    prop_assert_eq!(decision, ThrottleDecision::PassThrough);
                    continue;
                }

                counted += 1;
                prop_assert_eq!(decision.count(), Some(counted));
                prop_assert_eq!(decision.is_budget_exceeded(), counted > u64::from(max_attempts));
            }
        }
    }
}
