//! Demonstration jobs.

use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{info, warn};

use jobthrottle_core::{JobError, ThrottleKey};
use jobthrottle_infra::jobs::{JobDefinition, JobExecutor, JobStore};
use jobthrottle_infra::policy::{BackoffPolicy, RetryEngine};
use jobthrottle_infra::runtime::JobRuntime;
use jobthrottle_infra::store::CounterStore;
use jobthrottle_infra::throttle::{ConcurrencyConfig, ConcurrencyThrottle, ExceptionThrottle, ExceptionThrottleConfig};

pub type SharedCounters = Arc<dyn CounterStore>;

const THROTTLEABLE: &str = "Throttleable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Recoverable, unrecoverable and clean jobs under an exception throttle.
    ThrottleExceptions,
    /// Ten jobs competing for two rate-limited slots.
    Concurrency,
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "throttle-exceptions" => Ok(Self::ThrottleExceptions),
            "concurrency" => Ok(Self::Concurrency),
            other => bail!("unknown scenario `{other}` (expected `throttle-exceptions` or `concurrency`)"),
        }
    }
}

impl Scenario {
    pub fn name(self) -> &'static str {
        match self {
            Self::ThrottleExceptions => "throttle-exceptions",
            Self::Concurrency => "concurrency",
        }
    }

    /// Register the scenario's definition and enqueue its jobs.
    pub fn install<S: JobStore>(
        self,
        executor: &mut JobExecutor<S, SharedCounters>,
        counters: SharedCounters,
        prefix: &str,
    ) -> anyhow::Result<()> {
        let definition = match self {
            Self::ThrottleExceptions => throttle_exceptions(counters, prefix)?,
            Self::Concurrency => concurrency(counters, prefix)?,
        };
        executor.register(definition);

        for payload in self.payloads() {
            let id = executor
                .dispatch(self.name(), payload)
                .with_context(|| format!("dispatching {} job", self.name()))?;
            info!(job_id = %id, scenario = self.name(), "dispatched job");
        }
        Ok(())
    }

    fn payloads(self) -> Vec<serde_json::Value> {
        match self {
            Self::ThrottleExceptions => vec![
                serde_json::json!({ "throw": "recoverable" }),
                serde_json::json!({ "throw": "unrecoverable" }),
                serde_json::json!({}),
            ],
            Self::Concurrency => (1..=10).map(|n| serde_json::json!({ "n": n })).collect(),
        }
    }
}

/// Allow 3 recoverable errors a minute, back off 10 s after that, give up
/// two minutes after dispatch.
fn throttle_exceptions(counters: SharedCounters, prefix: &str) -> anyhow::Result<JobDefinition<SharedCounters>> {
    let config = ExceptionThrottleConfig::new(3, 1.0).backoff_minutes(1.0 / 6.0);
    check_throttle_window(&config);
    let throttle = ExceptionThrottle::new(counters, config)?
        .when(|e| e.type_name() == THROTTLEABLE && e.is_recoverable())
        .with_prefix(prefix);
    let engine = RetryEngine::new(BackoffPolicy::default()).with_exception_throttle(throttle);

    Ok(
        JobDefinition::new(Scenario::ThrottleExceptions.name(), engine, |ctx| {
            let throw = ctx.payload().get("throw").and_then(|v| v.as_str()).map(str::to_owned);
            match throw.as_deref() {
                Some("recoverable") => {
                    info!(job_id = %ctx.job_id(), attempt = ctx.attempts(), "recoverable error thrown; will retry");
                    Err(JobError::recoverable(THROTTLEABLE, "Recoverable error"))
                }
                Some("unrecoverable") => {
                    info!(job_id = %ctx.job_id(), attempt = ctx.attempts(), "unrecoverable error thrown; failing now");
                    ctx.fail_job(JobError::unrecoverable(THROTTLEABLE, "Unrecoverable error (no retries)"));
                    Ok(())
                }
                _ => {
                    info!(job_id = %ctx.job_id(), "no error thrown");
                    Ok(())
                }
            }
        })
        .throttle_key(ThrottleKey::new(Scenario::ThrottleExceptions.name())?)
        .max_tries(0)
        .retry_for(Duration::from_secs(120)),
    )
}

/// Two runs per minute; jobs without a slot come back after 10 s and, with a
/// single try, fail on their next claim.
fn concurrency(counters: SharedCounters, prefix: &str) -> anyhow::Result<JobDefinition<SharedCounters>> {
    let throttle = ConcurrencyThrottle::new(
        counters,
        ThrottleKey::new(Scenario::Concurrency.name())?,
        ConcurrencyConfig::new(2, Duration::from_secs(60)).reserve_for_window(true),
    )?
    .with_prefix(prefix);

    Ok(JobDefinition::new(
        Scenario::Concurrency.name(),
        RetryEngine::new(BackoffPolicy::default()),
        |ctx| {
            info!(job_id = %ctx.job_id(), "got slot; processing");
            for step in 1..=5 {
                info!(job_id = %ctx.job_id(), step, "start processing");
                thread::sleep(Duration::from_secs(3));
                info!(job_id = %ctx.job_id(), step, "end processing");
            }
            Ok(())
        },
    )
    .limit_concurrency(throttle, Duration::from_secs(10))
    .max_tries(1))
}

/// Warn about settings that make the exception throttle pointless.
fn check_throttle_window(config: &ExceptionThrottleConfig) {
    let spent = config.backoff * config.max_attempts;
    if spent >= config.decay {
        warn!(
            backoff_ms = config.backoff.as_millis() as u64,
            decay_ms = config.decay.as_millis() as u64,
            max_attempts = config.max_attempts,
            "max_attempts x backoff reaches the decay window; the budget resets before it can be exceeded"
        );
    }
}

#[cfg(test)]
mod tests {
    use jobthrottle_infra::jobs::InMemoryJobStore;
    use jobthrottle_infra::store::InMemoryCounterStore;

    use super::*;

    #[test]
    fn parses_scenarios() {
        assert_eq!("concurrency".parse::<Scenario>().unwrap(), Scenario::Concurrency);
        assert_eq!(
            "throttle-exceptions".parse::<Scenario>().unwrap(),
            Scenario::ThrottleExceptions
        );
        assert!("funnel".parse::<Scenario>().is_err());
    }

    #[test]
    fn install_dispatches_scenario_jobs() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());

        Scenario::Concurrency
            .install(&mut executor, Arc::new(InMemoryCounterStore::new()), "test")
            .unwrap();
        Scenario::ThrottleExceptions
            .install(&mut executor, Arc::new(InMemoryCounterStore::new()), "test")
            .unwrap();

        assert_eq!(store.stats().unwrap().pending, 13);
        let concurrency = executor.definition("concurrency").unwrap();
        assert_eq!(concurrency.key().map(|k| k.as_str()), Some("concurrency"));
    }

    #[test]
    fn clean_and_unrecoverable_jobs_settle_on_first_attempt() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        Scenario::ThrottleExceptions
            .install(&mut executor, Arc::new(InMemoryCounterStore::new()), "test")
            .unwrap();

        // The recoverable job backs off for 10 s once its budget is spent.
        while executor.run_next().unwrap().is_some() {}

        let stats = store.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.outstanding(), 1);
    }
}
