//! Demo worker: runs a throttling scenario across a pool of worker threads.
//!
//! ```text
//! jobthrottle-worker [throttle-exceptions|concurrency]
//! ```
//!
//! Env: `JOBTHROTTLE_BACKEND` (`memory`/`redis`), `REDIS_URL`,
//! `JOBTHROTTLE_WORKERS`, `JOBTHROTTLE_KEY_PREFIX`, `JOBTHROTTLE_RUN_SECS`.

mod scenarios;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use jobthrottle_infra::config::ThrottleSettings;
use jobthrottle_infra::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig, JobStore};

use crate::scenarios::Scenario;

/// How long completed jobs stay inspectable before they are purged.
const KEEP_COMPLETED_SECS: i64 = 60;

fn main() -> anyhow::Result<()> {
    jobthrottle_observability::init();

    let scenario: Scenario = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(Scenario::ThrottleExceptions);

    let settings = ThrottleSettings::from_env().context("reading settings")?;
    let run_for = std::env::var("JOBTHROTTLE_RUN_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300));

    let counters = settings.open_store().context("opening counter store")?;
    let store = InMemoryJobStore::arc();
    let mut executor = JobExecutor::new(store.clone());

    scenario.install(&mut executor, counters, &settings.key_prefix)?;

    info!(
        scenario = scenario.name(),
        workers = settings.workers,
        backend = ?settings.backend,
        "starting workers"
    );
    let handle = executor
        .spawn(
            JobExecutorConfig::default()
                .with_name("jobthrottle-worker")
                .with_workers(settings.workers),
        )
        .context("spawning worker threads")?;

    let deadline = Instant::now() + run_for;
    while store.stats()?.outstanding() > 0 {
        if Instant::now() >= deadline {
            warn!(run_secs = run_for.as_secs(), "jobs still outstanding at deadline; stopping");
            break;
        }
        let purged = store.purge_completed(chrono::Utc::now() - chrono::Duration::seconds(KEEP_COMPLETED_SECS))?;
        if purged > 0 {
            debug!(purged, "purged completed jobs");
        }
        thread::sleep(Duration::from_millis(500));
    }

    let stats = handle.shutdown();
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        released = stats.jobs_released,
        failed = stats.jobs_failed,
        "workers stopped"
    );

    for failed in store.list_failed(usize::MAX)? {
        info!(
            job_id = %failed.job.id,
            attempts = failed.job.attempts,
            reason = %failed.reason,
            error = %failed.error,
            "failed job"
        );
    }

    Ok(())
}
