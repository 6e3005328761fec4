//! Job executor: runs claimed jobs through their definition's throttles and
//! retry engine.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use jobthrottle_core::{Clock, FailureReason, JobError, JobId, SystemClock, ThrottleKey, Transition};

use crate::policy::RetryEngine;
use crate::runtime::JobRuntime;
use crate::store::{CounterStore, to_chrono};
use crate::throttle::ConcurrencyThrottle;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&mut JobContext<'_>) -> Result<(), JobError> + Send + Sync>;

/// Type name of the failure recorded when a handler panics.
pub const PANIC_ERROR: &str = "Panic";

/// Executor error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("no definition registered for job `{0}`")]
    UnknownJob(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Concurrency limit around a job body.
struct ConcurrencyGate<C> {
    throttle: ConcurrencyThrottle<C>,
    /// Delay for jobs that could not get a slot.
    release_after: Duration,
}

/// Everything the executor needs to run one kind of job.
pub struct JobDefinition<C> {
    name: String,
    handler: JobHandler,
    engine: RetryEngine<C>,
    key: Option<ThrottleKey>,
    concurrency: Option<ConcurrencyGate<C>>,
    max_tries: u32,
    max_exceptions: u32,
    retry_for: Option<Duration>,
}

impl<C> std::fmt::Debug for JobDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("max_tries", &self.max_tries)
            .field("max_exceptions", &self.max_exceptions)
            .field("retry_for", &self.retry_for)
            .finish_non_exhaustive()
    }
}

impl<C: CounterStore> JobDefinition<C> {
    pub fn new<F>(name: impl Into<String>, engine: RetryEngine<C>, handler: F) -> Self
    where
        F: Fn(&mut JobContext<'_>) -> Result<(), JobError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(handler),
            engine,
            key: None,
            concurrency: None,
            max_tries: 1,
            max_exceptions: 0,
            retry_for: None,
        }
    }

    /// Key the exception throttle counts under.
    pub fn throttle_key(mut self, key: ThrottleKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Run the body only while holding a slot; jobs that get none are
    /// released for `release_after`.
    pub fn limit_concurrency(mut self, throttle: ConcurrencyThrottle<C>, release_after: Duration) -> Self {
        if self.key.is_none() {
            self.key = Some(throttle.key().clone());
        }
        self.concurrency = Some(ConcurrencyGate {
            throttle,
            release_after,
        });
        self
    }

    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn max_exceptions(mut self, max_exceptions: u32) -> Self {
        self.max_exceptions = max_exceptions;
        self
    }

    /// Stop retrying once this much time has passed since dispatch.
    pub fn retry_for(mut self, window: Duration) -> Self {
        self.retry_for = Some(window);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> Option<&ThrottleKey> {
        self.key.as_ref()
    }

    pub fn engine(&self) -> &RetryEngine<C> {
        &self.engine
    }

    /// Build a job instance carrying this definition's limits.
    pub fn dispatch(&self, payload: serde_json::Value, now: DateTime<Utc>) -> Job {
        let job = Job::new(self.name.clone(), payload)
            .enqueued_at(now)
            .with_max_tries(self.max_tries)
            .with_max_exceptions(self.max_exceptions);

        match self.retry_for {
            Some(window) => job.with_retry_until(now + to_chrono(window)),
            None => job,
        }
    }
}

/// Runtime view of the job instance handed to handlers.
pub struct JobContext<'a> {
    job: &'a mut Job,
    clock: &'a dyn Clock,
    started_at: DateTime<Utc>,
    decision: Option<Transition>,
}

impl<'a> JobContext<'a> {
    fn new(job: &'a mut Job, clock: &'a dyn Clock) -> Self {
        let started_at = clock.now();
        Self {
            job,
            clock,
            started_at,
            decision: None,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Fail the job right away, without retries.
    pub fn fail_job(&mut self, cause: JobError) {
        self.fail(cause, FailureReason::FailedByJob);
    }

    /// Outcome already settled by `release`/`fail`, if any.
    pub fn decision(&self) -> Option<&Transition> {
        self.decision.as_ref()
    }

    fn complete(&mut self) {
        self.job.mark_completed(self.started_at, self.clock.now());
    }
}

impl JobRuntime for JobContext<'_> {
    fn job_id(&self) -> JobId {
        self.job.id
    }

    fn attempts(&self) -> u32 {
        self.job.attempts
    }

    fn max_tries(&self) -> u32 {
        self.job.max_tries
    }

    fn max_exceptions(&self) -> u32 {
        self.job.max_exceptions
    }

    fn retry_until(&self) -> Option<DateTime<Utc>> {
        self.job.retry_until
    }

    fn budget_exceeded_events(&self) -> u32 {
        self.job.budget_exceeded_events
    }

    fn release(&mut self, delay: Duration) {
        self.job.mark_released(delay, self.started_at, self.clock.now());
        self.decision = Some(Transition::retry(delay));
    }

    fn record_budget_exceeded(&mut self) {
        self.job.record_budget_exceeded();
    }

    fn fail(&mut self, cause: JobError, reason: FailureReason) {
        self.job
            .mark_failed(cause.clone(), reason, self.started_at, self.clock.now());
        self.decision = Some(Transition::fail(cause, reason));
    }
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Worker threads
    pub workers: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_released: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &Result<Transition, ExecutorError>) {
        self.jobs_processed += 1;
        match outcome {
            Ok(Transition::Succeeded) => self.jobs_succeeded += 1,
            Ok(Transition::Retrying { .. }) => self.jobs_released += 1,
            Ok(Transition::Failed { .. }) | Err(_) => self.jobs_failed += 1,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for workers to finish their
    /// current job. Returns the final statistics.
    pub fn shutdown(self) -> ExecutorStats {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins {
            let worker = join.thread().name().unwrap_or("unnamed").to_string();
            if let Err(payload) = join.join() {
                error!(worker = %worker, panic = %panic_message(payload.as_ref()), "job worker panicked");
            }
        }
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Background job executor.
///
/// Polls a job store for ready jobs and runs each through its definition.
/// Retry decisions come from the definition's [`RetryEngine`]; the executor
/// only persists them.
pub struct JobExecutor<S, C> {
    store: S,
    definitions: HashMap<String, JobDefinition<C>>,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore, C: CounterStore> JobExecutor<S, C> {
    /// Create a new executor with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            definitions: HashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a definition, replacing any with the same name.
    pub fn register(&mut self, definition: JobDefinition<C>) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn definition(&self, name: &str) -> Option<&JobDefinition<C>> {
        self.definitions.get(name)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a job for a registered definition.
    pub fn dispatch(&self, name: &str, payload: serde_json::Value) -> Result<JobId, ExecutorError> {
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownJob(name.to_string()))?;
        Ok(self.store.enqueue(definition.dispatch(payload, self.clock.now()))?)
    }

    /// Claim and run the next ready job, if any.
    pub fn run_next(&self) -> Result<Option<Transition>, ExecutorError> {
        match self.store.claim_next(self.clock.now())? {
            Some(mut job) => self.execute_one(&mut job).map(Some),
            None => Ok(None),
        }
    }

    /// Execute a claimed job and persist the outcome.
    pub fn execute_one(&self, job: &mut Job) -> Result<Transition, ExecutorError> {
        let Some(definition) = self.definitions.get(&job.name) else {
            warn!(job_id = %job.id, job = %job.name, "no definition for job");
            let now = self.clock.now();
            job.mark_failed(
                JobError::unrecoverable("UnknownJob", format!("no definition for job `{}`", job.name)),
                FailureReason::Unrecoverable,
                now,
                now,
            );
            self.store.fail(job.clone(), now)?;
            return Err(ExecutorError::UnknownJob(job.name.clone()));
        };

        let transition = self.run_attempt(definition, job);

        match &job.status {
            JobStatus::Failed { .. } => self.store.fail(job.clone(), self.clock.now())?,
            _ => self.store.update(job)?,
        }

        Ok(transition)
    }

    fn run_attempt(&self, definition: &JobDefinition<C>, job: &mut Job) -> Transition {
        let key = definition.key.as_ref();
        let engine = &definition.engine;
        let mut ctx = JobContext::new(job, self.clock.as_ref());

        if let Some(transition) = engine.on_claim(&ctx.attempt_state()) {
            engine.apply(&transition, &mut ctx, &definition.name, key);
            return transition;
        }

        let result = match &definition.concurrency {
            Some(gate) => gate
                .throttle
                .run(|| Some(call_handler(&definition.handler, &mut ctx)), || None),
            None => Some(call_handler(&definition.handler, &mut ctx)),
        };

        // The handler settled the outcome itself.
        if let Some(decision) = ctx.decision.clone() {
            if let Some(Err(e)) = &result {
                warn!(job_id = %ctx.job_id(), error = %e, "job returned an error after settling its outcome; ignored");
            }
            if let Transition::Failed { cause, reason } = &decision {
                engine.notify_failure(&ctx, &definition.name, key, cause, *reason);
            }
            return decision;
        }

        let transition = match result {
            None => {
                let delay = definition
                    .concurrency
                    .as_ref()
                    .map(|gate| gate.release_after)
                    .unwrap_or_default();
                info!(job_id = %ctx.job_id(), delay_ms = delay.as_millis() as u64, "no concurrency slot; releasing job");
                Transition::retry(delay)
            }
            Some(Ok(())) => Transition::Succeeded,
            Some(Err(error)) => {
                debug!(job_id = %ctx.job_id(), attempt = ctx.attempts(), error = %error, "job attempt failed");
                engine.on_failure(key, &ctx.attempt_state(), error)
            }
        };

        match &transition {
            Transition::Succeeded => ctx.complete(),
            _ => engine.apply(&transition, &mut ctx, &definition.name, key),
        }

        transition
    }
}

/// Run a handler, turning a panic into a failure of the attempt.
fn call_handler(handler: &JobHandler, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(job_id = %ctx.job_id(), attempt = ctx.attempts(), panic = %message, "job handler panicked");
        Err(JobError::new(PANIC_ERROR, message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job handler panicked".to_string()
    }
}

impl<S, C> JobExecutor<S, C>
where
    S: JobStore + 'static,
    C: CounterStore + 'static,
{
    /// Spawn `config.workers` worker threads sharing this executor.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle> {
        let executor = Arc::new(self);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let joins = (0..config.workers.max(1))
            .map(|index| {
                let executor = executor.clone();
                let shutdown = shutdown.clone();
                let stats = stats.clone();
                let config = config.clone();
                thread::Builder::new()
                    .name(format!("{}-{index}", config.name))
                    .spawn(move || executor_loop(&executor, &config, index, &shutdown, &stats))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(JobExecutorHandle {
            shutdown,
            joins,
            stats,
        })
    }
}

fn executor_loop<S: JobStore, C: CounterStore>(
    executor: &JobExecutor<S, C>,
    config: &JobExecutorConfig,
    worker: usize,
    shutdown: &AtomicBool,
    stats: &Mutex<ExecutorStats>,
) {
    info!(executor = %config.name, worker, "job worker started");
    let start_time = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match executor.store.claim_next(executor.clock.now()) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, worker, job_id = %job.id, job = %job.name, attempt = job.attempts, "claimed job");

                if let Ok(mut s) = stats.lock() {
                    s.current_running += 1;
                }

                let outcome = executor.execute_one(&mut job);

                if let Ok(mut s) = stats.lock() {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.record(&outcome);
                }

                if let Err(e) = outcome {
                    error!(executor = %config.name, job_id = %job.id, error = %e, "job execution failed");
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, worker, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use jobthrottle_core::ManualClock;

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::notify::RecordingFailureSink;
    use crate::policy::BackoffPolicy;
    use crate::store::InMemoryCounterStore;
    use crate::throttle::{ConcurrencyConfig, ExceptionThrottle, ExceptionThrottleConfig};

    type Counters = Arc<InMemoryCounterStore>;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        counters: Counters,
        clock: ManualClock,
        sink: Arc<RecordingFailureSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::default();
            Self {
                store: InMemoryJobStore::arc(),
                counters: Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone()))),
                clock,
                sink: Arc::new(RecordingFailureSink::new()),
            }
        }

        fn engine(&self) -> RetryEngine<Counters> {
            RetryEngine::new(BackoffPolicy::default())
                .with_clock(Arc::new(self.clock.clone()))
                .with_sink(self.sink.clone())
        }

        fn executor(&self) -> JobExecutor<Arc<InMemoryJobStore>, Counters> {
            JobExecutor::new(self.store.clone()).with_clock(Arc::new(self.clock.clone()))
        }
    }

    #[test]
    fn execute_successful_job() {
        let f = Fixture::new();
        let mut executor = f.executor();
        executor.register(JobDefinition::new("test", f.engine(), |_ctx| Ok(())));

        executor.dispatch("test", serde_json::json!({})).unwrap();

        let outcome = executor.run_next().unwrap();
        assert_eq!(outcome, Some(Transition::Succeeded));
        assert_eq!(f.store.stats().unwrap().completed, 1);
        assert!(executor.run_next().unwrap().is_none());
    }

    #[test]
    fn failing_job_retries_until_max_tries() {
        let f = Fixture::new();
        let mut executor = f.executor();
        executor.register(
            JobDefinition::new("flaky", f.engine(), |_ctx| Err(JobError::new("Io", "connection reset")))
                .max_tries(3),
        );

        let id = executor.dispatch("flaky", serde_json::json!({})).unwrap();

        for _ in 0..2 {
            assert_eq!(executor.run_next().unwrap(), Some(Transition::retry(Duration::ZERO)));
        }

        match executor.run_next().unwrap() {
            Some(Transition::Failed { cause, reason }) => {
                assert_eq!(reason, FailureReason::MaxTriesExceeded);
                assert_eq!(cause.message(), "connection reset");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let failed = f.store.list_failed(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.id, id);
        assert_eq!(failed[0].job.attempts, 3);
        assert_eq!(f.sink.len(), 1);
    }

    #[test]
    fn exceeded_budget_releases_with_throttle_backoff() {
        let f = Fixture::new();
        let throttle = ExceptionThrottle::new(
            f.counters.clone(),
            ExceptionThrottleConfig::new(1, 1.0).backoff(Duration::from_secs(10)),
        )
        .unwrap();
        let mut executor = f.executor();
        executor.register(
            JobDefinition::new("api", f.engine().with_exception_throttle(throttle), |_ctx| {
                Err(JobError::recoverable("Throttleable", "Recoverable error"))
            })
            .throttle_key(ThrottleKey::new("api").unwrap())
            .max_tries(5),
        );

        executor.dispatch("api", serde_json::json!({})).unwrap();
        executor.dispatch("api", serde_json::json!({})).unwrap();

        assert_eq!(executor.run_next().unwrap(), Some(Transition::retry(Duration::ZERO)));
        assert_eq!(
            executor.run_next().unwrap(),
            Some(Transition::Retrying {
                delay: Duration::from_secs(10),
                budget_exceeded: true
            })
        );
    }

    #[test]
    fn unknown_job_is_failed() {
        let f = Fixture::new();
        let executor = f.executor();
        f.store.enqueue(Job::new("missing", serde_json::json!({}))).unwrap();

        let result = executor.run_next();

        assert!(matches!(result, Err(ExecutorError::UnknownJob(name)) if name == "missing"));
        assert_eq!(f.store.list_failed(10).unwrap().len(), 1);
    }

    #[test]
    fn handler_can_fail_job_explicitly() {
        let f = Fixture::new();
        let mut executor = f.executor();
        executor.register(
            JobDefinition::new("strict", f.engine(), |ctx| {
                ctx.fail_job(JobError::new("Validation", "bad payload"));
                Ok(())
            })
            .max_tries(10),
        );

        executor.dispatch("strict", serde_json::json!({})).unwrap();
        let outcome = executor.run_next().unwrap();

        assert!(matches!(outcome, Some(Transition::Failed { reason: FailureReason::FailedByJob, .. })));
        let sent = f.sink.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reason, FailureReason::FailedByJob);
        assert_eq!(sent[0].cause.type_name(), "Validation");
    }

    #[test]
    fn blocked_job_is_released_then_runs() {
        let f = Fixture::new();
        let key = ThrottleKey::new("concurrency").unwrap();
        let config = ConcurrencyConfig::new(1, Duration::from_secs(60));
        let gate = ConcurrencyThrottle::new(f.counters.clone(), key.clone(), config.clone()).unwrap();
        let other = ConcurrencyThrottle::new(f.counters.clone(), key, config).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut executor = f.executor();
        executor.register(
            JobDefinition::new("limited", f.engine(), move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .limit_concurrency(gate, Duration::from_secs(10))
            .max_tries(2),
        );
        executor.dispatch("limited", serde_json::json!({})).unwrap();

        let held = other.try_acquire().unwrap().unwrap();
        assert_eq!(executor.run_next().unwrap(), Some(Transition::retry(Duration::from_secs(10))));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        drop(held);

        // Not ready until the release delay passes.
        assert!(executor.run_next().unwrap().is_none());
        f.clock.advance(Duration::from_secs(10));

        assert_eq!(executor.run_next().unwrap(), Some(Transition::Succeeded));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_job_over_its_tries_fails_on_claim() {
        let f = Fixture::new();
        let key = ThrottleKey::new("concurrency").unwrap();
        let config = ConcurrencyConfig::new(1, Duration::from_secs(60));
        let gate = ConcurrencyThrottle::new(f.counters.clone(), key.clone(), config.clone()).unwrap();
        let other = ConcurrencyThrottle::new(f.counters.clone(), key, config).unwrap();

        let mut executor = f.executor();
        executor.register(
            JobDefinition::new("limited", f.engine(), |_ctx| Ok(())).limit_concurrency(gate, Duration::ZERO),
        );
        executor.dispatch("limited", serde_json::json!({})).unwrap();

        let _held = other.try_acquire().unwrap().unwrap();
        assert!(matches!(executor.run_next().unwrap(), Some(Transition::Retrying { .. })));

        match executor.run_next().unwrap() {
            Some(Transition::Failed { cause, reason }) => {
                assert_eq!(reason, FailureReason::MaxTriesExceeded);
                assert_eq!(cause.type_name(), "MaxAttemptsExceeded");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(f.sink.notifications()[0].correlation.state.attempts, 2);
    }

    #[test]
    fn retry_window_comes_from_dispatch_time() {
        let f = Fixture::new();
        let definition =
            JobDefinition::new("windowed", f.engine(), |_ctx| Ok(())).retry_for(Duration::from_secs(120));

        let job = definition.dispatch(serde_json::json!({}), f.clock.now());

        assert_eq!(job.retry_until, Some(f.clock.now() + chrono::Duration::seconds(120)));
    }

    #[test]
    fn spawned_workers_drain_the_queue() {
        let store = InMemoryJobStore::arc();
        let mut executor: JobExecutor<_, Counters> = JobExecutor::new(store.clone());
        executor.register(JobDefinition::new("test", RetryEngine::new(BackoffPolicy::default()), |_ctx| Ok(())));

        for i in 0..5 {
            executor.dispatch("test", serde_json::json!({ "i": i })).unwrap();
        }

        let handle = executor
            .spawn(
                JobExecutorConfig::default()
                    .with_workers(2)
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().unwrap().completed < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.shutdown();

        assert_eq!(store.stats().unwrap().completed, 5);
        assert_eq!(stats.jobs_succeeded, 5);
    }

    #[test]
    fn panicking_handler_is_retried_then_failed() {
        let f = Fixture::new();
        let mut executor = f.executor();
        executor.register(JobDefinition::new("fragile", f.engine(), |_ctx| panic!("handler panic")).max_tries(3));

        let id = executor.dispatch("fragile", serde_json::json!({})).unwrap();

        for _ in 0..2 {
            assert_eq!(executor.run_next().unwrap(), Some(Transition::retry(Duration::ZERO)));
        }
        match executor.run_next().unwrap() {
            Some(Transition::Failed { cause, reason }) => {
                assert_eq!(reason, FailureReason::MaxTriesExceeded);
                assert_eq!(cause.type_name(), PANIC_ERROR);
                assert_eq!(cause.message(), "handler panic");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        assert_eq!(f.store.stats().unwrap().running, 0);
        assert_eq!(f.store.list_failed(10).unwrap()[0].job.id, id);
        assert_eq!(f.sink.len(), 1);
    }

    #[test]
    fn worker_survives_a_panicking_handler() {
        let store = InMemoryJobStore::arc();
        let mut executor: JobExecutor<_, Counters> = JobExecutor::new(store.clone());
        executor.register(
            JobDefinition::new("fragile", RetryEngine::new(BackoffPolicy::default()), |ctx| {
                if ctx.payload().get("boom").is_some() {
                    panic!("handler panic");
                }
                Ok(())
            })
            .max_tries(3),
        );
        executor.dispatch("fragile", serde_json::json!({ "boom": true })).unwrap();
        executor.dispatch("fragile", serde_json::json!({})).unwrap();

        let handle = executor
            .spawn(
                JobExecutorConfig::default()
                    .with_workers(1)
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().unwrap().outstanding() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.shutdown();
        let jobs = store.stats().unwrap();

        assert_eq!(jobs.running, 0);
        assert_eq!(jobs.completed, 1);
        assert_eq!(jobs.failed, 1);
        assert_eq!(stats.current_running, 0);
        assert_eq!(stats.jobs_processed, 4);
        assert_eq!(store.list_failed(10).unwrap()[0].error.type_name(), PANIC_ERROR);
    }
}
