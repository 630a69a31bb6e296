//! Scheduler implementation

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::{BackoffController, deadline};
use super::config::SchedulerConfig;
use super::dedup::Deduplicator;
use super::observer::{BackoffEvent, BackoffObserver, ObserverHub};
use super::operation::{Outcome, QueuedOperation, SubmitOptions, TypedJob};
use super::queue::{AdmissionQueue, QueueEntry, SchedulerCounters, SchedulerStats};
use crate::error::SchedulerError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Internal state protected by mutex
struct SchedulerState {
    queue: AdmissionQueue<QueuedOperation>,
    dedup: Deduplicator,
    backoff: BackoffController,

    /// Operations currently executing
    active: usize,

    last_dispatch: Option<Instant>,

    /// Deadline of the earliest armed wake-up timer
    wake_at: Option<Instant>,

    counters: SchedulerCounters,
}

impl SchedulerState {
    /// Ask for a wake-up at `at` unless an earlier one is already armed
    fn schedule_wake(&mut self, at: Instant) -> Admission {
        match self.wake_at {
            Some(pending) if pending <= at => Admission::Idle,
            _ => {
                self.wake_at = Some(at);
                Admission::Wait(at)
            }
        }
    }
}

/// What the dispatch loop should do next
enum Admission {
    Dispatch(QueuedOperation),
    Wait(Instant),
    Idle,
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    observers: ObserverHub,
}

/// The Scheduler decides when each submitted operation may run, with
/// priority queuing, a concurrency limit, dispatch spacing, deduplication
/// and a shared backoff window after rate limits.
///
/// Cloning is cheap; every clone drives the same queue. All methods that
/// can start work spawn tokio tasks and must be called inside a runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a new scheduler with the given configuration
    pub fn new(mut config: SchedulerConfig) -> Self {
        debug!(?config, "Scheduler::new: called");
        if config.max_concurrent == 0 {
            warn!("max-concurrent of 0 would never dispatch, using 1");
            config.max_concurrent = 1;
        }

        let state = SchedulerState {
            queue: AdmissionQueue::new(),
            dedup: Deduplicator::default(),
            backoff: BackoffController::from_config(&config),
            active: 0,
            last_dispatch: None,
            wake_at: None,
            counters: SchedulerCounters::default(),
        };

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                state: Mutex::new(state),
                observers: ObserverHub::new(EVENT_CHANNEL_CAPACITY),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Submit an operation.
    ///
    /// The operation is admitted right away; the returned future only waits
    /// for its outcome. `op` may be called more than once, since a
    /// rate-limited attempt is retried. With a key, a submission made within
    /// the dedupe window of an earlier one with the same key shares that
    /// earlier result instead of running.
    pub fn submit<T, F, Fut>(&self, op: F, options: SubmitOptions) -> BoxFuture<'static, Result<T, SchedulerError>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        debug!(key = ?options.key, priority = options.priority, bypass = options.bypass_queue, "Scheduler::submit: called");
        if options.bypass_queue {
            return self.bypass(op);
        }

        let window = self.inner.config.dedupe_window();
        let (future, sweep_key) = {
            let mut state = self.lock();
            let now = Instant::now();

            if let Some(key) = options.key.as_deref() {
                if let Some(shared) = state.dedup.lookup::<T>(key, now, window) {
                    debug!(%key, "Scheduler::submit: joining in-flight request");
                    state.counters.deduplicated += 1;
                    return shared.boxed();
                }
            }

            let (tx, rx) = oneshot::channel::<Result<T, SchedulerError>>();
            let operation = QueuedOperation::new(
                options.key.clone(),
                options.priority,
                Box::new(TypedJob::new(op, tx)),
                now,
            );
            let id = operation.id;
            let position = state.queue.push(operation);
            state.counters.peak_queue_depth = state.counters.peak_queue_depth.max(state.queue.len());
            debug!(%id, position, "Scheduler::submit: queued");

            let future = async move { rx.await.unwrap_or(Err(SchedulerError::Abandoned)) }.boxed();
            match options.key {
                Some(key) => {
                    let shared = future.shared();
                    state.dedup.register(key.clone(), shared.clone(), now);
                    (shared.boxed(), Some(key))
                }
                None => (future, None),
            }
        };

        if let Some(key) = sweep_key {
            self.schedule_sweep(key, window);
        }
        self.pump();
        future
    }

    /// Current queue length, concurrency and backoff state
    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        let now = Instant::now();
        SchedulerStats {
            queue_length: state.queue.len(),
            active_requests: state.active,
            is_backing_off: state.backoff.is_backing_off(now),
            backoff_remaining: state.backoff.remaining(now),
            counters: state.counters.clone(),
        }
    }

    /// Pending operations in dispatch order
    pub fn queue_details(&self) -> Vec<QueueEntry> {
        debug!("Scheduler::queue_details: called");
        let state = self.lock();
        let now = Instant::now();
        state
            .queue
            .iter()
            .map(|op| QueueEntry {
                id: op.id,
                priority: op.priority,
                key: op.key.clone(),
                retries: op.retries,
                waiting: now.saturating_duration_since(op.enqueued_at),
            })
            .collect()
    }

    /// Drop any backoff window and restart growth from the initial duration
    pub fn reset_backoff(&self) {
        debug!("Scheduler::reset_backoff: called");
        self.lock().backoff.reset();
        info!("Backoff reset");
        self.pump();
    }

    /// Reject every queued (not yet dispatched) operation with
    /// [`SchedulerError::QueueCleared`] and forget all dedup entries.
    /// Running operations are unaffected. Returns the number rejected.
    pub fn clear_queue(&self) -> usize {
        debug!("Scheduler::clear_queue: called");
        let drained = {
            let mut state = self.lock();
            let drained = state.queue.drain();
            state.dedup.clear();
            state.counters.cancelled += drained.len() as u64;
            drained
        };

        let cleared = drained.len();
        for op in drained {
            op.job.reject(SchedulerError::QueueCleared);
        }
        info!(cleared, "Queue cleared");
        cleared
    }

    /// Set the single backoff observer; `None` removes it
    pub fn register_backoff_observer(&self, observer: Option<BackoffObserver>) {
        self.inner.observers.register(observer);
    }

    /// Receive every backoff event
    pub fn subscribe(&self) -> broadcast::Receiver<BackoffEvent> {
        self.inner.observers.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bypass<T, F, Fut>(&self, op: F) -> BoxFuture<'static, Result<T, SchedulerError>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        debug!("Scheduler::bypass: running outside the queue");
        self.lock().counters.bypassed += 1;
        let handle = tokio::spawn(op());
        async move {
            match handle.await {
                Ok(result) => result.map_err(SchedulerError::operation),
                Err(err) => {
                    warn!(%err, "Bypassed operation did not complete");
                    Err(SchedulerError::Abandoned)
                }
            }
        }
        .boxed()
    }

    /// The dispatch loop: start queued operations until an admission check fails
    fn pump(&self) {
        loop {
            let admission = {
                let mut state = self.lock();
                self.admit(&mut state, Instant::now())
            };

            match admission {
                Admission::Dispatch(op) => self.spawn_execute(op),
                Admission::Wait(at) => {
                    self.arm_timer(at);
                    return;
                }
                Admission::Idle => return,
            }
        }
    }

    fn admit(&self, state: &mut SchedulerState, now: Instant) -> Admission {
        if state.queue.is_empty() {
            return Admission::Idle;
        }

        if state.active >= self.inner.config.max_concurrent {
            return Admission::Idle;
        }

        if let Some(until) = state.backoff.backoff_until().filter(|until| now < *until) {
            debug!(remaining = ?until.saturating_duration_since(now), "Scheduler::admit: backing off");
            return state.schedule_wake(until);
        }

        if let Some(last) = state.last_dispatch {
            let ready_at = deadline(last, self.inner.config.min_delay());
            if now < ready_at {
                return state.schedule_wake(ready_at);
            }
        }

        let Some(op) = state.queue.pop() else {
            return Admission::Idle;
        };
        state.active += 1;
        state.last_dispatch = Some(now);
        state.counters.dispatched += 1;
        state.counters.peak_concurrent = state.counters.peak_concurrent.max(state.active);
        Admission::Dispatch(op)
    }

    fn arm_timer(&self, at: Instant) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            {
                let mut state = scheduler.lock();
                if state.wake_at == Some(at) {
                    state.wake_at = None;
                }
            }
            scheduler.pump();
        });
    }

    fn schedule_sweep(&self, key: String, window: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window * 2).await;
            let removed = scheduler.lock().dedup.sweep(&key, Instant::now(), window);
            if removed {
                debug!(%key, "Scheduler::schedule_sweep: dedup entry expired");
            }
        });
    }

    fn spawn_execute(&self, op: QueuedOperation) {
        let scheduler = self.clone();
        tokio::spawn(scheduler.execute(op));
    }

    async fn execute(self, op: QueuedOperation) {
        let QueuedOperation {
            id,
            key,
            priority,
            base_priority,
            retries,
            enqueued_at,
            job,
        } = op;
        debug!(%id, priority, retries, "Scheduler::execute: dispatching");

        let outcome = AssertUnwindSafe(job.run()).catch_unwind().await.unwrap_or_else(|_| {
            warn!(%id, "Operation panicked");
            Outcome::Failed
        });

        let event = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);

            match outcome {
                Outcome::Succeeded => {
                    debug!(%id, "Scheduler::execute: succeeded");
                    state.counters.succeeded += 1;
                    state.backoff.record_success();
                    None
                }
                Outcome::Failed => {
                    debug!(%id, "Scheduler::execute: failed");
                    state.counters.failed += 1;
                    None
                }
                Outcome::RateLimited { job, signal, message } => {
                    state.counters.rate_limited += 1;
                    let window = state.backoff.record_rate_limit(Instant::now(), signal.retry_after);
                    let retries = retries + 1;
                    warn!(%id, retries, backoff_ms = window.as_millis() as u64, %message, "Rate limited, backing off");

                    let exhausted = self.inner.config.max_rate_limit_retries.is_some_and(|max| retries > max);
                    if job.is_abandoned() {
                        debug!(%id, "Scheduler::execute: caller gone, dropping retry");
                        state.counters.cancelled += 1;
                    } else if exhausted {
                        warn!(%id, retries, "Giving up after repeated rate limits");
                        state.counters.failed += 1;
                        job.reject(SchedulerError::RetriesExhausted {
                            attempts: retries,
                            message,
                        });
                    } else {
                        let boosted = base_priority.saturating_add(self.inner.config.retry_priority_boost);
                        state.queue.push_front_of_band(QueuedOperation {
                            id,
                            key,
                            priority: boosted,
                            base_priority,
                            retries,
                            enqueued_at,
                            job,
                        });
                    }
                    Some(BackoffEvent::entered(window))
                }
            }
        };

        // re-arm dispatch before running observer code
        self.pump();
        if let Some(event) = event {
            self.inner.observers.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusError;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent,
            min_delay_ms: 0,
            ..Default::default()
        }
    }

    fn sleeper(ms: u64, value: u32) -> impl Fn() -> BoxFuture<'static, eyre::Result<u32>> + Send + Sync + 'static {
        move || {
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    fn rate_limited() -> eyre::Report {
        eyre::Report::new(StatusError::too_many_requests("slow down"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_limit() {
        let scheduler = Scheduler::new(config(2));

        let a = scheduler.submit(sleeper(100, 1), SubmitOptions::new());
        let b = scheduler.submit(sleeper(100, 2), SubmitOptions::new());
        let c = scheduler.submit(sleeper(100, 3), SubmitOptions::new());

        let stats = scheduler.stats();
        assert_eq!(stats.active_requests, 2);
        assert_eq!(stats.queue_length, 1);

        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(b.await.unwrap(), 2);
        assert_eq!(c.await.unwrap(), 3);

        let stats = scheduler.stats();
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.counters.dispatched, 3);
        assert_eq!(stats.counters.succeeded, 3);
        assert_eq!(stats.counters.peak_concurrent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_ordering() {
        let scheduler = Scheduler::new(config(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = scheduler.submit(sleeper(50, 0), SubmitOptions::new());

        let mut pending = Vec::new();
        for (name, priority) in [("low", -1), ("normal", 0), ("high", 10), ("normal-2", 0)] {
            let order = order.clone();
            pending.push(scheduler.submit(
                move || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok::<(), eyre::Report>(())
                    }
                },
                SubmitOptions::new().with_priority(priority),
            ));
        }

        let queued: Vec<i32> = scheduler.queue_details().iter().map(|e| e.priority).collect();
        assert_eq!(queued, vec![10, 0, 0, -1]);

        blocker.await.unwrap();
        for future in pending {
            future.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "normal-2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_delay_spaces_dispatches() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_concurrent: 4,
            min_delay_ms: 50,
            ..Default::default()
        });
        let start = Instant::now();
        let started = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for _ in 0..3 {
            let started = started.clone();
            pending.push(scheduler.submit(
                move || {
                    let started = started.clone();
                    async move {
                        started.lock().unwrap().push(Instant::now());
                        Ok::<(), eyre::Report>(())
                    }
                },
                SubmitOptions::new(),
            ));
        }
        for future in pending {
            future.await.unwrap();
        }

        let started = started.lock().unwrap();
        assert_eq!(started.len(), 3);
        assert_eq!(started[0], start);
        for pair in started.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(50) && gap < Duration::from_millis(60), "gap was {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_propagated_without_retry() {
        let scheduler = Scheduler::new(config(2));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = scheduler
            .submit(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u32, _>(eyre::eyre!("Authentication required")) }
                },
                SubmitOptions::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.operation_error().map(|e| e.to_string()).as_deref(), Some("Authentication required"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.stats().is_backing_off);
        assert_eq!(scheduler.stats().counters.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_requeues_and_backs_off() {
        let scheduler = Scheduler::new(config(2));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut events = scheduler.subscribe();

        let future = scheduler.submit(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err(rate_limited()) } else { Ok(n) } }
            },
            SubmitOptions::new(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = scheduler.stats();
        assert!(stats.is_backing_off);
        assert_eq!(stats.queue_length, 1);
        assert!(stats.backoff_remaining <= Duration::from_millis(990));
        assert!(stats.backoff_remaining > Duration::from_millis(900));
        assert_eq!(scheduler.queue_details()[0].priority, 100);
        assert_eq!(scheduler.queue_details()[0].retries, 1);
        assert_eq!(events.try_recv().unwrap(), BackoffEvent::entered(Duration::from_secs(1)));

        assert_eq!(future.await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!scheduler.stats().is_backing_off);
        assert_eq!(scheduler.stats().counters.rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_outranks_fresh_work() {
        let scheduler = Scheduler::new(config(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let retried = {
            let order = order.clone();
            let calls = calls.clone();
            scheduler.submit(
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    let order = order.clone();
                    async move {
                        if n == 0 {
                            return Err(rate_limited());
                        }
                        order.lock().unwrap().push("retried");
                        Ok(())
                    }
                },
                SubmitOptions::new(),
            )
        };

        // let the first attempt fail before queuing fresh work
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = {
            let order = order.clone();
            scheduler.submit(
                move || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push("fresh");
                        Ok::<(), eyre::Report>(())
                    }
                },
                SubmitOptions::new().with_priority(50),
            )
        };

        retried.await.unwrap();
        fresh.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["retried", "fresh"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap_rejects() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_rate_limit_retries: Some(1),
            ..config(1)
        });

        let result = scheduler
            .submit(|| async { Err::<u32, _>(rate_limited()) }, SubmitOptions::new())
            .await;

        match result {
            Err(SchedulerError::RetriesExhausted { attempts, message }) => {
                assert_eq!(attempts, 2);
                assert_eq!(message, "HTTP 429: slow down");
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(scheduler.stats().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_backoff_resumes_dispatch() {
        let scheduler = Scheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let future = scheduler.submit(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err(rate_limited()) } else { Ok(n) } }
            },
            SubmitOptions::new(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(scheduler.stats().is_backing_off);

        scheduler.reset_backoff();
        assert!(!scheduler.stats().is_backing_off);

        let started = Instant::now();
        assert_eq!(future.await.unwrap(), 1);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_ignores_saturation() {
        let scheduler = Scheduler::new(config(1));
        let blocker = scheduler.submit(sleeper(1000, 0), SubmitOptions::new());
        let queued = scheduler.submit(sleeper(10, 1), SubmitOptions::new());
        assert_eq!(scheduler.stats().active_requests, 1);

        let bypassed = scheduler.submit(sleeper(10, 2), SubmitOptions::new().bypass());
        let value = tokio::time::timeout(Duration::from_millis(50), bypassed)
            .await
            .expect("bypass should not wait for the queue");

        assert_eq!(value.unwrap(), 2);
        assert_eq!(scheduler.stats().active_requests, 1);
        assert_eq!(scheduler.stats().queue_length, 1);
        assert_eq!(scheduler.stats().counters.bypassed, 1);

        blocker.await.unwrap();
        queued.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_ignores_backoff() {
        let scheduler = Scheduler::new(config(2));
        let failing = scheduler.submit(|| async { Err::<u32, _>(rate_limited()) }, SubmitOptions::new());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(scheduler.stats().is_backing_off);

        let value = tokio::time::timeout(
            Duration::from_millis(50),
            scheduler.submit(|| async { Ok::<u32, eyre::Report>(5) }, SubmitOptions::new().bypass()),
        )
        .await
        .expect("bypass should not wait for backoff");
        assert_eq!(value.unwrap(), 5);

        scheduler.clear_queue();
        assert!(failing.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_rejects_only_queued() {
        let scheduler = Scheduler::new(config(1));
        let running = scheduler.submit(sleeper(100, 1), SubmitOptions::new());
        let queued: Vec<_> = (0..3)
            .map(|i| scheduler.submit(sleeper(100, i), SubmitOptions::new()))
            .collect();

        assert_eq!(scheduler.clear_queue(), 3);

        for future in queued {
            assert!(matches!(future.await, Err(SchedulerError::QueueCleared)));
        }
        assert_eq!(running.await.unwrap(), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.counters.cancelled, 3);
        assert_eq!(stats.counters.succeeded, 1);
        assert_eq!(stats.queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_collapses_identical_keys() {
        let scheduler = Scheduler::new(config(4));
        let calls = Arc::new(AtomicU32::new(0));

        let make = |value: u32| {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<u32, eyre::Report>(value)
                }
            }
        };

        let first = scheduler.submit(make(7), SubmitOptions::new().with_key("users"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = scheduler.submit(make(8), SubmitOptions::new().with_key("users"));

        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().counters.deduplicated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_shares_rejection() {
        let scheduler = Scheduler::new(config(4));

        let first = scheduler.submit(
            || async { Err::<u32, _>(eyre::eyre!("not found")) },
            SubmitOptions::new().with_key("profile"),
        );
        let second = scheduler.submit(
            || async { Ok::<u32, eyre::Report>(1) },
            SubmitOptions::new().with_key("profile"),
        );

        match (first.await, second.await) {
            (Err(SchedulerError::Operation(a)), Err(SchedulerError::Operation(b))) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("Expected shared rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_expires_after_window() {
        let scheduler = Scheduler::new(config(4));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            scheduler
                .submit(
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<(), eyre::Report>(()) }
                    },
                    SubmitOptions::new().with_key("users"),
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_called_per_rate_limit() {
        let scheduler = Scheduler::new(config(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scheduler.register_backoff_observer(Some(Arc::new(move |flag: bool, remaining: Duration| {
            sink.lock().unwrap().push((flag, remaining));
        })));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        scheduler
            .submit(
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err(rate_limited()) } else { Ok(()) } }
                },
                SubmitOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(true, Duration::from_millis(1000)), (true, Duration::from_millis(2000))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_frees_slot() {
        let scheduler = Scheduler::new(config(1));

        let panicked = scheduler.submit(
            || async {
                if true {
                    panic!("boom");
                }
                Ok::<u32, eyre::Report>(0)
            },
            SubmitOptions::new(),
        );
        assert!(matches!(panicked.await, Err(SchedulerError::Abandoned)));

        let after = scheduler.submit(|| async { Ok::<u32, eyre::Report>(1) }, SubmitOptions::new());
        assert_eq!(after.await.unwrap(), 1);
        assert_eq!(scheduler.stats().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_multiplier_still_retries() {
        let scheduler = Scheduler::new(SchedulerConfig {
            backoff_multiplier: 1e30,
            ..config(1)
        });
        assert!(scheduler.config().validate().is_ok());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let future = scheduler.submit(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(rate_limited()) } else { Ok(n) } }
            },
            SubmitOptions::new(),
        );

        assert_eq!(future.await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.stats().counters.rate_limited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_observer_does_not_stall_retry() {
        let scheduler = Scheduler::new(config(1));
        scheduler.register_backoff_observer(Some(Arc::new(|_: bool, _: Duration| panic!("indicator bug"))));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let future = scheduler.submit(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err(rate_limited()) } else { Ok(n) } }
            },
            SubmitOptions::new(),
        );

        let value = tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("retry should run once the window closes");
        assert_eq!(value.unwrap(), 1);
        assert_eq!(scheduler.stats().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_is_not_retried() {
        let scheduler = Scheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let future = scheduler.submit(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(rate_limited()) }
            },
            SubmitOptions::new(),
        );
        drop(future);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.counters.cancelled, 1);
        assert_eq!(stats.counters.rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_never_exceeds_limit() {
        let scheduler = Scheduler::new(config(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicU32::new(0));

        let pending: Vec<_> = (0..20)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                let calls = calls.clone();
                scheduler.submit(
                    move || {
                        let active = active.clone();
                        let peak = peak.clone();
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10 + (i % 4) * 5)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            if n % 7 == 3 { Err(rate_limited()) } else { Ok(i) }
                        }
                    },
                    SubmitOptions::new().with_priority((i % 3) as i32),
                )
            })
            .collect();

        for future in pending {
            future.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(scheduler.stats().counters.peak_concurrent, 3);
        assert_eq!(scheduler.stats().counters.succeeded, 20);
    }
}
