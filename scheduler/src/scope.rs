//! A test scope that runs tasks on a virtual clock and collects their failures.
//!
//! # Panics
//!
//! A panicking task never unwinds into the driver. The panic is routed through the
//! scope's [ExceptionHandler] (by default, recorded on the scope) and the task's
//! [Handle] resolves to [Error::Exited]. Recorded failures are returned by
//! [TestScope::cleanup_test_coroutines].
//!
//! # Example
//!
//! ```rust
//! use vtime_scheduler::{scope::{Config, TestScope}, Clock, Spawner};
//! use std::time::Duration;
//!
//! let scope = TestScope::new(Config::default());
//! scope.clone().spawn(|context| async move {
//!     context.sleep(Duration::from_millis(500)).await;
//!     println!("woke at {:?}", context.current());
//! });
//! assert_eq!(scope.advance_time_by(Duration::from_millis(500)), Duration::from_millis(500));
//! scope.cleanup_test_coroutines().unwrap();
//! ```

use crate::{
    dispatcher::Dispatcher,
    handler::{ExceptionHandler, FailureContext, Owner},
    queue::Continuation,
    scheduler::{Auditor, Scheduler},
    Clock, Error, Handle, Spawner as _, METRICS_PREFIX,
};
use futures::{
    task::{waker_ref, ArcWake},
    FutureExt as _,
};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};
use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    task::{self, Poll},
    time::Duration,
};
use tracing::{debug, trace};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    label: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
    task_polls: Family<Work, Counter>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
            task_polls: Family::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        registry.register(
            "task_polls",
            "Total number of task polls",
            metrics.task_polls.clone(),
        );
        metrics
    }
}

/// Configuration for a [TestScope].
#[derive(Clone, Default)]
pub struct Config {
    /// If set, dispatched work waits until the clock is driven explicitly
    /// (instead of running as soon as it is dispatched).
    pub paused: bool,

    /// Handler for failures raised by tasks.
    ///
    /// If the handler is already claimed or linked elsewhere, the scope uses an
    /// independent copy of it. If `None`, failures are recorded on the scope.
    pub handler: Option<ExceptionHandler>,
}

/// Failures recorded on a scope and whether it has been cleaned up.
#[derive(Default)]
struct Reports {
    finished: bool,
    errors: Vec<Error>,
}

pub(crate) struct Inner {
    dispatcher: Dispatcher,
    handler: ExceptionHandler,
    registry: Mutex<Registry>,
    metrics: Metrics,
    counter: AtomicU64,
    active: AtomicUsize,
    reports: Mutex<Reports>,
}

/// Implementation of [crate::Spawner], [crate::Clock], and [crate::Metrics]
/// backed by a virtual clock [Scheduler].
#[derive(Clone)]
pub struct TestScope {
    label: String,
    inner: Arc<Inner>,
}

impl Default for TestScope {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl TestScope {
    /// Create a new scope at time zero.
    ///
    /// The configured handler is claimed for this scope and then linked to it.
    pub fn new(cfg: Config) -> Self {
        let owner = Owner::unique();
        let handler = cfg
            .handler
            .unwrap_or_else(ExceptionHandler::reporting)
            .claim_ownership_or_copy(owner);

        // Create a new registry
        let mut registry = Registry::default();
        let scheduler_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);
        let metrics = Metrics::init(scheduler_registry);

        let scheduler = Arc::new(Scheduler::default());
        let scope = Self {
            label: String::new(),
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(scheduler, cfg.paused),
                handler: handler.clone(),
                registry: Mutex::new(registry),
                metrics,
                counter: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                reports: Mutex::new(Reports::default()),
            }),
        };
        handler.register_test_scope(owner, &scope);
        debug!(?owner, paused = cfg.paused, "test scope created");
        scope
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self {
            label: String::new(),
            inner,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.inner.dispatcher.scheduler()
    }

    pub fn auditor(&self) -> &Arc<Auditor> {
        self.scheduler().auditor()
    }

    /// The handler linked to this scope.
    pub fn handler(&self) -> &ExceptionHandler {
        &self.inner.handler
    }

    pub fn current_time(&self) -> Duration {
        self.inner.dispatcher.current_time()
    }

    pub fn advance_time_by(&self, delay: Duration) -> Duration {
        self.inner.dispatcher.advance_time_by(delay)
    }

    pub fn advance_until_idle(&self) -> Duration {
        self.inner.dispatcher.advance_until_idle()
    }

    pub fn run_current(&self) {
        self.inner.dispatcher.run_current()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.dispatcher.is_idle()
    }

    pub fn pause_dispatcher(&self) {
        self.inner.dispatcher.pause_dispatcher()
    }

    pub fn resume_dispatcher(&self) {
        self.inner.dispatcher.resume_dispatcher()
    }

    pub fn pause_dispatcher_while<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.dispatcher.pause_dispatcher_while(f)
    }

    /// Record a failure to be returned by [TestScope::cleanup_test_coroutines].
    ///
    /// Fails with [Error::ScopeFinished] once the scope has been cleaned up.
    pub fn report(&self, error: Error) -> Result<(), Error> {
        let mut reports = self.inner.reports.lock().unwrap();
        if reports.finished {
            return Err(Error::ScopeFinished);
        }
        reports.errors.push(error);
        Ok(())
    }

    /// Failures recorded so far.
    pub fn uncaught(&self) -> Vec<Error> {
        self.inner.reports.lock().unwrap().errors.clone()
    }

    /// Number of spawned tasks that have not completed (or been aborted).
    pub fn active_tasks(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Flush due work and tear the scope down.
    ///
    /// Returns (in order of precedence) any recorded failure, [Error::UncompletedCoroutines]
    /// if work is still scheduled, or [Error::ActiveTasks] if spawned tasks never finished.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn cleanup_test_coroutines(&self) -> Result<(), Error> {
        let unfinished = self.inner.dispatcher.cleanup_test_coroutines().err();
        let errors = {
            let mut reports = self.inner.reports.lock().unwrap();
            assert!(!reports.finished, "test scope already cleaned up");
            reports.finished = true;
            mem::take(&mut reports.errors)
        };
        debug!(errors = errors.len(), "test scope finished");

        let mut errors = errors.into_iter();
        if let Some(first) = errors.next() {
            return Err(Error::Uncaught {
                first: Box::new(first),
                suppressed: errors.collect(),
            });
        }
        if let Some(err) = unfinished {
            return Err(err);
        }
        match self.active_tasks() {
            0 => Ok(()),
            active => Err(Error::ActiveTasks(active)),
        }
    }
}

type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Slot {
    Idle(BoxedFuture),
    Polling,
    Complete,
}

struct Task {
    id: u64,
    label: String,
    scope: Weak<Inner>,

    slot: Mutex<Slot>,

    queued: AtomicBool,
    woken: AtomicBool,
}

impl Task {
    fn spawn(scope: &Arc<Inner>, id: u64, label: String, future: BoxedFuture) {
        let task = Arc::new(Self {
            id,
            label,
            scope: Arc::downgrade(scope),
            slot: Mutex::new(Slot::Idle(future)),
            queued: AtomicBool::new(false),
            woken: AtomicBool::new(false),
        });
        trace!(id, "spawned task");
        ArcWake::wake_by_ref(&task);
    }

    fn poll(self: &Arc<Self>) {
        // Clear before polling so a wake during the poll queues the task again
        self.queued.store(false, Ordering::SeqCst);

        // Take the future out so the task can drive the clock while it is polled
        let mut future = {
            let mut slot = self.future_slot();
            match mem::replace(&mut *slot, Slot::Polling) {
                Slot::Idle(future) => future,
                Slot::Polling => {
                    // Woken while driving the clock from its own poll
                    trace!(id = self.id, "task woken while polling");
                    self.woken.store(true, Ordering::SeqCst);
                    return;
                }
                Slot::Complete => {
                    *slot = Slot::Complete;
                    return;
                }
            }
        };

        // Record task poll
        if let Some(scope) = self.scope.upgrade() {
            scope
                .metrics
                .task_polls
                .get_or_create(&Work {
                    label: self.label.clone(),
                })
                .inc();
        }
        trace!(id = self.id, "processing task");

        // Prepare task for polling
        let waker = waker_ref(self);
        let mut cx = task::Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_ready() {
            *self.future_slot() = Slot::Complete;
            trace!(id = self.id, "task is complete");

            // Dropping the future may cancel scheduled work, so the slot is released first
            drop(future);
            return;
        }
        *self.future_slot() = Slot::Idle(future);
        trace!(id = self.id, "task is still pending");

        // Poll again for any wake that arrived while the future was out
        if self.woken.swap(false, Ordering::SeqCst) {
            ArcWake::wake_by_ref(self);
        }
    }

    fn future_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap()
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(scope) = arc_self.scope.upgrade() else {
            return;
        };
        let task = arc_self.clone();
        scope
            .dispatcher
            .dispatch(Continuation::run(move || task.poll()));
    }
}

impl crate::Spawner for TestScope {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // Get metrics
        let label = self.label.clone();
        let work = Work {
            label: label.clone(),
        };
        self.inner.metrics.tasks_spawned.get_or_create(&work).inc();
        let gauge = self
            .inner
            .metrics
            .tasks_running
            .get_or_create(&work)
            .clone();

        // Route panics through the scope's handler
        let id = self.inner.counter.fetch_add(1, Ordering::SeqCst);
        let context = FailureContext {
            task: id,
            label: label.clone(),
        };
        let handler = self.inner.handler.clone();

        // Set up the task
        let inner = self.inner.clone();
        let future = f(self);
        let (future, handle) = Handle::init(future, gauge, move |message| {
            handler.handle_exception(&context, Error::Panicked(message));
        });
        inner.active.fetch_add(1, Ordering::SeqCst);
        let scope = Arc::downgrade(&inner);
        let future = future.map(move |()| {
            if let Some(scope) = scope.upgrade() {
                scope.active.fetch_sub(1, Ordering::SeqCst);
            }
        });

        // Spawn the task
        Task::spawn(&inner, id, label, Box::pin(future));
        handle
    }
}

impl crate::Metrics for TestScope {
    fn with_label(&self, label: &str) -> Self {
        let label = {
            let prefix = self.label.clone();
            if prefix.is_empty() {
                label.to_string()
            } else {
                format!("{}_{}", prefix, label)
            }
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using scheduler label is not allowed"
        );
        Self {
            label,
            inner: self.inner.clone(),
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed_name = {
            let prefix = &self.label;
            if prefix.is_empty() {
                name
            } else {
                format!("{}_{}", *prefix, name)
            }
        };
        self.inner
            .registry
            .lock()
            .unwrap()
            .register(prefixed_name, help, metric)
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.inner.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

struct Sleeper {
    scheduler: Weak<Scheduler>,
    deadline: Duration,
    key: Option<u64>,
}

impl Future for Sleeper {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        // Nothing can wake the sleeper once the scheduler is gone
        let Some(scheduler) = self.scheduler.upgrade() else {
            return Poll::Pending;
        };
        let current = scheduler.current_time();
        if current >= self.deadline {
            if let Some(key) = self.key.take() {
                scheduler.cancel(key);
            }
            return Poll::Ready(());
        }
        if self.key.is_none() {
            let key = scheduler.enqueue(
                self.deadline - current,
                Continuation::Wake(cx.waker().clone()),
            );
            self.key = Some(key);
        }
        Poll::Pending
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.cancel(key);
        }
    }
}

impl Clock for TestScope {
    fn current(&self) -> Duration {
        self.current_time()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self
            .current()
            .checked_add(duration)
            .expect("overflow when setting wake time");
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline: Duration) -> impl Future<Output = ()> + Send + 'static {
        Sleeper {
            scheduler: Arc::downgrade(self.scheduler()),
            deadline,
            key: None,
        }
    }
}

/// Implementation of [crate::Runner] that drives a root task on a fresh [TestScope].
#[derive(Default)]
pub struct Runner {
    cfg: Config,
}

impl Runner {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

impl From<Config> for Runner {
    fn from(cfg: Config) -> Self {
        Self::new(cfg)
    }
}

impl crate::Runner for Runner {
    type Context = TestScope;

    fn start<F, Fut>(self, f: F) -> Result<Fut::Output, Error>
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let scope = TestScope::new(self.cfg);
        let root = f(scope.clone());
        let handle = scope.clone().spawn(|_| root);

        // Drive the schedule until nothing is left to do
        let elapsed = scope.advance_until_idle();
        debug!(?elapsed, "schedule idle");
        scope.cleanup_test_coroutines()?;

        // Cleanup guarantees the root finished
        handle.now_or_never().unwrap_or(Err(Error::ActiveTasks(1)))
    }
}
