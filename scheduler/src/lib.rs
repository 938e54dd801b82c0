//! Drive asynchronous tests to completion on a deterministic virtual clock.
//!
//! Asynchronous code under test suspends for durations of virtual time instead of
//! real time. The test advances a [Scheduler] explicitly and every piece of work
//! resumes exactly when it becomes due, ordered by due time and then by the
//! order in which it was scheduled.
//!
//! Failures raised by detached tasks never reach the test's call stack directly.
//! Instead, they are routed through an [ExceptionHandler] that is linked to the
//! [TestScope] owning the schedule and surfaced when that scope is cleaned up.
//!
//! # Terminology
//!
//! A [scope::Runner] builds a [TestScope] and drives a root task to completion. The
//! [TestScope] implements the other traits ([Spawner], [Clock], [Metrics]) and
//! exposes the clock controls of its [Scheduler] and [Dispatcher].
//!
//! # Example
//!
//! ```rust
//! use vtime_scheduler::{scope, Clock, Runner};
//! use std::time::Duration;
//!
//! let executor = scope::Runner::default();
//! let elapsed = executor
//!     .start(|context| async move {
//!         let start = context.current();
//!         context.sleep(Duration::from_secs(60)).await;
//!         context.current() - start
//!     })
//!     .unwrap();
//! assert_eq!(elapsed, Duration::from_secs(60));
//! ```
//!
//! # Status
//!
//! `vtime-scheduler` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use prometheus_client::registry::Metric;
use std::{future::Future, time::Duration};
use thiserror::Error;

pub mod dispatcher;
pub mod handler;
pub mod queue;
pub mod scheduler;
pub mod scope;
mod utils;
pub use dispatcher::Dispatcher;
pub use handler::{set_fallback_reporter, ExceptionHandler, FailureContext, Owner};
pub use queue::{Continuation, ScheduledTask, TaskQueue};
pub use scheduler::{Auditor, Scheduler};
pub use scope::TestScope;
pub use utils::*;

/// Prefix for scheduler metrics.
const METRICS_PREFIX: &str = "scheduler";

/// Errors that can occur when driving a test schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("test scope finished")]
    ScopeFinished,
    #[error("uncompleted coroutines: {0} tasks scheduled but never reached")]
    UncompletedCoroutines(usize),
    #[error("test finished with {0} active tasks")]
    ActiveTasks(usize),
    #[error("exited")]
    Exited,
    #[error("closed")]
    Closed,
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("uncaught failure: {first} ({} suppressed)", .suppressed.len())]
    Uncaught {
        first: Box<Error>,
        suppressed: Vec<Error>,
    },
}

/// Interface that any test driver must implement to start running tasks.
pub trait Runner {
    /// Context defines the environment available to tasks.
    type Context;

    /// Run a root task until no more work is scheduled, then clean up.
    ///
    /// Returns the root task's output, or the first failure observed while
    /// cleaning up.
    fn start<F, Fut>(self, f: F) -> Result<Fut::Output, Error>
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static;
}

/// Interface that any task scheduler must implement to spawn tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Spawn a task with the current context.
    ///
    /// The task is dispatched immediately. It runs right away unless the
    /// dispatcher is paused (or the scheduler is already resuming work, in which
    /// case it runs later in the same pass).
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

/// Interface to register and encode metrics.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// It is not permitted for any implementation to use `METRICS_PREFIX` as the start of a
    /// label (reserved for metrics for the scheduler).
    fn with_label(&self, label: &str) -> Self;

    /// Register a metric with the scope.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}

/// Interface that any task scheduler must implement to provide
/// time-based operations.
///
/// Time is measured from the start of the schedule.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn current(&self) -> Duration;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;

    /// Sleep until the given deadline.
    fn sleep_until(&self, deadline: Duration) -> impl Future<Output = ()> + Send + 'static;
}
