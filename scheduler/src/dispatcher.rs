//! Pause/resume facade over a [Scheduler].
//!
//! While resumed, work dispatched for the current time runs as soon as it is
//! dispatched. While paused, dispatched work waits until the clock is driven
//! explicitly ([Dispatcher::run_current], [Dispatcher::advance_time_by], or
//! [Dispatcher::advance_until_idle]).

use crate::{queue::Continuation, Error, Scheduler};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// Dispatches work onto a [Scheduler], optionally deferring it while paused.
pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    paused: AtomicBool,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<Scheduler>, paused: bool) -> Self {
        Self {
            scheduler,
            paused: AtomicBool::new(paused),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Dispatch `continuation` at the current time.
    pub fn dispatch(&self, continuation: Continuation) {
        self.scheduler.enqueue(Duration::ZERO, continuation);
        self.flush();
    }

    /// Dispatch `continuation` after `delay`. It only runs once the clock is advanced.
    pub fn dispatch_after(&self, delay: Duration, continuation: Continuation) {
        self.scheduler.enqueue(delay, continuation);
    }

    /// Run due work unless paused or a pass is already in progress (which will
    /// pick it up).
    fn flush(&self) {
        if self.is_paused() || self.scheduler.is_draining() {
            return;
        }
        self.scheduler.run_current();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop running dispatched work automatically.
    pub fn pause_dispatcher(&self) {
        debug!("dispatcher paused");
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Run dispatched work automatically again, starting with anything already due.
    pub fn resume_dispatcher(&self) {
        debug!("dispatcher resumed");
        self.paused.store(false, Ordering::SeqCst);
        self.flush();
    }

    /// Run `f` with the dispatcher paused, then restore the previous state.
    pub fn pause_dispatcher_while<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.paused.swap(true, Ordering::SeqCst);
        let result = {
            let _restore = Restore {
                paused: &self.paused,
                previous,
            };
            f()
        };
        if !previous {
            self.flush();
        }
        result
    }

    pub fn current_time(&self) -> Duration {
        self.scheduler.current_time()
    }

    pub fn run_current(&self) {
        self.scheduler.run_current()
    }

    pub fn advance_time_by(&self, delay: Duration) -> Duration {
        self.scheduler.advance_time_by(delay)
    }

    pub fn advance_until_idle(&self) -> Duration {
        self.scheduler.advance_until_idle()
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Flush due work and fail with [Error::UncompletedCoroutines] if work remains.
    pub fn cleanup_test_coroutines(&self) -> Result<(), Error> {
        self.scheduler.cleanup()
    }
}

/// Restores the paused flag on drop (including while unwinding).
struct Restore<'a> {
    paused: &'a AtomicBool,
    previous: bool,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        self.paused.store(self.previous, Ordering::SeqCst);
    }
}
