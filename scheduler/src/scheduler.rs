//! A virtual clock that decides when (and in what order) scheduled work runs.
//!
//! Work is resumed synchronously on the thread that drives the clock. Tasks due
//! at the same time run in the order they were enqueued, and the clock always
//! lands exactly on each task's due time before resuming it.
//!
//! # Example
//!
//! ```rust
//! use vtime_scheduler::{Continuation, Scheduler};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::default();
//! scheduler.enqueue(Duration::from_millis(10), Continuation::run(|| println!("ran")));
//! assert_eq!(scheduler.advance_time_by(Duration::from_millis(25)), Duration::from_millis(25));
//! assert!(scheduler.is_idle());
//! ```

use crate::{
    queue::{Continuation, ScheduledTask, TaskQueue},
    Error,
};
use commonware_utils::hex;
use sha2::{Digest, Sha256};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::trace;

/// Track the order in which work is scheduled and resumed for determinism auditing.
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self {
            hash: Vec::new().into(),
        }
    }
}

impl Auditor {
    fn record(&self, event: &[u8], due: Duration, sequence: u64) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(event);
        hasher.update(due.as_nanos().to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        *hash = hasher.finalize().to_vec();
    }

    fn enqueue(&self, due: Duration, sequence: u64) {
        self.record(b"enqueue", due, sequence);
    }

    fn resume(&self, due: Duration, sequence: u64) {
        self.record(b"resume", due, sequence);
    }

    fn cancel(&self, due: Duration, sequence: u64) {
        self.record(b"cancel", due, sequence);
    }

    fn advance(&self, now: Duration) {
        self.record(b"advance", now, 0);
    }

    /// Generate a representation of everything scheduled and resumed so far.
    ///
    /// Two runs that interact with the clock identically produce the same state.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap().clone();
        hex(&hash)
    }
}

struct State {
    time: Duration,
    sequence: u64,
    queue: TaskQueue,
    draining: bool,
}

/// Virtual clock scheduler.
pub struct Scheduler {
    state: Mutex<State>,
    auditor: Arc<Auditor>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Arc::new(Auditor::default()))
    }
}

impl Scheduler {
    /// Create a scheduler at time zero that records activity into `auditor`.
    pub fn new(auditor: Arc<Auditor>) -> Self {
        Self {
            state: Mutex::new(State {
                time: Duration::ZERO,
                sequence: 0,
                queue: TaskQueue::default(),
                draining: false,
            }),
            auditor,
        }
    }

    pub fn auditor(&self) -> &Arc<Auditor> {
        &self.auditor
    }

    /// Current virtual time.
    pub fn current_time(&self) -> Duration {
        self.state.lock().unwrap().time
    }

    /// Schedule `continuation` to run `delay` after the current time.
    ///
    /// Returns a key that can be passed to [Scheduler::cancel].
    pub fn enqueue(&self, delay: Duration, continuation: Continuation) -> u64 {
        let (due, sequence) = {
            let mut state = self.state.lock().unwrap();
            let due = state
                .time
                .checked_add(delay)
                .expect("overflow when scheduling task");
            let sequence = state.sequence;
            state.sequence = sequence.checked_add(1).expect("task sequence overflow");
            state
                .queue
                .push(ScheduledTask::new(due, sequence, continuation));
            (due, sequence)
        };
        self.auditor.enqueue(due, sequence);
        trace!(?due, sequence, "enqueued task");
        sequence
    }

    /// Drop the task enqueued under `key` without resuming it.
    ///
    /// Returns `false` if the task already ran or was cancelled.
    pub fn cancel(&self, key: u64) -> bool {
        let removed = self.state.lock().unwrap().queue.remove(key);
        let Some(task) = removed else {
            return false;
        };
        self.auditor.cancel(task.due(), key);
        trace!(due = ?task.due(), sequence = key, "cancelled task");

        // Dropping the continuation may release futures that cancel their own
        // work, so the lock must not be held here.
        drop(task);
        true
    }

    /// Resume every task that is already due, without moving the clock.
    ///
    /// Tasks enqueued by resumed work run in the same pass if they are due.
    pub fn run_current(&self) {
        let _draining = Draining::enter(self);
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                let now = state.time;
                state.queue.pop_due(now)
            };
            let Some(task) = task else {
                break;
            };
            let (due, sequence) = (task.due(), task.sequence());
            self.auditor.resume(due, sequence);
            trace!(?due, sequence, "resuming task");

            // The lock is released while user work runs so it may enqueue more work.
            task.into_continuation().resume();
        }
    }

    /// Move the clock forward by `delay`, resuming every task due on the way.
    ///
    /// The clock stops at each task's due time before resuming it. Returns the
    /// amount of virtual time that elapsed.
    pub fn advance_time_by(&self, delay: Duration) -> Duration {
        let start = self.current_time();
        let target = start
            .checked_add(delay)
            .expect("overflow when advancing time");
        while self.jump_to_next(Some(target)) {
            self.run_current();
        }

        let now = {
            let mut state = self.state.lock().unwrap();
            if state.time < target {
                state.time = target;
            }
            state.time
        };
        self.auditor.advance(now);
        trace!(?now, "time advanced");
        now - start
    }

    /// Resume tasks (moving the clock to each due time) until none remain.
    ///
    /// Returns the amount of virtual time that elapsed.
    pub fn advance_until_idle(&self) -> Duration {
        let start = self.current_time();
        loop {
            self.run_current();
            if !self.jump_to_next(None) {
                break;
            }
        }
        self.current_time() - start
    }

    /// Returns `true` if nothing is scheduled.
    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    /// Number of scheduled tasks that have not yet run.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Flush due work and fail if anything is still scheduled for later.
    pub fn cleanup(&self) -> Result<(), Error> {
        self.run_current();
        match self.pending() {
            0 => Ok(()),
            pending => Err(Error::UncompletedCoroutines(pending)),
        }
    }

    /// Returns `true` while [Scheduler::run_current] is resuming work.
    pub(crate) fn is_draining(&self) -> bool {
        self.state.lock().unwrap().draining
    }

    /// Move the clock to the earliest due time (if it is not beyond `limit`).
    ///
    /// Returns `false` if there is no such task.
    fn jump_to_next(&self, limit: Option<Duration>) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(due) = state.queue.peek_due() else {
            return false;
        };
        if limit.is_some_and(|limit| due > limit) {
            return false;
        }
        if due > state.time {
            state.time = due;
            drop(state);
            self.auditor.advance(due);
            trace!(now = ?due, "time skipped");
        }
        true
    }
}

/// Marks the scheduler as draining, restoring the previous mark on drop.
struct Draining<'a> {
    scheduler: &'a Scheduler,
    previous: bool,
}

impl<'a> Draining<'a> {
    fn enter(scheduler: &'a Scheduler) -> Self {
        let mut state = scheduler.state.lock().unwrap();
        let previous = state.draining;
        state.draining = true;
        Self {
            scheduler,
            previous,
        }
    }
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        // Avoid a double panic if the lock was poisoned while unwinding.
        if let Ok(mut state) = self.scheduler.state.lock() {
            state.draining = self.previous;
        }
    }
}
