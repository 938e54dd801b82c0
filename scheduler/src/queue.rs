//! Ordered collection of work waiting on the virtual clock.

use std::{cmp::Ordering, collections::BinaryHeap, fmt, mem, task::Waker, time::Duration};

/// An opaque unit of work that is resumed once it becomes due.
///
/// Resuming consumes the continuation, so it can never run twice.
pub enum Continuation {
    /// Wake a suspended future.
    Wake(Waker),
    /// Run a closure to completion.
    Run(Box<dyn FnOnce() + Send + 'static>),
}

impl Continuation {
    /// Wrap a closure in a [Continuation].
    pub fn run<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Run(Box::new(f))
    }

    /// Resume the work.
    pub fn resume(self) {
        match self {
            Self::Wake(waker) => waker.wake(),
            Self::Run(f) => f(),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wake(_) => f.write_str("Continuation::Wake"),
            Self::Run(_) => f.write_str("Continuation::Run"),
        }
    }
}

/// A [Continuation] waiting for the clock to reach `due`.
#[derive(Debug)]
pub struct ScheduledTask {
    due: Duration,
    sequence: u64,
    continuation: Continuation,
}

impl ScheduledTask {
    pub(crate) fn new(due: Duration, sequence: u64, continuation: Continuation) -> Self {
        Self {
            due,
            sequence,
            continuation,
        }
    }

    /// Virtual time at which the task becomes eligible to run.
    pub fn due(&self) -> Duration {
        self.due
    }

    /// Position of the task in enqueue order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Consume the task, returning the work to resume.
    pub fn into_continuation(self) -> Continuation {
        self.continuation
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse the ordering for min-heap
        (other.due, other.sequence).cmp(&(self.due, self.sequence))
    }
}

/// Pending [ScheduledTask]s ordered by `(due, sequence)` ascending.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<ScheduledTask>,
}

impl TaskQueue {
    /// Insert a task.
    pub fn push(&mut self, task: ScheduledTask) {
        self.heap.push(task);
    }

    /// Due time of the earliest task, if any.
    pub fn peek_due(&self) -> Option<Duration> {
        self.heap.peek().map(|task| task.due)
    }

    /// Remove the earliest task if it is due at `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<ScheduledTask> {
        if self.peek_due()? > now {
            return None;
        }
        self.heap.pop()
    }

    /// Remove the earliest task regardless of its due time.
    pub fn pop(&mut self) -> Option<ScheduledTask> {
        self.heap.pop()
    }

    /// Remove the task enqueued with `sequence`, if it is still pending.
    pub fn remove(&mut self, sequence: u64) -> Option<ScheduledTask> {
        let (removed, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|task| task.sequence == sequence);
        self.heap = kept.into();
        removed.into_iter().next()
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no task is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn task(due: u64, sequence: u64) -> ScheduledTask {
        ScheduledTask::new(
            Duration::from_millis(due),
            sequence,
            Continuation::Wake(noop_waker()),
        )
    }

    #[test]
    fn test_min_heap_breaks_ties_by_sequence() {
        // Populate queue out of order
        let mut queue = TaskQueue::default();
        for (due, sequence) in [(10, 0), (5, 1), (15, 2), (5, 3), (10, 4)] {
            queue.push(task(due, sequence));
        }
        assert_eq!(queue.len(), 5);

        // Verify extraction order
        let mut order = Vec::new();
        while let Some(task) = queue.pop() {
            order.push((task.due().as_millis() as u64, task.sequence()));
        }
        assert_eq!(order, vec![(5, 1), (5, 3), (10, 0), (10, 4), (15, 2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_due_respects_now() {
        let mut queue = TaskQueue::default();
        queue.push(task(100, 0));
        queue.push(task(50, 1));

        assert!(queue.pop_due(Duration::from_millis(49)).is_none());
        let first = queue.pop_due(Duration::from_millis(50)).unwrap();
        assert_eq!(first.sequence(), 1);
        assert!(queue.pop_due(Duration::from_millis(50)).is_none());
        assert_eq!(queue.peek_due(), Some(Duration::from_millis(100)));

        let second = queue.pop_due(Duration::from_millis(500)).unwrap();
        assert_eq!(second.sequence(), 0);
        assert!(queue.pop_due(Duration::from_millis(500)).is_none());
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut queue = TaskQueue::default();
        for (due, sequence) in [(10, 0), (5, 1), (5, 2), (20, 3)] {
            queue.push(task(due, sequence));
        }
        assert_eq!(queue.remove(1).map(|task| task.sequence()), Some(1));
        assert!(queue.remove(1).is_none());
        assert!(queue.remove(42).is_none());
        assert_eq!(queue.len(), 3);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|task| task.sequence())
            .collect();
        assert_eq!(order, vec![2, 0, 3]);
    }

    #[test]
    fn test_resume_runs_closure_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let continuation = Continuation::run(move || tx.send(7).unwrap());
        continuation.resume();
        assert_eq!(rx.try_recv(), Ok(7));
        assert!(rx.try_recv().is_err());
    }
}
