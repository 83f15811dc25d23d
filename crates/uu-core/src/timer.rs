use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// A unit of work posted to a [`TimerWorker`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle identifying a posted task so it can be removed before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A single serialized execution context that runs work after a delay.
///
/// Work posted to one worker runs on that worker's thread, one task at a time.
/// Neither method may block on the posted work.
pub trait TimerWorker: Send + Sync {
    /// Schedule `task` to run after `delay` and return immediately.
    fn post_delayed(&self, delay: Duration, task: Task) -> TaskId;

    /// Cancel a posted task. No-op if it already ran or is unknown.
    fn remove(&self, id: TaskId);
}

/// Deterministic worker for tests: posted tasks only run when triggered.
///
/// Delays are recorded but never waited on.
#[derive(Default)]
pub struct ManualTimerWorker {
    inner: Mutex<ManualQueue>,
}

#[derive(Default)]
struct ManualQueue {
    next_id: u64,
    queued: VecDeque<QueuedTask>,
}

struct QueuedTask {
    id: TaskId,
    delay: Duration,
    removed: bool,
    task: Task,
}

impl ManualTimerWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, ManualQueue> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of tasks posted and not yet run or removed.
    pub fn pending_count(&self) -> usize {
        self.queue().queued.iter().filter(|t| !t.removed).count()
    }

    /// Delays of the pending tasks, in posting order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.queue()
            .queued
            .iter()
            .filter(|t| !t.removed)
            .map(|t| t.delay)
            .collect()
    }

    /// Run the oldest pending task. Returns `false` when nothing was pending.
    /// Removed tasks are discarded.
    pub fn run_next(&self) -> bool {
        let task = {
            let mut queue = self.queue();
            queue.queued.retain(|t| !t.removed);
            queue.queued.pop_front()
        };
        match task {
            Some(queued) => {
                (queued.task)();
                true
            }
            None => false,
        }
    }

    /// Run every task that is pending right now, in FIFO order, discarding
    /// removed ones. Tasks posted while these run stay queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let due: Vec<TaskId> = {
            let mut queue = self.queue();
            queue.queued.retain(|t| !t.removed);
            queue.queued.iter().map(|t| t.id).collect()
        };

        let mut ran = 0;
        for id in due {
            let task = {
                let mut queue = self.queue();
                queue
                    .queued
                    .iter()
                    .position(|t| t.id == id && !t.removed)
                    .and_then(|index| queue.queued.remove(index))
            };
            if let Some(queued) = task {
                (queued.task)();
                ran += 1;
            }
        }
        ran
    }

    /// Run every queued task including removed ones not yet discarded,
    /// simulating work that fires after its cancellation raced with it.
    /// Returns how many ran.
    pub fn force_run_all(&self) -> usize {
        let drained: Vec<QueuedTask> = self.queue().queued.drain(..).collect();
        let ran = drained.len();
        for queued in drained {
            (queued.task)();
        }
        ran
    }
}

impl TimerWorker for ManualTimerWorker {
    fn post_delayed(&self, delay: Duration, task: Task) -> TaskId {
        let mut queue = self.queue();
        queue.next_id += 1;
        let id = TaskId(queue.next_id);
        queue.queued.push_back(QueuedTask {
            id,
            delay,
            removed: false,
            task,
        });
        id
    }

    fn remove(&self, id: TaskId) {
        if let Some(queued) = self.queue().queued.iter_mut().find(|t| t.id == id) {
            queued.removed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn nothing_runs_until_triggered() {
        let worker = ManualTimerWorker::new();
        let count = Arc::new(AtomicUsize::new(0));
        worker.post_delayed(Duration::from_millis(50), counting_task(&count));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(worker.pending_delays(), vec![Duration::from_millis(50)]);
        assert_eq!(worker.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(worker.pending_count(), 0);
    }

    #[test]
    fn runs_in_posting_order() {
        let worker = ManualTimerWorker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            worker.post_delayed(
                Duration::ZERO,
                Box::new(move || order.lock().expect("lock").push(n)),
            );
        }
        assert!(worker.run_next());
        assert_eq!(worker.run_pending(), 2);
        assert!(!worker.run_next());
        assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[test]
    fn removed_tasks_are_skipped_unless_forced() {
        let worker = ManualTimerWorker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = worker.post_delayed(Duration::ZERO, counting_task(&count));
        worker.remove(id);
        worker.remove(TaskId::new(999));

        assert_eq!(worker.pending_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(worker.force_run_all(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn running_discards_removed_tasks() {
        let worker = ManualTimerWorker::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let id = worker.post_delayed(Duration::ZERO, counting_task(&count));
            worker.remove(id);
        }
        assert_eq!(worker.run_pending(), 0);
        let id = worker.post_delayed(Duration::ZERO, counting_task(&count));
        worker.remove(id);
        assert!(!worker.run_next());

        assert_eq!(worker.force_run_all(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
