//! The shared task queue.
//!
//! A single FIFO protected by a mutex, scanned once per pop. A task may be
//! pinned to a specific worker; the scan takes the first entry whose pin is
//! absent or matches the popping worker and reports whether it skipped an
//! entry pinned elsewhere; the caller turns that into a tickle so the
//! owning worker gets a chance to wake. Tasks that are mid-poll never
//! appear here: wake coalescing re-enqueues them only after their poll
//! returns.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use super::task::Task;

/// Shared FIFO of runnable tasks, plus the registry of every live task.
///
/// The registry exists for shutdown: a suspended task's stored waker
/// points back at the task, a cycle only breakable by dropping the
/// future, so teardown walks the registry and aborts what is left.
pub(crate) struct TaskQueue {
    inner: Mutex<VecDeque<Arc<Task>>>,
    registry: Mutex<HashMap<u64, Weak<Task>>>,
    stopping: AtomicBool,
    signal: OnceLock<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.inner.lock().len())
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            registry: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            signal: OnceLock::new(),
        }
    }

    pub(crate) fn register_task(&self, task: &Arc<Task>) {
        self.registry
            .lock()
            .insert(task.id().as_u64(), Arc::downgrade(task));
    }

    pub(crate) fn unregister_task(&self, id: super::task::TaskId) {
        self.registry.lock().remove(&id.as_u64());
    }

    /// Drains the registry, upgrading whatever is still alive.
    pub(crate) fn take_live_tasks(&self) -> Vec<Arc<Task>> {
        self.registry
            .lock()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Installs the wakeup hook fired after every enqueue.
    pub(crate) fn set_signal(&self, signal: Arc<dyn Fn() + Send + Sync>) {
        let _ = self.signal.set(signal);
    }

    fn fire_signal(&self) {
        if let Some(signal) = self.signal.get() {
            signal();
        }
    }

    /// Enqueues one task. On a stopping queue the task is dropped instead,
    /// which cancels its join handle.
    pub(crate) fn push(&self, task: Arc<Task>) {
        if self.stopping.load(Ordering::Acquire) {
            drop(task);
            return;
        }
        self.inner.lock().push_back(task);
        self.fire_signal();
    }

    /// Enqueues a batch under a single lock acquisition.
    pub(crate) fn push_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Arc<Task>>,
    {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        let mut pushed = false;
        {
            let mut queue = self.inner.lock();
            for task in tasks {
                queue.push_back(task);
                pushed = true;
            }
        }
        if pushed {
            self.fire_signal();
        }
    }

    /// Pops the first task runnable by `worker`. The second return value is
    /// the tickle hint: `true` when an entry pinned to a different worker
    /// was passed over.
    pub(crate) fn pop_for(&self, worker: Option<usize>) -> (Option<Arc<Task>>, bool) {
        let mut queue = self.inner.lock();
        let mut skipped_pinned = false;
        let mut found = None;
        for (index, task) in queue.iter().enumerate() {
            match task.pin() {
                Some(pin) if worker != Some(pin) => skipped_pinned = true,
                _ => {
                    found = Some(index);
                    break;
                }
            }
        }
        (found.and_then(|index| queue.remove(index)), skipped_pinned)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Empties the queue, returning the leftovers so the caller can drop
    /// them outside the lock.
    pub(crate) fn drain_all(&self) -> Vec<Arc<Task>> {
        self.inner.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::Harness;
    use std::sync::atomic::AtomicUsize;

    fn noop_task(queue: &Arc<TaskQueue>, pin: Option<usize>) -> Arc<Task> {
        Task::new(
            Arc::clone(queue),
            Harness::new(async {}, None::<Arc<crate::runtime::task::JoinState<()>>>),
            pin,
        )
    }

    #[test]
    fn fifo_order_for_unpinned() {
        let queue = Arc::new(TaskQueue::new());
        let a = noop_task(&queue, None);
        let b = noop_task(&queue, None);
        let (ida, idb) = (a.id(), b.id());
        queue.push(a);
        queue.push(b);
        assert_eq!(queue.pop_for(None).0.map(|t| t.id()), Some(ida));
        assert_eq!(queue.pop_for(None).0.map(|t| t.id()), Some(idb));
    }

    #[test]
    fn pinned_task_skipped_with_tickle_hint() {
        let queue = Arc::new(TaskQueue::new());
        let pinned = noop_task(&queue, Some(3));
        let free = noop_task(&queue, None);
        let free_id = free.id();
        queue.push(pinned);
        queue.push(free);

        let (task, tickle) = queue.pop_for(Some(0));
        assert_eq!(task.map(|t| t.id()), Some(free_id));
        assert!(tickle, "skipping a foreign pin must request a tickle");

        let (task, tickle) = queue.pop_for(Some(3));
        assert!(task.is_some(), "owner pops its pinned task");
        assert!(!tickle);
        assert!(queue.is_empty());
    }

    #[test]
    fn stopping_queue_drops_pushes() {
        let queue = Arc::new(TaskQueue::new());
        queue.set_stopping();
        queue.push(noop_task(&queue, None));
        assert!(queue.is_empty());
    }

    #[test]
    fn batch_push_signals_once() {
        let queue = Arc::new(TaskQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        queue.set_signal(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let tasks: Vec<_> = (0..4).map(|_| noop_task(&queue, None)).collect();
        queue.push_batch(tasks);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 4);
    }
}
