//! Task records: identity, lifecycle state machine, and wake dedup.
//!
//! A task owns its boxed future (the continuation) and a small state
//! machine. The schedule state provides wake coalescing: a task is never
//! queued twice, and a wake that lands while the task is mid-poll re-queues
//! it when the poll returns instead of letting a second worker enter it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use tracing::{error, trace};

use super::queue::TaskQueue;

/// Monotonic task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Observable task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never polled.
    Init,
    /// Queued for execution.
    Ready,
    /// A worker is polling it.
    Running,
    /// Parked on a suspension point.
    Suspended,
    /// Ran to completion.
    Complete,
    /// Panicked during a poll.
    Faulted,
}

impl TaskState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Complete,
            5 => Self::Faulted,
            _ => Self::Init,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Ready => 1,
            Self::Running => 2,
            Self::Suspended => 3,
            Self::Complete => 4,
            Self::Faulted => 5,
        }
    }
}

/// Wake-coalescing state.
///
/// `Idle → Queued` on wake, `Queued → Polling` when a worker picks the
/// task up, `Polling → Idle` on a quiet poll exit, `Polling → Notified →
/// Queued` when a wake raced the poll.
#[derive(Debug)]
struct ScheduleState(AtomicU8);

impl ScheduleState {
    const IDLE: u8 = 0;
    const QUEUED: u8 = 1;
    const POLLING: u8 = 2;
    const NOTIFIED: u8 = 3;
    const DONE: u8 = 4;

    const fn new() -> Self {
        Self(AtomicU8::new(Self::IDLE))
    }

    /// Returns `true` when the caller must enqueue the task.
    fn notify(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::Acquire);
            let (next, enqueue) = match current {
                Self::IDLE => (Self::QUEUED, true),
                Self::POLLING => (Self::NOTIFIED, false),
                _ => return false,
            };
            if self
                .0
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return enqueue;
            }
        }
    }

    fn begin_poll(&self) {
        self.0.store(Self::POLLING, Ordering::Release);
    }

    /// Returns `true` when the task must be re-enqueued.
    fn finish_poll(&self) -> bool {
        self.0
            .compare_exchange(
                Self::POLLING,
                Self::IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_or_else(
                |_| {
                    // A wake landed mid-poll.
                    self.0.store(Self::QUEUED, Ordering::Release);
                    true
                },
                |_| false,
            )
    }

    fn complete(&self) {
        self.0.store(Self::DONE, Ordering::Release);
    }
}

/// What a harnessed future reports back to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Done,
    Faulted,
}

/// A schedulable unit: a harnessed future plus lifecycle bookkeeping.
pub(crate) struct Task {
    id: TaskId,
    pin: Option<usize>,
    state: AtomicU8,
    sched: ScheduleState,
    future: Mutex<Option<Pin<Box<dyn Future<Output = PollOutcome> + Send>>>>,
    queue: Arc<TaskQueue>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("pin", &self.pin)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub(crate) fn new<F>(queue: Arc<TaskQueue>, future: F, pin: Option<usize>) -> Arc<Self>
    where
        F: Future<Output = PollOutcome> + Send + 'static,
    {
        let task = Arc::new(Self {
            id: TaskId::next(),
            pin,
            state: AtomicU8::new(TaskState::Init.as_u8()),
            sched: ScheduleState::new(),
            future: Mutex::new(Some(Box::pin(future))),
            queue,
        });
        task.queue.register_task(&task);
        task
    }

    /// Wraps a bare callback (timer expiry) into a task.
    pub(crate) fn from_callback(queue: Arc<TaskQueue>, callback: crate::timer::TimerCallback) -> Arc<Self> {
        Self::new(
            queue,
            Harness::new(
                async move {
                    callback();
                },
                None::<Arc<JoinState<()>>>,
            ),
            None,
        )
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn pin(&self) -> Option<usize> {
        self.pin
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Enqueues the task unless it is already queued or mid-poll.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.sched.notify() {
            self.set_state(TaskState::Ready);
            self.queue.push(Arc::clone(self));
        }
    }

    /// Polls the task once on the calling worker.
    pub(crate) fn run(self: &Arc<Self>) {
        self.sched.begin_poll();
        let Some(mut future) = self.future.lock().take() else {
            return;
        };
        self.set_state(TaskState::Running);

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(PollOutcome::Done) => {
                self.set_state(TaskState::Complete);
                self.sched.complete();
                self.queue.unregister_task(self.id);
                trace!(id = %self.id, "task complete");
            }
            Poll::Ready(PollOutcome::Faulted) => {
                self.set_state(TaskState::Faulted);
                self.sched.complete();
                self.queue.unregister_task(self.id);
                error!(id = %self.id, "task faulted");
            }
            Poll::Pending => {
                *self.future.lock() = Some(future);
                self.set_state(TaskState::Suspended);
                if self.sched.finish_poll() {
                    self.set_state(TaskState::Ready);
                    self.queue.push(Arc::clone(self));
                }
            }
        }
    }

    /// Drops the stored future (shutdown path). Legal only once no worker
    /// can be polling the task.
    pub(crate) fn abort(&self) {
        let future = self.future.lock().take();
        if future.is_some() {
            self.set_state(TaskState::Complete);
            self.sched.complete();
        }
        drop(future);
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// Why a join handle produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The task was dropped before completing (runtime shutdown).
    Cancelled,
    /// The task panicked; the payload's message is attached.
    Panicked(String),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("task cancelled"),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

impl std::error::Error for JoinError {}

#[derive(Debug)]
pub(crate) struct JoinState<T> {
    inner: Mutex<JoinInner<T>>,
}

#[derive(Debug)]
struct JoinInner<T> {
    result: Option<Result<T, JoinError>>,
    waker: Option<Waker>,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JoinInner {
                result: None,
                waker: None,
            }),
        })
    }

    pub(crate) fn complete(&self, result: Result<T, JoinError>) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.result = Some(result);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>> {
        let mut inner = self.inner.lock();
        match inner.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Awaits a spawned task's output.
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: TaskId,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: TaskId, state: Arc<JoinState<T>>) -> Self {
        Self { id, state }
    }

    /// Identity of the underlying task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.poll_result(cx)
    }
}

/// Adapter that harnesses a user future: catches panics, routes the output
/// to the join state, and reports the poll outcome to the worker.
pub(crate) struct Harness<F: Future> {
    future: Pin<Box<F>>,
    join: Option<Arc<JoinState<F::Output>>>,
}

impl<F: Future> Harness<F> {
    pub(crate) fn new(future: F, join: Option<Arc<JoinState<F::Output>>>) -> Self {
        Self {
            future: Box::pin(future),
            join,
        }
    }
}

impl<F: Future> Future for Harness<F> {
    type Output = PollOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = std::panic::catch_unwind(AssertUnwindSafe(|| this.future.as_mut().poll(cx)));
        match poll {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                if let Some(join) = this.join.take() {
                    join.complete(Ok(value));
                }
                Poll::Ready(PollOutcome::Done)
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                if let Some(join) = this.join.take() {
                    join.complete(Err(JoinError::Panicked(message)));
                }
                Poll::Ready(PollOutcome::Faulted)
            }
        }
    }
}

impl<F: Future> Drop for Harness<F> {
    fn drop(&mut self) {
        // A harness dropped before completion (queue drain on shutdown)
        // cancels its join handle.
        if let Some(join) = self.join.take() {
            join.complete(Err(JoinError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_monotonic() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn schedule_state_coalesces_wakes() {
        let sched = ScheduleState::new();
        assert!(sched.notify(), "first wake enqueues");
        assert!(!sched.notify(), "second wake coalesces");
        sched.begin_poll();
        assert!(!sched.notify(), "wake during poll defers");
        assert!(sched.finish_poll(), "deferred wake re-enqueues");
        sched.begin_poll();
        assert!(!sched.finish_poll(), "quiet poll exits idle");
    }

    #[test]
    fn task_lifecycle_through_run() {
        let queue = Arc::new(TaskQueue::new());
        let task = Task::new(
            Arc::clone(&queue),
            Harness::new(async { 5usize }, None),
            None,
        );
        assert_eq!(task.state(), TaskState::Init);
        task.schedule();
        assert_eq!(task.state(), TaskState::Ready);
        let (popped, _) = queue.pop_for(None);
        let popped = popped.expect("task queued");
        popped.run();
        assert_eq!(popped.state(), TaskState::Complete);
    }

    #[test]
    fn panicking_task_faults_and_completes_join() {
        let queue = Arc::new(TaskQueue::new());
        let join = JoinState::<()>::new();
        let task = Task::new(
            Arc::clone(&queue),
            Harness::new(
                async {
                    panic!("boom in task");
                },
                Some(Arc::clone(&join)),
            ),
            None,
        );
        task.schedule();
        let (popped, _) = queue.pop_for(None);
        popped.expect("queued").run();

        let result = join.inner.lock().result.take().expect("join completed");
        assert_eq!(result, Err(JoinError::Panicked("boom in task".into())));
    }

    #[test]
    fn dropped_harness_cancels_join() {
        let join = JoinState::<u32>::new();
        drop(Harness::new(async { 1u32 }, Some(Arc::clone(&join))));
        let result = join.inner.lock().result.take().expect("join completed");
        assert_eq!(result, Err(JoinError::Cancelled));
    }
}
