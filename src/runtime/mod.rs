//! The worker-pool runtime.
//!
//! A [`Runtime`] owns a shared FIFO task queue, an I/O driver (reactor +
//! timer wheel), and `worker_threads` OS threads running the worker loop.
//! [`Runtime::block_on`] additionally folds the calling thread into the
//! pool for the duration of the root future: the "use caller" mode of
//! operation, and the usual way to drive a server to completion.
//!
//! [`Handle`] is the cheap clonable reference the rest of the crate (and
//! user code) schedules through. Workers install the current handle in
//! thread-local storage on entry; stream operations consult it to decide
//! whether suspension is available on this thread at all, which is what
//! keeps non-runtime threads on the plain blocking path.

pub(crate) mod queue;
pub(crate) mod task;
pub(crate) mod worker;

pub use task::{JoinError, JoinHandle, TaskId, TaskState};

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::driver::IoDriver;
use crate::timer::{Clock, TimerService};
use queue::TaskQueue;
use task::{Harness, JoinState, Task};
use worker::Parker;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// State shared between the runtime, its workers, and every handle.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) driver: Arc<IoDriver>,
    pub(crate) config: Arc<Config>,
    pub(crate) parkers: Mutex<Vec<Parker>>,
    pub(crate) idle: AtomicUsize,
    pub(crate) stopping: AtomicBool,
    pub(crate) worker_count: usize,
}

impl Shared {
    /// Wakes idle workers: breaks the I/O leader out of its kernel wait
    /// and unparks the followers. A no-op while every worker is busy.
    pub(crate) fn tickle(&self) {
        if self.idle.load(Ordering::Acquire) == 0 {
            return;
        }
        self.tickle_all();
    }

    /// Unconditional wakeup of every worker (shutdown path).
    pub(crate) fn tickle_all(&self) {
        self.driver.notify();
        for parker in self.parkers.lock().iter() {
            parker.unpark();
        }
    }

    pub(crate) fn begin_idle(&self) {
        self.idle.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_idle(&self) {
        self.idle.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clonable reference to a running runtime.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.shared.name)
            .field("workers", &self.shared.worker_count)
            .finish()
    }
}

impl Handle {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The runtime active on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread is not a runtime worker and is not
    /// inside [`Runtime::block_on`].
    #[must_use]
    pub fn current() -> Self {
        Self::try_current().expect("no weft runtime on this thread")
    }

    /// The runtime active on the calling thread, if any.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Installs this handle as the thread's current runtime until the
    /// guard drops.
    pub fn enter(&self) -> EnterGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        EnterGuard { previous }
    }

    /// Spawns a task on the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_with_pin(future, None)
    }

    /// Spawns a task pinned to one worker; only that worker will ever
    /// poll it.
    ///
    /// # Panics
    ///
    /// Panics when `worker` is out of range, a wrong-thread invariant
    /// violation, which is fatal by policy.
    pub fn spawn_pinned<F>(&self, worker: usize, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            worker < self.shared.worker_count,
            "pin target {worker} out of range ({} workers)",
            self.shared.worker_count
        );
        self.spawn_with_pin(future, Some(worker))
    }

    fn spawn_with_pin<F>(&self, future: F, pin: Option<usize>) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let join = JoinState::new();
        let task = Task::new(
            Arc::clone(&self.shared.queue),
            Harness::new(future, Some(Arc::clone(&join))),
            pin,
        );
        let id = task.id();
        task.schedule();
        JoinHandle::new(id, join)
    }

    /// The runtime's timer service.
    #[must_use]
    pub fn timers(&self) -> &Arc<TimerService> {
        self.shared.driver.timers()
    }

    /// The runtime's configuration registry.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.shared.config
    }

    /// The runtime's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of worker threads (not counting a `block_on` caller).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    pub(crate) fn driver(&self) -> &Arc<IoDriver> {
        &self.shared.driver
    }
}

/// Restores the previous thread-current handle on drop.
#[derive(Debug)]
pub struct EnterGuard {
    previous: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .finish()
    }
}

/// Configures and builds a [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    worker_threads: usize,
    name: String,
    config: Option<Arc<Config>>,
    clock: Clock,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Starts from one worker thread and the monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_threads: 1,
            name: "weft".to_string(),
            config: None,
            clock: Clock::Monotonic,
        }
    }

    /// Sets the worker thread count (minimum one).
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Names the runtime; worker threads are named `<name>-worker-<i>`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Supplies a configuration registry (a fresh default one otherwise).
    #[must_use]
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Substitutes the timer clock (manual clocks are for tests).
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the runtime and launches its workers.
    pub fn build(self) -> io::Result<Runtime> {
        let driver = IoDriver::new(self.clock)?;
        let queue = Arc::new(TaskQueue::new());
        let shared = Arc::new(Shared {
            name: self.name,
            queue: Arc::clone(&queue),
            driver,
            config: self.config.unwrap_or_default(),
            parkers: Mutex::new(Vec::new()),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            worker_count: self.worker_threads,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        queue.set_signal(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.tickle();
            }
        }));

        let mut threads = Vec::with_capacity(self.worker_threads);
        for index in 0..self.worker_threads {
            let parker = Parker::new();
            shared.parkers.lock().push(parker.clone());
            let worker_shared = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("{}-worker-{index}", worker_shared.name))
                .spawn(move || worker::run(&worker_shared, index, &parker))?;
            threads.push(thread);
        }
        info!(name = %shared.name, workers = self.worker_threads, "runtime started");
        Ok(Runtime {
            shared,
            threads: Mutex::new(threads),
        })
    }
}

/// The worker-pool runtime.
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// A single-worker runtime with defaults.
    pub fn new() -> io::Result<Self> {
        Builder::new().build()
    }

    /// Builder entry point.
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A handle for spawning and introspection.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle::from_shared(Arc::clone(&self.shared))
    }

    /// Spawns a task on the pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn(future)
    }

    /// Runs `future` to completion, folding the calling thread into the
    /// worker pool while it waits.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let handle = self.handle();
        let _enter = handle.enter();

        let parker = Parker::new();
        self.shared.parkers.lock().push(parker.clone());
        let _parker_guard = CallerParker {
            shared: &self.shared,
            parker: parker.clone(),
        };

        let root = Arc::new(RootWaker {
            parker,
            notified: AtomicBool::new(true),
            shared: Arc::clone(&self.shared),
        });
        let waker = Waker::from(Arc::clone(&root));
        let mut cx = Context::from_waker(&waker);
        let mut future = Box::pin(future);

        loop {
            if root.notified.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            let (task, tickle) = self.shared.queue.pop_for(None);
            if tickle {
                self.shared.tickle();
            }
            if let Some(task) = task {
                task.run();
                continue;
            }
            if root.notified.load(Ordering::Acquire) {
                continue;
            }

            self.shared.begin_idle();
            if !self.shared.queue.is_empty() || root.notified.load(Ordering::Acquire) {
                self.shared.end_idle();
                continue;
            }
            if !self.shared.driver.turn_once(&self.shared.queue) {
                root.parker.park_timeout(Duration::from_millis(20));
            }
            self.shared.end_idle();
        }
    }

    /// Stops the runtime: flags stopping, wakes every worker, lets the
    /// queue drain, and joins the worker threads. Idempotent; legal from
    /// any non-worker thread.
    ///
    /// # Panics
    ///
    /// Panics when called from one of this runtime's own workers.
    pub fn shutdown(&self) {
        assert!(
            !Handle::try_current().is_some_and(|h| Arc::ptr_eq(&h.shared, &self.shared)),
            "shutdown called from inside the runtime"
        );
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        let first = !self.shared.stopping.swap(true, Ordering::AcqRel);
        self.shared.queue.set_stopping();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            while !thread.is_finished() {
                self.shared.tickle_all();
                std::thread::sleep(Duration::from_millis(2));
            }
            let _ = thread.join();
        }
        if first {
            let leftovers = self.shared.queue.drain_all();
            drop(leftovers);
            // Suspended tasks hold their own wakers (a cycle); aborting
            // drops the futures, which cancels their join handles.
            for task in self.shared.queue.take_live_tasks() {
                task.abort();
            }
            self.shared.driver.timers().clear();
            debug!(name = %self.shared.name, "runtime stopped");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

struct RootWaker {
    parker: Parker,
    notified: AtomicBool,
    shared: Arc<Shared>,
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        self.parker.unpark();
        // The caller may be leading the kernel wait.
        self.shared.driver.notify();
    }
}

struct CallerParker<'a> {
    shared: &'a Arc<Shared>,
    parker: Parker,
}

impl Drop for CallerParker<'_> {
    fn drop(&mut self) {
        self.shared
            .parkers
            .lock()
            .retain(|p| !p.ptr_eq(&self.parker));
    }
}

/// Suspends the current task until `duration` has passed on the runtime
/// clock.
#[must_use = "futures do nothing unless awaited"]
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        state: None,
        timer: None,
    }
}

#[derive(Debug)]
struct SleepState {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Future returned by [`sleep`].
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    state: Option<Arc<SleepState>>,
    timer: Option<crate::timer::TimerHandle>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(state) = &self.state {
            if state.fired.load(Ordering::Acquire) {
                self.timer = None;
                return Poll::Ready(());
            }
            *state.waker.lock() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let handle = Handle::current();
        let state = Arc::new(SleepState {
            fired: AtomicBool::new(false),
            waker: Mutex::new(Some(cx.waker().clone())),
        });
        let ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX);
        let cb_state = Arc::clone(&state);
        let timer = handle.timers().add_timer(
            ms,
            Arc::new(move || {
                cb_state.fired.store(true, Ordering::Release);
                if let Some(waker) = cb_state.waker.lock().take() {
                    waker.wake();
                }
            }),
            false,
        );
        self.state = Some(state);
        self.timer = Some(timer);
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Yields the current task back to the scheduler once.
#[must_use = "futures do nothing unless awaited"]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
