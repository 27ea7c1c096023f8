//! The I/O driver: reactor plus timer service behind one idle loop.
//!
//! One worker at a time becomes the leader by taking the driver's turn
//! lock. A turn waits on the kernel readiness interface for at most
//! `min(next timer deadline, 3 s)`, then feeds expired timer callbacks
//! into the scheduler as a single batch and routes readiness events to
//! their parked waiters. A timer insertion that becomes the new earliest
//! deadline notifies the poller so the leader recomputes its wait.
//!
//! [`IoWait`] is the suspension primitive the stream layer builds on: it
//! parks the current task on `(fd, direction)` readiness and, when the fd
//! carries a timeout for that direction, arms a conditional wheel timer
//! that cancels the wait with a timeout verdict. The sentinel on that
//! timer is the wait's own outcome cell, so a timer that outlives the wait
//! fizzles instead of cancelling a stranger.

use std::any::Any;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::error;
use crate::reactor::{Direction, FdContext, FdSlots, Poller, WaitOutcome, WaitResult};
use crate::runtime::queue::TaskQueue;
use crate::runtime::task::Task;
use crate::timer::{Clock, TimerHandle, TimerService};

/// Upper bound on one kernel wait, even with no timer armed.
pub const HARD_CAP_MS: u64 = 3000;

/// Reactor, fd table, and timer service bundled behind the leader lock.
pub struct IoDriver {
    poller: Arc<Poller>,
    slots: FdSlots,
    timers: Arc<TimerService>,
    turn: Mutex<polling::Events>,
}

impl std::fmt::Debug for IoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDriver")
            .field("slots", &self.slots)
            .field("timers", &self.timers)
            .finish()
    }
}

impl IoDriver {
    /// Creates a driver on the given clock.
    pub fn new(clock: Clock) -> io::Result<Arc<Self>> {
        let poller = Arc::new(Poller::new()?);
        let timers = TimerService::with_clock(clock);
        let hook_poller = Arc::clone(&poller);
        timers.set_front_hook(Arc::new(move || {
            let _ = hook_poller.notify();
        }));
        Ok(Arc::new(Self {
            slots: FdSlots::new(Arc::clone(&poller)),
            poller,
            timers,
            turn: Mutex::new(polling::Events::new()),
        }))
    }

    /// The kernel readiness interface.
    #[must_use]
    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// The per-fd waiter table.
    #[must_use]
    pub fn slots(&self) -> &FdSlots {
        &self.slots
    }

    /// The timer service.
    #[must_use]
    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Breaks the current leader (if any) out of its kernel wait.
    pub fn notify(&self) {
        let _ = self.poller.notify();
    }

    /// Attempts to lead one reactor turn. Returns `false` when another
    /// worker already holds the turn lock.
    pub(crate) fn turn_once(&self, queue: &Arc<TaskQueue>) -> bool {
        let Some(mut events) = self.turn.try_lock() else {
            return false;
        };
        let timeout_ms = self
            .timers
            .next_timer()
            .map_or(HARD_CAP_MS, |ms| ms.min(HARD_CAP_MS));
        events.clear();
        if let Err(err) = self
            .poller
            .wait(&mut events, Some(Duration::from_millis(timeout_ms)))
        {
            warn!(%err, "reactor wait failed");
            return true;
        }

        let mut expired = Vec::new();
        self.timers.list_expired(&mut expired);
        if !expired.is_empty() {
            queue.push_batch(
                expired
                    .into_iter()
                    .map(|cb| Task::from_callback(Arc::clone(queue), cb)),
            );
        }

        self.slots.dispatch(&events);
        true
    }

    /// Parks the current task until `(fd, direction)` is ready, applying
    /// `timeout` as a conditional wheel timer when present.
    pub(crate) fn wait_io(
        self: &Arc<Self>,
        ctx: Arc<FdContext>,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> IoWait {
        IoWait {
            driver: Arc::clone(self),
            ctx,
            direction,
            timeout,
            outcome: WaitOutcome::new(),
            timer: None,
            armed: false,
        }
    }
}

/// Future that resolves when a direction becomes ready, times out, or is
/// cancelled.
pub(crate) struct IoWait {
    driver: Arc<IoDriver>,
    ctx: Arc<FdContext>,
    direction: Direction,
    timeout: Option<Duration>,
    outcome: Arc<WaitOutcome>,
    timer: Option<TimerHandle>,
    armed: bool,
}

impl IoWait {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl Future for IoWait {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.outcome.get() {
            WaitResult::Pending if !this.armed => {
                this.driver.slots.arm(
                    &this.ctx,
                    this.direction,
                    cx.waker().clone(),
                    Arc::clone(&this.outcome),
                )?;
                this.armed = true;
                if let Some(timeout) = this.timeout {
                    let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    let sentinel: Arc<dyn Any + Send + Sync> =
                        Arc::clone(&this.outcome) as Arc<dyn Any + Send + Sync>;
                    let driver = Arc::clone(&this.driver);
                    let ctx = Arc::clone(&this.ctx);
                    let direction = this.direction;
                    let timer = this.driver.timers.add_condition_timer(
                        ms,
                        Arc::new(move || {
                            driver.slots.cancel(&ctx, direction, WaitResult::TimedOut);
                        }),
                        Arc::downgrade(&sentinel),
                        false,
                    );
                    this.timer = Some(timer);
                }
                Poll::Pending
            }
            WaitResult::Pending => {
                this.driver
                    .slots
                    .update_waker(&this.ctx, this.direction, cx.waker());
                Poll::Pending
            }
            WaitResult::Ready => {
                this.clear_timer();
                Poll::Ready(Ok(()))
            }
            WaitResult::TimedOut => {
                this.timer = None;
                Poll::Ready(Err(error::io_timed_out(this.direction.as_str())))
            }
            WaitResult::Cancelled => {
                this.clear_timer();
                Poll::Ready(Err(error::io_cancelled(this.direction.as_str())))
            }
        }
    }
}

impl Drop for IoWait {
    fn drop(&mut self) {
        if self.armed && self.outcome.get() == WaitResult::Pending {
            self.driver.slots.disarm(&self.ctx, self.direction);
        }
        self.clear_timer();
    }
}
