//! Async counting semaphore with FIFO waiters.
//!
//! Permits are released by any thread; acquisition suspends the calling
//! task until enough permits are available. Waiters are granted strictly in
//! arrival order, so a large acquisition parked at the head is not starved
//! by smaller ones behind it.
//!
//! The session layer uses two of these: a send gate (the writer sleeps
//! until work is enqueued) and a close gate (teardown waits for the reader
//! and writer to exit before redialing).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterState {
    Waiting,
    Granted,
    Abandoned,
}

#[derive(Debug)]
struct Waiter {
    wanted: usize,
    state: WaiterState,
    waker: Option<Waker>,
}

#[derive(Debug)]
struct SemState {
    permits: usize,
    waiters: VecDeque<Arc<Mutex<Waiter>>>,
}

/// An async counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<SemState>,
}

impl Semaphore {
    /// Creates a semaphore with `permits` initial permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns the number of free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    /// Attempts to take `n` permits without waiting.
    pub fn try_acquire(&self, n: usize) -> bool {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.permits >= n {
            state.permits -= n;
            true
        } else {
            false
        }
    }

    /// Takes `n` permits, waiting until they become available.
    pub fn acquire(&self, n: usize) -> Acquire<'_> {
        Acquire {
            sem: self,
            wanted: n,
            waiter: None,
        }
    }

    /// Returns `n` permits and wakes waiters whose demand is now covered.
    pub fn release(&self, n: usize) {
        let mut woken = Vec::new();
        {
            let mut state = self.state.lock();
            state.permits += n;
            while let Some(front) = state.waiters.front().cloned() {
                let mut w = front.lock();
                match w.state {
                    WaiterState::Abandoned => {
                        drop(w);
                        state.waiters.pop_front();
                    }
                    WaiterState::Waiting if state.permits >= w.wanted => {
                        state.permits -= w.wanted;
                        w.state = WaiterState::Granted;
                        if let Some(waker) = w.waker.take() {
                            woken.push(waker);
                        }
                        drop(w);
                        state.waiters.pop_front();
                    }
                    _ => break,
                }
            }
        }
        for waker in woken {
            waker.wake();
        }
    }
}

/// Future returned by [`Semaphore::acquire`].
#[derive(Debug)]
pub struct Acquire<'a> {
    sem: &'a Semaphore,
    wanted: usize,
    waiter: Option<Arc<Mutex<Waiter>>>,
}

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(waiter) = &self.waiter {
            let mut w = waiter.lock();
            match w.state {
                WaiterState::Granted => {
                    drop(w);
                    self.waiter = None;
                    return Poll::Ready(());
                }
                _ => {
                    w.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }

        let mut state = self.sem.state.lock();
        if state.waiters.is_empty() && state.permits >= self.wanted {
            state.permits -= self.wanted;
            return Poll::Ready(());
        }
        let waiter = Arc::new(Mutex::new(Waiter {
            wanted: self.wanted,
            state: WaiterState::Waiting,
            waker: Some(cx.waker().clone()),
        }));
        state.waiters.push_back(Arc::clone(&waiter));
        drop(state);
        self.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        let reclaim = {
            let mut w = waiter.lock();
            match w.state {
                // Granted but never observed: the permits go back.
                WaiterState::Granted => Some(w.wanted),
                _ => {
                    w.state = WaiterState::Abandoned;
                    None
                }
            }
        };
        if let Some(n) = reclaim {
            self.sem.release(n);
        }
    }
}
