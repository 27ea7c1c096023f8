//! Bounded multi-producer, single-consumer channel.
//!
//! `send` waits for queue capacity, `try_send` fails fast. When every
//! sender is gone the receiver drains the remaining items and then
//! observes end-of-stream; when the receiver is gone senders fail with
//! [`SendError`].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// Error returned when the receiving half has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("mpsc receiver dropped")
    }
}

impl<T: std::fmt::Debug> std::error::Error for SendError<T> {}

/// Error returned by [`Sender::try_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The receiver has been dropped.
    Closed(T),
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    capacity: usize,
    senders: usize,
    recv_alive: bool,
    recv_waker: Option<Waker>,
    send_wakers: VecDeque<Waker>,
}

/// Creates a bounded channel with room for `capacity` queued items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "mpsc capacity must be non-zero");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            senders: 1,
            recv_alive: true,
            recv_waker: None,
            send_wakers: VecDeque::new(),
        }),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Producing half; clonable.
#[derive(Debug)]
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let waker = {
            let mut state = self.shared.state.lock();
            state.senders -= 1;
            if state.senders == 0 {
                state.recv_waker.take()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Sender<T> {
    /// Enqueues `value` without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let waker = {
            let mut state = self.shared.state.lock();
            if !state.recv_alive {
                return Err(TrySendError::Closed(value));
            }
            if state.queue.len() >= state.capacity {
                return Err(TrySendError::Full(value));
            }
            state.queue.push_back(value);
            state.recv_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Enqueues `value`, waiting for capacity if the queue is full.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            sender: self,
            value: Some(value),
        }
    }
}

/// Future returned by [`Sender::send`].
#[derive(Debug)]
pub struct Send<'a, T> {
    sender: &'a Sender<T>,
    value: Option<T>,
}

impl<T: Unpin> Future for Send<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let value = this.value.take().expect("polled after completion");
        // Check and waker registration happen under one lock so a racing
        // drain cannot slip between them and strand this sender.
        let mut state = this.sender.shared.state.lock();
        if !state.recv_alive {
            return Poll::Ready(Err(SendError(value)));
        }
        if state.queue.len() < state.capacity {
            state.queue.push_back(value);
            let waker = state.recv_waker.take();
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(()));
        }
        state.send_wakers.push_back(cx.waker().clone());
        drop(state);
        this.value = Some(value);
        Poll::Pending
    }
}

/// Consuming half; single owner.
#[derive(Debug)]
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let wakers: Vec<Waker> = {
            let mut state = self.shared.state.lock();
            state.recv_alive = false;
            state.queue.clear();
            state.send_wakers.drain(..).collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Receiver<T> {
    /// Dequeues the next item, waiting if the queue is empty. Resolves to
    /// `None` once every sender is gone and the queue is drained.
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { receiver: self }
    }

    /// Dequeues without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        let (value, waker) = {
            let mut state = self.shared.state.lock();
            (state.queue.pop_front(), state.send_wakers.pop_front())
        };
        if value.is_some() {
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        value
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }
}

/// Future returned by [`Receiver::recv`].
#[derive(Debug)]
pub struct Recv<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.receiver.shared.state.lock();
        if let Some(value) = state.queue.pop_front() {
            let waker = state.send_wakers.pop_front();
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Some(value));
        }
        if state.senders == 0 {
            return Poll::Ready(None);
        }
        state.recv_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn send_recv_in_order() {
        let (tx, mut rx) = bounded(4);
        block_on(tx.send(1)).expect("open");
        block_on(tx.send(2)).expect("open");
        assert_eq!(block_on(rx.recv()), Some(1));
        assert_eq!(block_on(rx.recv()), Some(2));
    }

    #[test]
    fn try_send_full_and_closed() {
        let (tx, rx) = bounded(1);
        assert!(tx.try_send(1).is_ok());
        assert!(matches!(tx.try_send(2), Err(TrySendError::Full(2))));
        drop(rx);
        assert!(matches!(tx.try_send(3), Err(TrySendError::Closed(3))));
    }

    #[test]
    fn recv_sees_none_after_last_sender() {
        let (tx, mut rx) = bounded(2);
        let tx2 = tx.clone();
        block_on(tx.send(10)).expect("open");
        drop(tx);
        drop(tx2);
        assert_eq!(block_on(rx.recv()), Some(10));
        assert_eq!(block_on(rx.recv()), None);
    }

    #[test]
    fn full_queue_applies_backpressure() {
        let (tx, mut rx) = bounded(1);
        block_on(tx.send(0u32)).expect("open");

        let producer = thread::spawn(move || {
            // Blocks until the consumer drains the first item.
            block_on(tx.send(1)).expect("open");
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(block_on(rx.recv()), Some(0));
        producer.join().expect("producer joins");
        assert_eq!(block_on(rx.recv()), Some(1));
    }

    #[test]
    fn cross_thread_recv_wakeup() {
        let (tx, mut rx) = bounded(2);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            block_on(tx.send(99)).expect("open");
        });
        assert_eq!(block_on(rx.recv()), Some(99));
        handle.join().expect("sender joins");
    }
}
