//! One-value, one-waiter channel.
//!
//! The sending side is consumed by [`Sender::send`]; dropping it unsent
//! closes the channel and the receiver observes [`RecvError`]. The session
//! layer creates one of these per in-flight request: the reader (or the
//! timeout timer) completes it, the requesting task awaits it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// Error returned when the sender was dropped without sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("oneshot sender dropped")
    }
}

impl std::error::Error for RecvError {}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
}

#[derive(Debug)]
struct State<T> {
    value: Option<T>,
    closed: bool,
    waker: Option<Waker>,
}

/// Creates a connected sender/receiver pair.
#[must_use]
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            value: None,
            closed: false,
            waker: None,
        }),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
            sent: false,
        },
        Receiver { shared },
    )
}

/// Sending half; consumed by [`Sender::send`].
#[derive(Debug)]
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
    sent: bool,
}

impl<T> Sender<T> {
    /// Delivers `value` to the receiver. Fails with the value if the
    /// receiver is already gone.
    pub fn send(mut self, value: T) -> Result<(), T> {
        self.sent = true;
        let waker = {
            let mut state = self.shared.state.lock();
            if Arc::strong_count(&self.shared) == 1 {
                return Err(value);
            }
            state.value = Some(value);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        let waker = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Receiving half; a future resolving to the sent value.
#[derive(Debug)]
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(value) = state.value.take() {
            return Poll::Ready(Ok(value));
        }
        if state.closed {
            return Poll::Ready(Err(RecvError));
        }
        state.waker = Some(cx.waker().clone());
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
    fn value_crosses_the_channel() {
        let (tx, rx) = channel();
        tx.send(41u32).expect("receiver alive");
        assert_eq!(block_on(rx), Ok(41));
    }

    #[test]
    fn dropped_sender_closes() {
        let (tx, rx) = channel::<u32>();
        drop(tx);
        assert_eq!(block_on(rx), Err(RecvError));
    }

    #[test]
    fn send_to_dropped_receiver_returns_value() {
        let (tx, rx) = channel();
        drop(rx);
        assert_eq!(tx.send(7u8), Err(7));
    }

    #[test]
    fn cross_thread_wakeup() {
        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send("late").expect("receiver alive");
        });
        assert_eq!(block_on(rx), Ok("late"));
        handle.join().expect("sender joins");
    }
}
