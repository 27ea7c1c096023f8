//! Readiness demultiplexing and per-fd waiter slots.
//!
//! The reactor side of the runtime has two halves: [`Poller`], a thin
//! edge-triggered wrapper over the kernel readiness interface, and
//! [`FdSlots`], the fd-indexed context table that parks at most one waiter
//! per `(fd, direction)` and routes kernel events (and timeout/cancel
//! verdicts) back to those waiters.
//!
//! Error and hangup conditions are projected onto both armed directions:
//! the kernel interface reports them as simultaneous read/write readiness,
//! and the subsequent retry of the actual syscall surfaces the real errno.
//!
//! A context also carries the per-fd metadata the deadline-aware I/O ops
//! consult: whether the fd is a socket, the user's intended blocking mode
//! (the system-level mode is always non-blocking for managed fds), and the
//! per-direction timeouts.

pub mod poller;

pub use poller::Poller;

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error;

/// Interest in I/O readiness, as a direction bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    const READ_BIT: u8 = 0b01;
    const WRITE_BIT: u8 = 0b10;

    /// No direction.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Read direction only.
    #[must_use]
    pub const fn readable() -> Self {
        Self(Self::READ_BIT)
    }

    /// Write direction only.
    #[must_use]
    pub const fn writable() -> Self {
        Self(Self::WRITE_BIT)
    }

    /// Both directions.
    #[must_use]
    pub const fn both() -> Self {
        Self(Self::READ_BIT | Self::WRITE_BIT)
    }

    /// Whether the read direction is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ_BIT != 0
    }

    /// Whether the write direction is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE_BIT != 0
    }

    /// Whether no direction is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of the two interests.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes `other`'s directions.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// One I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inbound readiness.
    Read,
    /// Outbound readiness.
    Write,
}

impl Direction {
    /// The direction as an [`Interest`] mask.
    #[must_use]
    pub const fn interest(self) -> Interest {
        match self {
            Self::Read => Interest::readable(),
            Self::Write => Interest::writable(),
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Verdict delivered to a parked waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Still parked.
    Pending,
    /// The direction became ready; retry the syscall.
    Ready,
    /// A deadline timer cancelled the wait.
    TimedOut,
    /// The wait was cancelled (event cancellation or fd close).
    Cancelled,
}

/// Shared outcome cell between a parked waiter and whoever wakes it.
#[derive(Debug)]
pub struct WaitOutcome(AtomicU8);

impl WaitOutcome {
    const PENDING: u8 = 0;
    const READY: u8 = 1;
    const TIMED_OUT: u8 = 2;
    const CANCELLED: u8 = 3;

    /// Creates a pending outcome.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(Self::PENDING)))
    }

    fn settle(&self, verdict: WaitResult) -> bool {
        let value = match verdict {
            WaitResult::Pending => return false,
            WaitResult::Ready => Self::READY,
            WaitResult::TimedOut => Self::TIMED_OUT,
            WaitResult::Cancelled => Self::CANCELLED,
        };
        self.0
            .compare_exchange(Self::PENDING, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reads the current verdict.
    #[must_use]
    pub fn get(&self) -> WaitResult {
        match self.0.load(Ordering::Acquire) {
            Self::READY => WaitResult::Ready,
            Self::TIMED_OUT => WaitResult::TimedOut,
            Self::CANCELLED => WaitResult::Cancelled,
            _ => WaitResult::Pending,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    waker: Waker,
    outcome: Arc<WaitOutcome>,
}

#[derive(Debug)]
struct SlotState {
    armed: Interest,
    registered: bool,
    closed: bool,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

/// Per-fd context: waiter slots plus stream metadata.
#[derive(Debug)]
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    user_nonblocking: AtomicBool,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
    state: Mutex<SlotState>,
}

impl FdContext {
    const NO_TIMEOUT: u64 = u64::MAX;

    fn new(fd: RawFd, is_socket: bool) -> Self {
        Self {
            fd,
            is_socket,
            user_nonblocking: AtomicBool::new(false),
            read_timeout_ms: AtomicU64::new(Self::NO_TIMEOUT),
            write_timeout_ms: AtomicU64::new(Self::NO_TIMEOUT),
            state: Mutex::new(SlotState {
                armed: Interest::none(),
                registered: false,
                closed: false,
                read: None,
                write: None,
            }),
        }
    }

    /// The raw descriptor.
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether the descriptor is a socket.
    #[must_use]
    pub const fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// The user's intended blocking mode. The system-level mode stays
    /// non-blocking regardless.
    #[must_use]
    pub fn user_nonblocking(&self) -> bool {
        self.user_nonblocking.load(Ordering::Relaxed)
    }

    /// Records the user's intended blocking mode.
    pub fn set_user_nonblocking(&self, nonblocking: bool) {
        self.user_nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// Per-direction timeout; `None` means wait forever.
    #[must_use]
    pub fn timeout(&self, direction: Direction) -> Option<Duration> {
        let ms = match direction {
            Direction::Read => self.read_timeout_ms.load(Ordering::Relaxed),
            Direction::Write => self.write_timeout_ms.load(Ordering::Relaxed),
        };
        (ms != Self::NO_TIMEOUT).then(|| Duration::from_millis(ms))
    }

    /// Sets a per-direction timeout.
    pub fn set_timeout(&self, direction: Direction, timeout: Option<Duration>) {
        let ms = timeout.map_or(Self::NO_TIMEOUT, |d| {
            u64::try_from(d.as_millis()).unwrap_or(Self::NO_TIMEOUT)
        });
        match direction {
            Direction::Read => self.read_timeout_ms.store(ms, Ordering::Relaxed),
            Direction::Write => self.write_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }

    /// Whether the context has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// The fd-indexed context table plus waiter arming operations.
pub struct FdSlots {
    poller: Arc<Poller>,
    table: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl std::fmt::Debug for FdSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdSlots")
            .field("capacity", &self.table.read().len())
            .finish()
    }
}

impl FdSlots {
    /// Creates a table backed by the given poller.
    #[must_use]
    pub fn new(poller: Arc<Poller>) -> Self {
        Self {
            poller,
            table: RwLock::new(Vec::new()),
        }
    }

    /// Looks up the context for `fd`, if one exists.
    #[must_use]
    pub fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.table.read();
        table.get(fd as usize).and_then(Clone::clone)
    }

    /// Returns the context for `fd`, creating it on first use. The table
    /// grows by half its size when the fd is out of range.
    pub fn register(&self, fd: RawFd, is_socket: bool) -> Arc<FdContext> {
        if let Some(ctx) = self.context(fd) {
            return ctx;
        }
        let mut table = self.table.write();
        let index = fd as usize;
        if table.len() <= index {
            let grown = ((table.len() * 3) / 2).max(index + 1).max(32);
            table.resize_with(grown, || None);
        }
        if let Some(ctx) = &table[index] {
            return Arc::clone(ctx);
        }
        let ctx = Arc::new(FdContext::new(fd, is_socket));
        table[index] = Some(Arc::clone(&ctx));
        ctx
    }

    /// Parks a waiter on `(fd, direction)`.
    ///
    /// Fails with [`std::io::ErrorKind::AlreadyExists`] if that direction
    /// already holds a waiter, preserving the one-waiter-per-direction
    /// invariant.
    pub fn arm(
        &self,
        ctx: &FdContext,
        direction: Direction,
        waker: Waker,
        outcome: Arc<WaitOutcome>,
    ) -> io::Result<()> {
        let mut state = ctx.state.lock();
        if state.closed {
            return Err(error::io_cancelled("fd closed"));
        }
        let occupied = match direction {
            Direction::Read => state.read.is_some(),
            Direction::Write => state.write.is_some(),
        };
        if occupied {
            return Err(error::io_conflict(direction.as_str()));
        }
        let mask = state.armed.with(direction.interest());
        if state.registered {
            self.poller.modify(ctx.fd, mask)?;
        } else {
            self.poller.add(ctx.fd, mask)?;
            state.registered = true;
        }
        state.armed = mask;
        let waiter = Some(Waiter { waker, outcome });
        match direction {
            Direction::Read => state.read = waiter,
            Direction::Write => state.write = waiter,
        }
        trace!(fd = ctx.fd, dir = direction.as_str(), "waiter armed");
        Ok(())
    }

    /// Refreshes the waker of an armed waiter (task re-polled before the
    /// event arrived).
    pub fn update_waker(&self, ctx: &FdContext, direction: Direction, waker: &Waker) {
        let mut state = ctx.state.lock();
        let slot = match direction {
            Direction::Read => &mut state.read,
            Direction::Write => &mut state.write,
        };
        if let Some(waiter) = slot {
            waiter.waker.clone_from(waker);
        }
    }

    /// Clears the waiter slot without waking it.
    pub fn disarm(&self, ctx: &FdContext, direction: Direction) {
        let mut state = ctx.state.lock();
        let slot = match direction {
            Direction::Read => &mut state.read,
            Direction::Write => &mut state.write,
        };
        if slot.take().is_some() {
            self.shrink_registration(ctx, &mut state, direction.interest());
        }
    }

    /// Clears the waiter slot and wakes it with the given verdict. Returns
    /// whether a waiter was present.
    pub fn cancel(&self, ctx: &FdContext, direction: Direction, verdict: WaitResult) -> bool {
        let waiter = {
            let mut state = ctx.state.lock();
            let slot = match direction {
                Direction::Read => &mut state.read,
                Direction::Write => &mut state.write,
            };
            let waiter = slot.take();
            if waiter.is_some() {
                self.shrink_registration(ctx, &mut state, direction.interest());
            }
            waiter
        };
        match waiter {
            Some(waiter) => {
                waiter.outcome.settle(verdict);
                waiter.waker.wake();
                true
            }
            None => false,
        }
    }

    /// Cancels every armed direction on the context.
    pub fn cancel_all(&self, ctx: &FdContext) {
        self.cancel(ctx, Direction::Read, WaitResult::Cancelled);
        self.cancel(ctx, Direction::Write, WaitResult::Cancelled);
    }

    /// Tears down the context for a closing fd: cancels waiters, removes
    /// the kernel registration, and drops the table entry. Idempotent.
    pub fn close(&self, fd: RawFd) {
        let ctx = {
            let mut table = self.table.write();
            table
                .get_mut(fd as usize)
                .and_then(Option::take)
        };
        let Some(ctx) = ctx else { return };
        self.cancel_all(&ctx);
        let mut state = ctx.state.lock();
        state.closed = true;
        if state.registered {
            // The fd may already be gone from the kernel set.
            let _ = self.poller.delete(fd);
            state.registered = false;
            state.armed = Interest::none();
        }
    }

    /// Routes one batch of kernel events to their waiters. Error/hangup
    /// events arrive as readable+writable and therefore fire both armed
    /// directions.
    pub fn dispatch(&self, events: &polling::Events) {
        for event in events.iter() {
            let fd = event.key as RawFd;
            let Some(ctx) = self.context(fd) else { continue };
            if event.readable {
                self.cancel(&ctx, Direction::Read, WaitResult::Ready);
            }
            if event.writable {
                self.cancel(&ctx, Direction::Write, WaitResult::Ready);
            }
        }
    }

    fn shrink_registration(&self, ctx: &FdContext, state: &mut SlotState, fired: Interest) {
        let remaining = state.armed.without(fired);
        state.armed = remaining;
        if !state.registered {
            return;
        }
        let result = if remaining.is_empty() {
            state.registered = false;
            self.poller.delete(ctx.fd)
        } else {
            self.poller.modify(ctx.fd, remaining)
        };
        if let Err(err) = result {
            trace!(fd = ctx.fd, %err, "kernel deregistration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::task::Waker;

    fn socket_pair() -> (TcpStream, TcpStream) {
        crate::test_util::init_test_logging();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn interest_mask_algebra() {
        let both = Interest::both();
        assert!(both.is_readable() && both.is_writable());
        let read_only = both.without(Interest::writable());
        assert!(read_only.is_readable() && !read_only.is_writable());
        assert!(read_only.without(Interest::readable()).is_empty());
    }

    #[test]
    fn register_grows_and_reuses() {
        let poller = Arc::new(Poller::new().expect("poller"));
        let slots = FdSlots::new(poller);
        let (client, _server) = socket_pair();
        let fd = client.as_raw_fd();

        let a = slots.register(fd, true);
        let b = slots.register(fd, true);
        assert!(Arc::ptr_eq(&a, &b), "same fd yields same context");
        assert!(a.is_socket());
    }

    #[test]
    fn second_waiter_per_direction_is_rejected() {
        let poller = Arc::new(Poller::new().expect("poller"));
        let slots = FdSlots::new(poller);
        let (client, _server) = socket_pair();
        client.set_nonblocking(true).expect("nonblocking");
        let ctx = slots.register(client.as_raw_fd(), true);

        let first = WaitOutcome::new();
        slots
            .arm(&ctx, Direction::Read, Waker::noop().clone(), first)
            .expect("first waiter arms");

        let second = WaitOutcome::new();
        let err = slots
            .arm(&ctx, Direction::Read, Waker::noop().clone(), second)
            .expect_err("second waiter must be rejected");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        // The other direction is independent.
        let write = WaitOutcome::new();
        slots
            .arm(&ctx, Direction::Write, Waker::noop().clone(), write)
            .expect("write direction free");
    }

    #[test]
    fn cancel_wakes_with_verdict() {
        let poller = Arc::new(Poller::new().expect("poller"));
        let slots = FdSlots::new(poller);
        let (client, _server) = socket_pair();
        client.set_nonblocking(true).expect("nonblocking");
        let ctx = slots.register(client.as_raw_fd(), true);

        let outcome = WaitOutcome::new();
        slots
            .arm(&ctx, Direction::Read, Waker::noop().clone(), Arc::clone(&outcome))
            .expect("arm");
        assert!(slots.cancel(&ctx, Direction::Read, WaitResult::TimedOut));
        assert_eq!(outcome.get(), WaitResult::TimedOut);
        assert!(
            !slots.cancel(&ctx, Direction::Read, WaitResult::Cancelled),
            "slot already empty"
        );
        // Re-arming after cancellation succeeds.
        let again = WaitOutcome::new();
        slots
            .arm(&ctx, Direction::Read, Waker::noop().clone(), again)
            .expect("re-arm after cancel");
    }

    #[test]
    fn close_cancels_everything_and_is_idempotent() {
        let poller = Arc::new(Poller::new().expect("poller"));
        let slots = FdSlots::new(poller);
        let (client, _server) = socket_pair();
        client.set_nonblocking(true).expect("nonblocking");
        let fd = client.as_raw_fd();
        let ctx = slots.register(fd, true);

        let outcome = WaitOutcome::new();
        slots
            .arm(&ctx, Direction::Read, Waker::noop().clone(), Arc::clone(&outcome))
            .expect("arm");
        slots.close(fd);
        assert_eq!(outcome.get(), WaitResult::Cancelled);
        assert!(slots.context(fd).is_none());
        slots.close(fd); // no-op

        let err = slots
            .arm(&ctx, Direction::Read, Waker::noop().clone(), WaitOutcome::new())
            .expect_err("closed context rejects waiters");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn timeout_metadata_roundtrip() {
        let ctx = FdContext::new(7, true);
        assert_eq!(ctx.timeout(Direction::Read), None);
        ctx.set_timeout(Direction::Read, Some(Duration::from_millis(50)));
        assert_eq!(ctx.timeout(Direction::Read), Some(Duration::from_millis(50)));
        assert_eq!(ctx.timeout(Direction::Write), None);
        ctx.set_timeout(Direction::Read, None);
        assert_eq!(ctx.timeout(Direction::Read), None);

        assert!(!ctx.user_nonblocking());
        ctx.set_user_nonblocking(true);
        assert!(ctx.user_nonblocking());
    }
}
