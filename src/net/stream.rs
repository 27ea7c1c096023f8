//! TCP stream with blocking-shaped operations and deadline synthesis.
//!
//! Every operation follows one template: issue the non-blocking syscall,
//! retry on `Interrupted`, and on `WouldBlock` park the task on the fd's
//! readiness, arming a conditional wheel timer first when the direction
//! carries a timeout. A timer that fires cancels the wait and the caller
//! sees `TimedOut`; the fd stays open and later operations work normally.
//!
//! Two delegation rules keep foreign contexts honest: a thread with no
//! runtime, and a stream whose user asked for non-blocking mode, both get
//! exactly one real syscall with `WouldBlock` surfaced unchanged.
//!
//! Return convention: `Ok(n > 0)` bytes transferred, `Ok(0)` remote
//! closed, `Err` otherwise. Streams are cheaply clonable and a clone
//! shares the descriptor; the last drop of an owning stream closes it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::driver::IoWait;
use crate::reactor::{Direction, FdContext};
use crate::runtime::Handle;

use super::socket::{self, ConnectStart};

struct StreamInner {
    socket: std::net::TcpStream,
    ctx: Arc<FdContext>,
    handle: Handle,
    owner: bool,
    closed: AtomicBool,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if self.owner {
            self.handle.driver().slots().close(self.socket.as_raw_fd());
        }
    }
}

/// An asynchronous TCP stream.
#[derive(Clone)]
pub struct TcpStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("fd", &self.inner.socket.as_raw_fd())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpStream {
    /// Connects to `addr` using the `tcp.connect.timeout` configuration
    /// key as the deadline.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let handle = Handle::current();
        let timeout = handle
            .config()
            .get_ms_or("tcp.connect.timeout", Duration::from_millis(5000));
        Self::connect_timeout(addr, Some(timeout)).await
    }

    /// Connects to `addr` with an explicit deadline (`None` waits
    /// indefinitely).
    pub async fn connect_timeout(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<Self> {
        let handle = Handle::current();
        match socket::connect_nonblocking(addr)? {
            ConnectStart::Connected(fd) => {
                Self::from_std(&handle, std::net::TcpStream::from(fd), true)
            }
            ConnectStart::InProgress(fd) => {
                let raw = fd.as_raw_fd();
                let ctx = handle.driver().slots().register(raw, true);
                let wait = handle.driver().wait_io(Arc::clone(&ctx), Direction::Write, timeout);
                match wait.await {
                    Ok(()) => {}
                    Err(err) => {
                        handle.driver().slots().close(raw);
                        return Err(err);
                    }
                }
                if let Err(err) = socket::take_socket_error(raw) {
                    handle.driver().slots().close(raw);
                    return Err(err);
                }
                trace!(fd = raw, %addr, "connected");
                Self::from_std(&handle, std::net::TcpStream::from(fd), true)
            }
        }
    }

    /// Wraps an already-open socket (accept path, tests). Forces the
    /// system-level non-blocking mode and registers the fd context.
    pub fn from_std(
        handle: &Handle,
        socket: std::net::TcpStream,
        owner: bool,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let ctx = handle.driver().slots().register(socket.as_raw_fd(), true);
        Ok(Self {
            inner: Arc::new(StreamInner {
                socket,
                ctx,
                handle: handle.clone(),
                owner,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn wait(&self, direction: Direction) -> IoWait {
        self.inner.handle.driver().wait_io(
            Arc::clone(&self.inner.ctx),
            direction,
            self.inner.ctx.timeout(direction),
        )
    }

    fn delegate_only(&self) -> bool {
        Handle::try_current().is_none() || self.inner.ctx.user_nonblocking()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream closed",
            ));
        }
        Ok(())
    }

    /// Reads into `buf`. `Ok(0)` means the remote closed its half.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        loop {
            match (&self.inner.socket).read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.delegate_only() {
                        return Err(err);
                    }
                    self.wait(Direction::Read).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads exactly `buf.len()` bytes; a premature remote close surfaces
    /// as `UnexpectedEof`.
    pub async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "remote closed mid-frame",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Writes from `buf`, returning the bytes accepted by the kernel.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        loop {
            match (&self.inner.socket).write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.delegate_only() {
                        return Err(err);
                    }
                    self.wait(Direction::Write).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes the whole of `buf`.
    pub async fn write_exact(&self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.write(&buf[sent..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "kernel accepted zero bytes",
                ));
            }
            sent += n;
        }
        Ok(())
    }

    /// Closes the stream: cancels every parked waiter on the fd and shuts
    /// the socket down. Idempotent; clones observe the closed state.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .handle
            .driver()
            .slots()
            .close(self.inner.socket.as_raw_fd());
        let _ = self.inner.socket.shutdown(Shutdown::Both);
        trace!(fd = self.inner.socket.as_raw_fd(), "stream closed");
    }

    /// Whether [`TcpStream::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Cancels a parked waiter on one direction; it wakes with a
    /// cancellation error. Returns whether a waiter was present.
    pub fn cancel_pending(&self, direction: Direction) -> bool {
        self.inner.handle.driver().slots().cancel(
            &self.inner.ctx,
            direction,
            crate::reactor::WaitResult::Cancelled,
        )
    }

    /// Per-direction receive timeout (the `SO_RCVTIMEO` analogue; never
    /// touches the kernel timer).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.ctx.set_timeout(Direction::Read, timeout);
    }

    /// Per-direction send timeout (the `SO_SNDTIMEO` analogue).
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.ctx.set_timeout(Direction::Write, timeout);
    }

    /// Current receive timeout.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.inner.ctx.timeout(Direction::Read)
    }

    /// Current send timeout.
    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        self.inner.ctx.timeout(Direction::Write)
    }

    /// Records the user's intended blocking mode. The system-level mode
    /// stays non-blocking; a non-blocking user sees `WouldBlock` instead
    /// of suspension.
    pub fn set_user_nonblocking(&self, nonblocking: bool) {
        self.inner.ctx.set_user_nonblocking(nonblocking);
    }

    /// The user-visible blocking mode.
    #[must_use]
    pub fn user_nonblocking(&self) -> bool {
        self.inner.ctx.user_nonblocking()
    }

    /// Remote address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.peer_addr()
    }

    /// Local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Sets `TCP_NODELAY`.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.socket.set_nodelay(nodelay)
    }

    /// The raw descriptor (diagnostics).
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.inner.socket.as_raw_fd()
    }
}
