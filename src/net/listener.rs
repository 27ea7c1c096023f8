//! Asynchronous TCP listener.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::driver::IoWait;
use crate::reactor::{Direction, FdContext};
use crate::runtime::Handle;

use super::stream::TcpStream;

struct ListenerInner {
    socket: std::net::TcpListener,
    ctx: Arc<FdContext>,
    handle: Handle,
    closed: AtomicBool,
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.handle.driver().slots().close(self.socket.as_raw_fd());
    }
}

/// A bound, non-blocking TCP listener.
#[derive(Clone)]
pub struct TcpListener {
    inner: Arc<ListenerInner>,
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("fd", &self.inner.socket.as_raw_fd())
            .field("addr", &self.inner.socket.local_addr().ok())
            .finish()
    }
}

impl TcpListener {
    /// Binds on the thread's current runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_with(&Handle::current(), addr)
    }

    /// Binds against an explicit runtime handle.
    pub fn bind_with(handle: &Handle, addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let ctx = handle.driver().slots().register(socket.as_raw_fd(), true);
        trace!(addr = %socket.local_addr()?, "listener bound");
        Ok(Self {
            inner: Arc::new(ListenerInner {
                socket,
                ctx,
                handle: handle.clone(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Accepts one connection, suspending until a peer arrives. The
    /// accepted stream owns its descriptor.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener closed",
                ));
            }
            match self.inner.socket.accept() {
                Ok((socket, peer)) => {
                    let stream = TcpStream::from_std(&self.inner.handle, socket, true)?;
                    trace!(%peer, "accepted");
                    return Ok((stream, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_readable().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn wait_readable(&self) -> IoWait {
        self.inner
            .handle
            .driver()
            .wait_io(Arc::clone(&self.inner.ctx), Direction::Read, None)
    }

    /// Cancels any parked accept and deregisters the socket. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .handle
            .driver()
            .slots()
            .close(self.inner.socket.as_raw_fd());
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }
}
