//! Kernel readiness interface wrapper.
//!
//! Wraps the `polling` crate's `Poller` (epoll on Linux, kqueue on the
//! BSDs) with the crate's [`Interest`] vocabulary. Registrations use
//! edge-triggered mode where the platform supports it; `notify` is the
//! tickle that breaks an idle worker out of its kernel wait.
//!
//! # Safety
//!
//! `polling` marks registration unsafe because the compiler cannot verify
//! that a raw descriptor stays valid for the lifetime of its registration.
//! [`FdSlots`](super::FdSlots) upholds that invariant: contexts are
//! deregistered in `close()` before the owning stream drops the fd.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use polling::{Event, PollMode, Poller as SysPoller};

use super::Interest;

/// Edge-triggered readiness poller.
#[derive(Debug)]
pub struct Poller {
    inner: SysPoller,
}

impl Poller {
    /// Creates a poller.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: SysPoller::new()?,
        })
    }

    fn mode(&self) -> PollMode {
        if self.inner.supports_edge() {
            PollMode::Edge
        } else {
            PollMode::Level
        }
    }

    fn event_for(fd: RawFd, interest: Interest) -> Event {
        let key = fd as usize;
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }

    /// Registers `fd` with the given interest.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let event = Self::event_for(fd, interest);
        // SAFETY: FdSlots deregisters the fd before its owner closes it.
        unsafe { self.inner.add_with_mode(fd, event, self.mode()) }
    }

    /// Replaces the interest of an already registered fd.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let event = Self::event_for(fd, interest);
        // SAFETY: the fd is live for the duration of this call; see module
        // docs for the registration lifetime argument.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.inner.modify_with_mode(borrowed, event, self.mode())
    }

    /// Removes `fd` from the kernel set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: as in `modify`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.inner.delete(borrowed)
    }

    /// Waits for events, up to `timeout`. Interrupted waits report zero
    /// events rather than an error.
    pub fn wait(&self, events: &mut polling::Events, timeout: Option<Duration>) -> io::Result<usize> {
        match self.inner.wait(events, timeout) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Wakes a blocked [`Poller::wait`] from another thread.
    pub fn notify(&self) -> io::Result<()> {
        self.inner.notify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn notify_breaks_wait() {
        let poller = Poller::new().expect("poller");
        poller.notify().expect("notify");
        let mut events = polling::Events::new();
        let start = std::time::Instant::now();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .expect("wait");
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "pre-notified wait must return immediately"
        );
    }

    #[test]
    fn readable_event_surfaces_registered_key() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");

        let poller = Poller::new().expect("poller");
        poller
            .add(server.as_raw_fd(), Interest::readable())
            .expect("add");

        client.write_all(b"ping").expect("write");

        let mut events = polling::Events::new();
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .expect("wait");
        assert!(n >= 1, "expected at least one event");
        let hit = events
            .iter()
            .any(|e| e.key == server.as_raw_fd() as usize && e.readable);
        assert!(hit, "server fd readable event expected");
        poller.delete(server.as_raw_fd()).expect("delete");
    }
}
