//! Raw socket plumbing for the non-blocking connect dance.
//!
//! `std` cannot start a TCP connect without blocking, so this module goes
//! through `libc` directly: create the socket, flip it non-blocking,
//! issue `connect`, and report whether the kernel finished synchronously
//! or answered `EINPROGRESS`. Once writability fires, `SO_ERROR` delivers
//! the verdict.
//!
//! # Safety
//!
//! All `unsafe` here is FFI with kernel-checked arguments: descriptors are
//! owned [`OwnedFd`]s created in this module, and the sockaddr buffers are
//! stack values whose lengths are passed alongside.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Result of starting a non-blocking connect.
pub(crate) enum ConnectStart {
    /// The kernel completed the handshake synchronously (loopback fast
    /// path).
    Connected(OwnedFd),
    /// Connection in progress; wait for writability, then check
    /// [`take_socket_error`].
    InProgress(OwnedFd),
}

pub(crate) fn connect_nonblocking(addr: SocketAddr) -> io::Result<ConnectStart> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(fd.as_raw_fd())?;
    set_nonblocking(fd.as_raw_fd())?;

    let rc = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    std::ptr::addr_of!(sin).cast::<libc::sockaddr>(),
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    std::ptr::addr_of!(sin6).cast::<libc::sockaddr>(),
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };

    if rc == 0 {
        return Ok(ConnectStart::Connected(fd));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EINPROGRESS => Ok(ConnectStart::InProgress(fd)),
        _ => Err(err),
    }
}

/// Reads and clears the pending socket error (`SO_ERROR`).
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn loopback_connect_starts() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let start = connect_nonblocking(addr).expect("connect starts");
        let fd = match &start {
            ConnectStart::Connected(fd) | ConnectStart::InProgress(fd) => fd.as_raw_fd(),
        };
        assert!(fd >= 0);
    }

    #[test]
    fn socket_error_is_clear_on_fresh_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        match connect_nonblocking(addr).expect("connect starts") {
            ConnectStart::Connected(fd) => take_socket_error(fd.as_raw_fd()).expect("no error"),
            ConnectStart::InProgress(fd) => {
                // Loopback completes quickly; poll SO_ERROR after a beat.
                std::thread::sleep(std::time::Duration::from_millis(50));
                take_socket_error(fd.as_raw_fd()).expect("no error");
            }
        }
    }
}
