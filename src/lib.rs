//! Weft: a cooperative server-side concurrency runtime.
//!
//! # Overview
//!
//! Weft multiplexes many cooperative tasks onto a small pool of worker
//! threads. Each worker drives a readiness-based I/O reactor and a hashed
//! timer wheel; blocking-shaped socket operations suspend the calling task
//! on `(fd, direction)` readiness and synthesize timeouts from wheel
//! deadlines instead of kernel socket timers. On top of this substrate the
//! crate builds TCP acceptors, a correlated request/response RPC session
//! with automatic reconnect, service-discovery-fed load balancing, and the
//! collaborator seams for HTTP/1 and WebSocket codecs.
//!
//! # Core guarantees
//!
//! - **Cooperative execution**: within one worker a task runs uninterrupted
//!   until it awaits; the only suspension points are readiness waits, timer
//!   waits, channel/semaphore waits, and explicit yields.
//! - **One waiter per direction**: at most one task may be parked on a given
//!   `(fd, READ|WRITE)` pair; a second arm attempt fails instead of silently
//!   displacing the first.
//! - **Deadline synthesis**: per-direction timeouts arm conditional wheel
//!   timers that cancel the readiness wait with a timeout error; the fd
//!   survives and remains usable.
//! - **Exactly-once correlation**: a session response is delivered to the
//!   caller whose sequence number it carries, or dropped silently if that
//!   caller already timed out.
//!
//! # Module structure
//!
//! - [`runtime`]: worker-pool scheduler, task lifecycle, spawn/block_on
//! - [`reactor`]: readiness demultiplexing and per-fd waiter slots
//! - [`timer`]: hashed-slot timer wheel and timer handles
//! - [`driver`]: the per-turn glue between reactor, wheel, and scheduler
//! - [`net`]: TCP streams, listeners, and the acceptor framework
//! - [`sync`]: async semaphore
//! - [`channel`]: oneshot and bounded mpsc channels
//! - [`rpc`]: the Rock message model, framing codec, and server shell
//! - [`session`]: correlated async request/response sessions
//! - [`discovery`]: service-discovery interface and static implementation
//! - [`balance`]: round-robin / weighted / fair peer selection
//! - [`http`]: HTTP/1 and WebSocket collaborator interfaces
//! - [`config`]: named configuration values with change listeners
//! - [`error`](mod@error): crate error taxonomy

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod balance;
pub mod channel;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod http;
pub mod net;
pub mod reactor;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod sync;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::Config;
pub use error::{Error, ErrorKind};
pub use runtime::{Builder, Handle, JoinHandle, Runtime};
