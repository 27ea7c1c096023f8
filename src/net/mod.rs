//! TCP networking on the runtime substrate.
//!
//! [`TcpStream`] offers the blocking-shaped operations (`read`,
//! `read_exact`, `write`, `write_exact`, `close`) whose suspensions all
//! happen inside the readiness waits of the I/O driver. [`TcpListener`]
//! accepts with the same machinery, and [`TcpServer`] is the acceptor
//! framework protocol servers compose around.

pub mod listener;
pub mod server;
pub(crate) mod socket;
pub mod stream;

pub use listener::TcpListener;
pub use server::{ClientHandler, TcpServer};
pub use stream::TcpStream;
