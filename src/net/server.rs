//! The TCP acceptor framework.
//!
//! A [`TcpServer`] binds one or more listening addresses, runs one accept
//! loop per socket on its accept runtime, stamps every accepted stream
//! with the server's receive timeout, and hands it to the installed
//! [`ClientHandler`] against the I/O runtime. Protocol servers compose
//! around this type and install a per-connection handler.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind};
use crate::runtime::{Handle, JoinHandle};

use super::listener::TcpListener;
use super::stream::TcpStream;

/// Per-connection entry point installed on a [`TcpServer`].
pub trait ClientHandler: Send + Sync + 'static {
    /// Called once per accepted stream; implementations usually spawn a
    /// task on `io` and return immediately.
    fn handle_client(&self, io: &Handle, stream: TcpStream);
}

impl<F> ClientHandler for F
where
    F: Fn(&Handle, TcpStream) + Send + Sync + 'static,
{
    fn handle_client(&self, io: &Handle, stream: TcpStream) {
        self(io, stream);
    }
}

/// Multi-listener TCP acceptor.
pub struct TcpServer {
    name: String,
    io: Handle,
    accept: Handle,
    listeners: Mutex<Vec<TcpListener>>,
    handler: RwLock<Option<Arc<dyn ClientHandler>>>,
    recv_timeout: RwLock<Option<Duration>>,
    stopping: AtomicBool,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("listeners", &self.listeners.lock().len())
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpServer {
    /// Creates an acceptor. `io` runs connection handlers, `accept` runs
    /// the accept loops; the two may be the same runtime.
    #[must_use]
    pub fn new(name: impl Into<String>, io: Handle, accept: Handle) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            io,
            accept,
            listeners: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            recv_timeout: RwLock::new(None),
            stopping: AtomicBool::new(false),
            accept_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Binds one listening address; call repeatedly for multi-homed
    /// servers. Returns the concrete bound address.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind_with(&self.accept, addr)?;
        let bound = listener.local_addr()?;
        self.listeners.lock().push(listener);
        info!(server = %self.name, %bound, "server bound");
        Ok(bound)
    }

    /// Installs the per-connection handler.
    pub fn set_handler(&self, handler: Arc<dyn ClientHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Receive timeout stamped onto every accepted stream.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        *self.recv_timeout.write() = timeout;
    }

    /// The server's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launches one accept loop per bound listener.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when no handler is
    /// installed or nothing is bound.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidState, "no handler installed"))?;
        let listeners = self.listeners.lock().clone();
        if listeners.is_empty() {
            return Err(Error::with_message(ErrorKind::InvalidState, "nothing bound"));
        }
        for listener in listeners {
            let server = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let task = self.accept.spawn(async move {
                server.accept_loop(listener, handler).await;
            });
            self.accept_tasks.lock().push(task);
        }
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener, handler: Arc<dyn ClientHandler>) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            match listener.accept().await {
                Ok((stream, peer)) => {
                    stream.set_read_timeout(*self.recv_timeout.read());
                    debug!(server = %self.name, %peer, "client accepted");
                    handler.handle_client(&self.io, stream);
                }
                Err(err) if self.stopping.load(Ordering::Acquire) => {
                    debug!(server = %self.name, %err, "accept loop stopping");
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    // Listener cancelled under us.
                    break;
                }
                Err(err) => {
                    warn!(server = %self.name, %err, "accept failed");
                    crate::runtime::yield_now().await;
                }
            }
        }
    }

    /// Stops accepting: cancels listener waits and closes the sockets.
    /// Established connections are left to their handlers. Idempotent.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for listener in self.listeners.lock().iter() {
            listener.close();
        }
        info!(server = %self.name, "server stopped");
    }
}
