//! Server-side Rock shell over the TCP acceptor.
//!
//! Each accepted stream gets one connection task that reads frames,
//! dispatches requests to the installed [`RockHandler`], and writes the
//! handler's responses back in order. Inbound responses are a protocol
//! violation on the server side and close the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};
use crate::net::{TcpServer, TcpStream};
use crate::runtime::Handle;

use super::{encode_frame, read_frame, Codec, Message, Notify, Request, Response, RockCodec};

/// Application dispatch for a Rock server.
pub trait RockHandler: Send + Sync + 'static {
    /// Produces the response for one request; `None` answers nothing
    /// (the peer's timeout handles it).
    fn handle_request(&self, request: &Request) -> Option<Response>;

    /// Consumes a fire-and-forget notification.
    fn handle_notify(&self, _notify: &Notify) {}
}

/// A Rock protocol server: a [`TcpServer`] with a framed dispatch loop
/// installed as its connection handler.
pub struct RockServer {
    tcp: Arc<TcpServer>,
}

impl std::fmt::Debug for RockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RockServer").field("tcp", &self.tcp).finish()
    }
}

impl RockServer {
    /// Creates the server and installs the dispatch loop.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        io: Handle,
        accept: Handle,
        handler: Arc<dyn RockHandler>,
    ) -> Arc<Self> {
        let tcp = TcpServer::new(name, io, accept);
        let dispatch = Arc::clone(&handler);
        tcp.set_handler(Arc::new(move |io: &Handle, stream: TcpStream| {
            let handler = Arc::clone(&dispatch);
            io.spawn(async move {
                if let Err(err) = connection_loop(&stream, handler).await {
                    debug!(%err, "rock connection closed");
                }
                stream.close();
            });
        }));
        Arc::new(Self { tcp })
    }

    /// Binds one listening address.
    pub fn bind(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        self.tcp.bind(addr)
    }

    /// Starts accepting.
    pub fn start(&self) -> Result<(), Error> {
        self.tcp.start()
    }

    /// Stops accepting; live connections drain on their own.
    pub fn stop(&self) {
        self.tcp.stop();
    }

    /// The underlying acceptor.
    #[must_use]
    pub fn tcp(&self) -> &Arc<TcpServer> {
        &self.tcp
    }
}

async fn connection_loop(stream: &TcpStream, handler: Arc<dyn RockHandler>) -> Result<(), Error> {
    let codec = RockCodec;
    loop {
        let Some(payload) = read_frame(stream, super::DEFAULT_MAX_FRAME).await? else {
            return Ok(());
        };
        match codec.decode(&payload)? {
            Message::Request(request) => {
                if let Some(response) = handler.handle_request(&request) {
                    let frame = encode_frame(&codec, &Message::Response(response))?;
                    stream.write_exact(&frame).await.map_err(Error::from)?;
                }
            }
            Message::Notify(notify) => handler.handle_notify(&notify),
            Message::Response(rsp) => {
                warn!(sn = rsp.sn, "unexpected response on server connection");
                return Err(Error::with_message(
                    ErrorKind::Protocol,
                    "response received by server",
                ));
            }
        }
    }
}
