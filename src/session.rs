//! Correlated asynchronous request/response sessions.
//!
//! A session owns one stream and runs two long-lived tasks: a reader that
//! decodes inbound frames and a writer that drains the send queue in
//! enqueue order. Requests are correlated by a strictly increasing
//! sequence number: `request` inserts a context into the `sn → ctx` map,
//! arms a per-request wheel timer, enqueues the encoded frame, and awaits
//! its oneshot. The reader (response), the timer (timeout), or teardown
//! (I/O failure) completes it; whichever removes the context from the
//! map first wins, so a response that arrives after its timeout finds
//! nothing and is dropped silently.
//!
//! Teardown is single-writer-wins on the closed flag: pending contexts
//! fail with [`SessionError::Io`], the stream closes, and the disconnect
//! callback fires. With auto-connect enabled a supervisor waits for the
//! reader and writer to exit (the close gate), then redials on the
//! reconnect interval until the connect callback accepts the new stream
//! and the loops relaunch.
//!
//! Inbound notifications flow through a bounded channel handed to the
//! caller at construction; a peer that floods notifications stalls its
//! own connection instead of growing an unbounded queue.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::channel::{mpsc, oneshot};
use crate::error::{Error, SessionError};
use crate::net::TcpStream;
use crate::rpc::{encode_frame, read_frame, Codec, Message, Notify, Request, Response, RockCodec};
use crate::runtime::{sleep, Handle};
use crate::sync::Semaphore;
use crate::timer::TimerHandle;

/// Bound on undispatched inbound notifications.
pub const NOTIFY_BACKLOG: usize = 64;

/// Outcome of one request.
pub type SessionResult = Result<Response, SessionError>;

/// Receiving side of the session's notification channel.
pub type NotifyReceiver = mpsc::Receiver<Notify>;

/// Callback invoked after a (re)connect; returning `false` rejects the
/// connection and tears it back down.
pub type ConnectCallback = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Callback invoked after a disconnect.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct RequestCtx {
    sn: u32,
    tx: Mutex<Option<oneshot::Sender<SessionResult>>>,
    timer: Mutex<Option<TimerHandle>>,
    timed_out: AtomicBool,
}

impl RequestCtx {
    fn complete(&self, result: SessionResult) {
        if self.timed_out.load(Ordering::Acquire) && result.is_ok() {
            return;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

struct SessionShared<C: Codec> {
    name: String,
    codec: C,
    io: Handle,
    worker: Handle,
    addr: Option<SocketAddr>,
    max_frame: usize,
    reconnect_interval: Duration,
    auto_connect: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    stream: RwLock<Option<TcpStream>>,
    sn: AtomicU32,
    ctxs: RwLock<HashMap<u32, Arc<RequestCtx>>>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    send_gate: Semaphore,
    close_gate: Semaphore,
    connect_cb: RwLock<Option<ConnectCallback>>,
    disconnect_cb: RwLock<Option<DisconnectCallback>>,
    notify_tx: mpsc::Sender<Notify>,
}

/// A correlated async session over one stream.
pub struct Session<C: Codec = RockCodec> {
    shared: Arc<SessionShared<C>>,
}

impl<C: Codec> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Codec> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.shared.name)
            .field("addr", &self.shared.addr)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .field("pending", &self.shared.ctxs.read().len())
            .finish()
    }
}

impl<C: Codec> Session<C> {
    /// Creates an outbound (client) session. Call [`Session::start`] to
    /// dial. The paired receiver yields inbound notifications.
    #[must_use]
    pub fn client(
        name: impl Into<String>,
        io: Handle,
        worker: Handle,
        addr: SocketAddr,
        codec: C,
    ) -> (Self, NotifyReceiver) {
        Self::build(name, io, worker, Some(addr), None, codec)
    }

    /// Wraps an accepted stream as a server-side session (no reconnect).
    #[must_use]
    pub fn server_side(
        name: impl Into<String>,
        io: Handle,
        worker: Handle,
        stream: TcpStream,
        codec: C,
    ) -> (Self, NotifyReceiver) {
        Self::build(name, io, worker, None, Some(stream), codec)
    }

    fn build(
        name: impl Into<String>,
        io: Handle,
        worker: Handle,
        addr: Option<SocketAddr>,
        stream: Option<TcpStream>,
        codec: C,
    ) -> (Self, NotifyReceiver) {
        let reconnect_interval = io
            .config()
            .get_ms_or("session.reconnect.interval", Duration::from_millis(2000));
        let (notify_tx, notify_rx) = mpsc::bounded(NOTIFY_BACKLOG);
        let shared = Arc::new(SessionShared {
            name: name.into(),
            codec,
            io,
            worker,
            addr,
            max_frame: crate::rpc::DEFAULT_MAX_FRAME,
            reconnect_interval,
            auto_connect: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            stream: RwLock::new(stream),
            sn: AtomicU32::new(0),
            ctxs: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            send_gate: Semaphore::new(0),
            close_gate: Semaphore::new(0),
            connect_cb: RwLock::new(None),
            disconnect_cb: RwLock::new(None),
            notify_tx,
        });
        (Self { shared }, notify_rx)
    }

    /// Whether the session reconnects by itself after a failure.
    pub fn set_auto_connect(&self, auto: bool) {
        self.shared.auto_connect.store(auto, Ordering::Release);
    }

    /// Installs the connect callback.
    pub fn set_connect_callback(&self, callback: ConnectCallback) {
        *self.shared.connect_cb.write() = Some(callback);
    }

    /// Installs the disconnect callback.
    pub fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.shared.disconnect_cb.write() = Some(callback);
    }

    /// Dials (when constructed with an address), runs the connect
    /// callback, and launches the reader and writer.
    pub async fn start(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        if shared.stream.read().is_none() {
            let Some(addr) = shared.addr else {
                return Err(SessionError::NotConnect);
            };
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|_| SessionError::NotConnect)?;
            *shared.stream.write() = Some(stream);
        }
        shared.closed.store(false, Ordering::Release);
        if let Some(cb) = shared.connect_cb.read().clone() {
            if !cb() {
                // Loops never launched, so plain teardown rather than
                // inner_close (whose reconnect path waits on them).
                shared.closed.store(true, Ordering::Release);
                if let Some(stream) = shared.stream.write().take() {
                    stream.close();
                }
                return Err(SessionError::NotConnect);
            }
        }
        shared.started.store(true, Ordering::Release);
        info!(session = %shared.name, addr = ?shared.addr, "session started");
        SessionShared::launch(shared);
        Ok(())
    }

    /// Sends a request and awaits its correlated response.
    pub async fn request(
        &self,
        cmd: u32,
        body: Vec<u8>,
        timeout: Duration,
    ) -> SessionResult {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(SessionError::NotConnect);
        }
        let sn = shared.sn.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let message = Message::Request(Request { sn, cmd, body });
        let frame = match encode_frame(&shared.codec, &message) {
            Ok(frame) => frame,
            Err(_) => return Err(SessionError::Io),
        };

        let (tx, rx) = oneshot::channel();
        let ctx = Arc::new(RequestCtx {
            sn,
            tx: Mutex::new(Some(tx)),
            timer: Mutex::new(None),
            timed_out: AtomicBool::new(false),
        });
        shared.ctxs.write().insert(sn, Arc::clone(&ctx));

        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let weak: Weak<SessionShared<C>> = Arc::downgrade(shared);
        let timer = shared.io.timers().add_timer(
            ms,
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    SessionShared::timeout_request(&shared, sn);
                }
            }),
            false,
        );
        *ctx.timer.lock() = Some(timer);

        shared.queue.lock().push_back(frame);
        shared.send_gate.release(1);

        // Teardown may have raced the insert; make sure the context cannot
        // be stranded.
        if shared.closed.load(Ordering::Acquire) {
            if let Some(ctx) = shared.ctxs.write().remove(&sn) {
                ctx.complete(Err(SessionError::NotConnect));
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Io),
        }
    }

    /// Enqueues a fire-and-forget notification.
    pub fn send_notify(&self, notify: Notify) -> Result<(), SessionError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(SessionError::NotConnect);
        }
        let frame = encode_frame(&shared.codec, &Message::Notify(notify))
            .map_err(|_| SessionError::Io)?;
        shared.queue.lock().push_back(frame);
        shared.send_gate.release(1);
        Ok(())
    }

    /// Closes the session and disables reconnect. Idempotent.
    pub fn close(&self) {
        self.shared.auto_connect.store(false, Ordering::Release);
        SessionShared::inner_close(&self.shared);
    }

    /// Whether the session currently holds a live stream.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire) && self.shared.stream.read().is_some()
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.ctxs.read().len()
    }

    /// The session's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The dial address, when this is a client session.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.addr
    }
}

impl<C: Codec> SessionShared<C> {
    fn launch(shared: &Arc<Self>) {
        let reader = Arc::clone(shared);
        shared.io.spawn(async move {
            Self::read_loop(&reader).await;
        });
        let writer = Arc::clone(shared);
        shared.io.spawn(async move {
            Self::write_loop(&writer).await;
        });
    }

    async fn read_loop(shared: &Arc<Self>) {
        let result: Result<(), Error> = loop {
            if shared.closed.load(Ordering::Acquire) {
                break Ok(());
            }
            let Some(stream) = shared.stream.read().clone() else {
                break Ok(());
            };
            match read_frame(&stream, shared.max_frame).await {
                Ok(Some(payload)) => match shared.codec.decode(&payload) {
                    Ok(Message::Response(response)) => Self::deliver(shared, response),
                    Ok(Message::Notify(notify)) => {
                        // Bounded: a flooding peer waits here, which is the
                        // backpressure.
                        if shared.notify_tx.send(notify).await.is_err() {
                            trace!(session = %shared.name, "notify receiver gone; dropping");
                        }
                    }
                    Ok(Message::Request(_)) => {
                        break Err(Error::with_message(
                            crate::error::ErrorKind::Protocol,
                            "request on client session",
                        ));
                    }
                    Err(err) => break Err(err),
                },
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        if let Err(err) = result {
            warn!(session = %shared.name, %err, "reader failed");
        }
        Self::inner_close(shared);
        shared.close_gate.release(1);
    }

    async fn write_loop(shared: &Arc<Self>) {
        loop {
            shared.send_gate.acquire(1).await;
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            let batch: Vec<Vec<u8>> = shared.queue.lock().drain(..).collect();
            if batch.is_empty() {
                continue;
            }
            let Some(stream) = shared.stream.read().clone() else {
                break;
            };
            let mut failed = false;
            for frame in batch {
                if let Err(err) = stream.write_exact(&frame).await {
                    warn!(session = %shared.name, %err, "writer failed");
                    failed = true;
                    break;
                }
            }
            if failed {
                break;
            }
        }
        Self::inner_close(shared);
        shared.close_gate.release(1);
    }

    fn deliver(shared: &Arc<Self>, response: Response) {
        let ctx = shared.ctxs.write().remove(&response.sn);
        match ctx {
            Some(ctx) => {
                trace!(session = %shared.name, sn = response.sn, "response delivered");
                ctx.complete(Ok(response));
            }
            None => {
                // Already timed out; late responses are dropped silently.
                trace!(session = %shared.name, sn = response.sn, "late response dropped");
            }
        }
    }

    fn timeout_request(shared: &Arc<Self>, sn: u32) {
        let ctx = shared.ctxs.write().remove(&sn);
        if let Some(ctx) = ctx {
            ctx.timed_out.store(true, Ordering::Release);
            debug!(session = %shared.name, sn, "request timed out");
            ctx.complete(Err(SessionError::Timeout));
        }
    }

    fn inner_close(shared: &Arc<Self>) {
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session = %shared.name, "session closing");

        let pending: Vec<Arc<RequestCtx>> =
            shared.ctxs.write().drain().map(|(_, ctx)| ctx).collect();
        for ctx in pending {
            trace!(session = %shared.name, sn = ctx.sn, "pending request failed by close");
            ctx.complete(Err(SessionError::Io));
        }
        shared.queue.lock().clear();

        if let Some(stream) = shared.stream.write().take() {
            stream.close();
        }
        // Pop the writer out of its gate wait.
        shared.send_gate.release(1);

        if let Some(cb) = shared.disconnect_cb.read().clone() {
            let worker = shared.worker.clone();
            worker.spawn(async move {
                cb();
            });
        }

        if shared.auto_connect.load(Ordering::Acquire) && shared.started.load(Ordering::Acquire) {
            let supervisor = Arc::clone(shared);
            shared.io.spawn(async move {
                Self::reconnect_loop(&supervisor).await;
            });
        }
    }

    async fn reconnect_loop(shared: &Arc<Self>) {
        // Both loops must be gone before the stream slot is reused.
        shared.close_gate.acquire(2).await;
        let Some(addr) = shared.addr else { return };
        loop {
            if !shared.auto_connect.load(Ordering::Acquire) {
                return;
            }
            sleep(shared.reconnect_interval).await;
            if !shared.auto_connect.load(Ordering::Acquire) {
                return;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    *shared.stream.write() = Some(stream);
                    shared.queue.lock().clear();
                    shared.closed.store(false, Ordering::Release);
                    if let Some(cb) = shared.connect_cb.read().clone() {
                        if !cb() {
                            // Rejected: tear down by hand (the loops are
                            // not running) and keep retrying.
                            shared.closed.store(true, Ordering::Release);
                            if let Some(stream) = shared.stream.write().take() {
                                stream.close();
                            }
                            continue;
                        }
                    }
                    info!(session = %shared.name, %addr, "session reconnected");
                    Self::launch(shared);
                    return;
                }
                Err(err) => {
                    debug!(session = %shared.name, %addr, %err, "reconnect attempt failed");
                }
            }
        }
    }
}
