//! One framed, multiplexed connection over a byte stream.
//!
//! A [`Connection`] owns a socket (any `AsyncRead + AsyncWrite`) and carries
//! three kinds of traffic over it:
//!
//! - fire-and-forget messages ([`Connection::send`])
//! - request/response calls with per-call timeouts ([`Connection::request`])
//! - long-lived ordered streams ([`Connection::open_stream`])
//!
//! # Tasks
//!
//! Each attached connection runs one driver task. The driver reads frames,
//! dispatches them and, concurrently, drains the outbound queue into the
//! socket. `send` only enqueues, so it may be called from any task and never
//! interleaves frames.
//!
//! # Dispatch
//!
//! Every inbound envelope goes to exactly one place:
//!
//! ```text
//! to != 0 && to != local CVID  -> MessageHandler::on_foreign
//! even id with a pending call  -> the waiting ResponseFuture
//! odd id                       -> the stream's consumer (or dropped)
//! anything else                -> MessageHandler::on_message
//! ```
//!
//! # Lifecycle
//!
//! `Connecting -> Handshaking -> Established -> Closing -> Closed`. Entering
//! `Closed` fails every pending request with [`Error::ConnectionClosed`],
//! notifies every open stream once and runs the `on_closed` callbacks once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use protocol::{ids, Cvid, Envelope, FrameCodec, IdKind, MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::correlator::{Correlator, Delivery, ResponseFuture};
use crate::error::{CloseReason, Error, Result};
use crate::multiplexer::{ChannelConsumer, Multiplexer, Routing, StreamConsumer, StreamReceiver};

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// How long a closing connection may spend flushing queued frames.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial capacity of the read buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// The transport is being established.
    Connecting,
    /// The socket is up; CVID exchange and login are in progress.
    Handshaking,
    /// Ready for application traffic.
    Established,
    /// Shutting down; no new traffic accepted.
    Closing,
    /// The socket is released.
    Closed,
}

/// How long a request waits for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// The connection's configured request timeout.
    #[default]
    Default,
    /// A specific deadline.
    After(Duration),
    /// Wait until the response arrives or the connection closes.
    Never,
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest frame body accepted or sent.
    pub max_frame_size: usize,
    /// Deadline used by [`Timeout::Default`]. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Remote address, for logging.
    pub peer_addr: Option<SocketAddr>,
    /// Limit on flushing queued frames after `disconnect`. A peer that stops
    /// reading cannot hold the connection in `Closing` past it.
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            peer_addr: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Sets the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the default request timeout.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the flush limit applied once the connection is closing.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sets the remote address reported in logs.
    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }
}

/// Receives envelopes that are neither responses nor stream traffic.
///
/// Called from the connection's reader; implementations must not block.
/// Spawn a task for anything slow.
pub trait MessageHandler: Send + Sync + 'static {
    /// An unsolicited envelope for this instance: a request, or a message
    /// without an id.
    fn on_message(&self, connection: &Connection, envelope: Envelope);

    /// An envelope addressed to some other CVID.
    ///
    /// Only a hub has anywhere to send these; everyone else drops them.
    fn on_foreign(&self, connection: &Connection, envelope: Envelope) {
        debug!(
            conn = connection.id(),
            to = envelope.to,
            id = envelope.id,
            "Dropping envelope addressed to another instance"
        );
    }
}

impl<F> MessageHandler for F
where
    F: Fn(&Connection, Envelope) + Send + Sync + 'static,
{
    fn on_message(&self, connection: &Connection, envelope: Envelope) {
        self(connection, envelope)
    }
}

/// Handler that forwards unsolicited envelopes into a channel.
pub struct ChannelHandler(pub mpsc::UnboundedSender<Envelope>);

impl ChannelHandler {
    /// Create a handler and the receiver it feeds.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, _connection: &Connection, envelope: Envelope) {
        let _ = self.0.send(envelope);
    }
}

/// Where an inbound envelope went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to [`MessageHandler::on_foreign`].
    Foreign,
    /// Completed a pending request.
    Response,
    /// Delivered to a stream consumer.
    Stream,
    /// Discarded (undecodable, or for an unknown stream).
    Dropped,
    /// Handed to [`MessageHandler::on_message`].
    Unsolicited,
}

type ClosedCallback = Box<dyn FnOnce(&CloseReason) + Send>;

enum Outbound {
    Frame(Bytes),
    Shutdown,
}

struct Shared {
    id: u64,
    peer_addr: Option<SocketAddr>,
    codec: FrameCodec,
    request_timeout: Option<Duration>,
    drain_timeout: Duration,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    attached: AtomicBool,
    state: watch::Sender<ConnectionState>,
    correlator: Arc<Correlator>,
    streams: Multiplexer,
    local_cvid: AtomicU32,
    remote_cvid: AtomicU32,
    close_reason: Mutex<Option<CloseReason>>,
    /// `None` once the callbacks have run.
    on_closed: Mutex<Option<Vec<ClosedCallback>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a connection. Cheap to clone; all clones refer to the same socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection in the `Connecting` state, before its socket
    /// exists.
    ///
    /// Must be called within a tokio runtime. Messages sent before
    /// [`attach`](Self::attach) are queued.
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let shared = Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: config.peer_addr,
            codec: FrameCodec::with_max_frame_size(config.max_frame_size),
            request_timeout: config.request_timeout,
            drain_timeout: config.drain_timeout,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            attached: AtomicBool::new(false),
            state,
            correlator: Correlator::new(Handle::current()),
            streams: Multiplexer::new(),
            local_cvid: AtomicU32::new(0),
            remote_cvid: AtomicU32::new(0),
            close_reason: Mutex::new(None),
            on_closed: Mutex::new(Some(Vec::new())),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Create a connection over an already-connected socket and start its
    /// driver task. The connection starts in `Handshaking`.
    pub fn spawn<T, H>(io: T, config: ConnectionConfig, handler: H) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        H: MessageHandler,
    {
        let connection = Self::new(config);
        connection.attach(io, handler);
        connection
    }

    /// Hand the connected socket to a connection created with
    /// [`new`](Self::new) and start its driver task.
    ///
    /// Has no effect if the connection was already attached or closed.
    pub fn attach<T, H>(&self, io: T, handler: H)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        H: MessageHandler,
    {
        let Some(outbound_rx) = lock(&self.shared.outbound_rx).take() else {
            warn!(conn = self.id(), "Connection already attached");
            return;
        };
        if self.state() >= ConnectionState::Closing {
            return;
        }
        self.shared.attached.store(true, Ordering::SeqCst);
        self.transition(ConnectionState::Handshaking);

        debug!(conn = self.id(), peer = ?self.shared.peer_addr, "Connection attached");

        let driver = self.clone();
        tokio::spawn(async move {
            driver.drive(io, outbound_rx, Arc::new(handler)).await;
        });
    }

    async fn drive<T>(
        self,
        io: T,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        handler: Arc<dyn MessageHandler>,
    ) where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(io);

        let reason = tokio::select! {
            reason = self.read_loop(reader, handler.as_ref()) => reason,
            reason = write_loop(writer, outbound_rx) => reason,
            reason = self.drain_deadline() => reason,
        };

        self.finalize(reason);
    }

    /// Resolves `drain_timeout` after the connection starts closing, so a
    /// writer stuck on a peer that stopped reading gets dropped.
    async fn drain_deadline(&self) -> CloseReason {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s >= ConnectionState::Closing).await;
        tokio::time::sleep(self.shared.drain_timeout).await;
        warn!(
            conn = self.id(),
            timeout = ?self.shared.drain_timeout,
            "Outbound queue not drained in time, dropping socket"
        );
        self.close_reason().unwrap_or(CloseReason::LocalDisconnect)
    }

    async fn read_loop<R>(&self, mut reader: R, handler: &dyn MessageHandler) -> CloseReason
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            loop {
                match self.shared.codec.decode_buf(&mut buffer) {
                    Ok(Some(frame)) => {
                        let outcome = self.dispatch(frame.payload, handler);
                        trace!(conn = self.id(), ?outcome, "Dispatched envelope");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn = self.id(), error = %e, "Fatal framing error");
                        return CloseReason::Protocol(e.to_string());
                    }
                }
            }

            match reader.read_buf(&mut buffer).await {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(_) => {}
                Err(e) => return CloseReason::Io(e.to_string()),
            }
        }
    }

    /// Route one frame body.
    fn dispatch(&self, body: Bytes, handler: &dyn MessageHandler) -> Dispatch {
        let envelope = match Envelope::from_bytes(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = self.id(), error = %e, "Dropping undecodable envelope");
                return Dispatch::Dropped;
            }
        };

        trace!(
            conn = self.id(),
            id = envelope.id,
            to = envelope.to,
            from = envelope.from,
            len = envelope.payload.len(),
            "Received envelope"
        );

        let local = self.local_cvid();
        if envelope.to != 0 && local != 0 && envelope.to != local {
            handler.on_foreign(self, envelope);
            return Dispatch::Foreign;
        }

        match envelope.kind() {
            IdKind::Request => match self.shared.correlator.deliver(envelope) {
                Delivery::Consumed => Dispatch::Response,
                Delivery::NotMine(envelope) => {
                    handler.on_message(self, envelope);
                    Dispatch::Unsolicited
                }
            },
            IdKind::Stream => match self.shared.streams.route(envelope) {
                Routing::Consumed => Dispatch::Stream,
                Routing::Dropped => Dispatch::Dropped,
                Routing::NotMine(envelope) => {
                    handler.on_message(self, envelope);
                    Dispatch::Unsolicited
                }
            },
            IdKind::None => {
                handler.on_message(self, envelope);
                Dispatch::Unsolicited
            }
        }
    }

    /// Tear down once. Safe to call from several paths; only the first does
    /// anything.
    fn finalize(&self, reason: CloseReason) {
        let reason = {
            let mut stored = lock(&self.shared.close_reason);
            stored.get_or_insert(reason).clone()
        };

        let callbacks = lock(&self.shared.on_closed).take();
        let Some(callbacks) = callbacks else {
            return;
        };

        self.transition(ConnectionState::Closing);
        self.shared.correlator.close(reason.clone());
        self.shared.streams.close_all(reason.clone());
        self.transition(ConnectionState::Closed);

        info!(conn = self.id(), peer = ?self.shared.peer_addr, %reason, "Connection closed");

        for callback in callbacks {
            callback(&reason);
        }
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send a fire-and-forget message to `to` (0 = the directly connected peer).
    pub fn send(&self, to: Cvid, payload: impl Into<Bytes>) -> Result<()> {
        self.send_envelope(Envelope::new(to, payload))
    }

    /// Send a prepared envelope. A zero `from` is filled with the local CVID.
    ///
    /// Gives no delivery confirmation; the envelope is queued for the writer.
    pub fn send_envelope(&self, mut envelope: Envelope) -> Result<()> {
        if self.state() >= ConnectionState::Closing {
            return Err(self.closed_error());
        }
        if envelope.from == 0 {
            envelope.from = self.local_cvid();
        }

        let body = envelope.to_bytes();
        let mut frame = BytesMut::new();
        self.shared.codec.encode_into(&body, &mut frame)?;

        trace!(
            conn = self.id(),
            id = envelope.id,
            to = envelope.to,
            len = body.len(),
            "Queueing envelope"
        );

        self.shared
            .outbound
            .send(Outbound::Frame(frame.freeze()))
            .map_err(|_| self.closed_error())
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// The returned future resolves to the response, [`Error::Timeout`],
    /// or [`Error::ConnectionClosed`].
    pub fn request(
        &self,
        to: Cvid,
        payload: impl Into<Bytes>,
        timeout: impl Into<Timeout>,
    ) -> ResponseFuture {
        let id = ids::next_request_id();
        let deadline = match timeout.into() {
            Timeout::Default => self.shared.request_timeout,
            Timeout::After(duration) => Some(duration),
            Timeout::Never => None,
        };

        // Registered before sending so a fast response always finds its call.
        let future = match self.shared.correlator.register(id, deadline) {
            Ok(future) => future,
            Err(e) => return ResponseFuture::failed(id, e),
        };

        if let Err(e) = self.send_envelope(Envelope::new(to, payload).with_id(id)) {
            self.shared.correlator.fail(id, e);
        }
        future
    }

    /// Answer `request` with `payload`, reusing its id.
    pub fn respond(&self, request: &Envelope, payload: impl Into<Bytes>) -> Result<()> {
        self.send_envelope(request.reply(payload))
    }

    /// Fail a pending request with [`Error::Cancelled`].
    pub fn cancel(&self, id: i32) -> bool {
        self.shared.correlator.cancel(id)
    }

    /// Open a stream to the directly connected peer.
    pub fn open_stream(&self) -> Result<(StreamHandle, StreamReceiver)> {
        self.open_stream_to(0)
    }

    /// Open a stream to `to`, delivering its events to a channel.
    pub fn open_stream_to(&self, to: Cvid) -> Result<(StreamHandle, StreamReceiver)> {
        let (consumer, rx) = ChannelConsumer::new();
        let handle = self.open_stream_with(to, Arc::new(consumer))?;
        Ok((handle, rx))
    }

    /// Open a stream to `to` with a custom consumer under a fresh odd id.
    ///
    /// The stream is registered before this returns, so envelopes for it are
    /// never dropped once the peer learns the id.
    pub fn open_stream_with(
        &self,
        to: Cvid,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Result<StreamHandle> {
        loop {
            let id = ids::next_stream_id();
            match self.shared.streams.open(id, consumer.clone()) {
                Ok(()) => return Ok(self.stream_handle(id, to)),
                Err(Error::StreamExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Register a consumer for a stream id chosen by the peer.
    pub fn attach_stream(
        &self,
        id: i32,
        to: Cvid,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Result<StreamHandle> {
        self.shared.streams.open(id, consumer)?;
        Ok(self.stream_handle(id, to))
    }

    fn stream_handle(&self, id: i32, to: Cvid) -> StreamHandle {
        StreamHandle {
            id,
            to,
            connection: self.clone(),
        }
    }

    /// Close stream `id` locally, notifying its consumer.
    pub fn close_stream(&self, id: i32) -> bool {
        self.shared.streams.close(id)
    }

    /// Close the connection. Queued frames are written first.
    pub fn disconnect(&self) {
        self.close_with(CloseReason::LocalDisconnect);
    }

    /// Close the connection with a specific reason.
    pub fn close_with(&self, reason: CloseReason) {
        {
            let mut stored = lock(&self.shared.close_reason);
            if stored.is_none() {
                *stored = Some(reason.clone());
            }
        }

        if !self.transition(ConnectionState::Closing) {
            return;
        }
        debug!(conn = self.id(), %reason, "Disconnecting");

        if self.shared.attached.load(Ordering::SeqCst) {
            let _ = self.shared.outbound.send(Outbound::Shutdown);
        } else {
            self.finalize(reason);
        }
    }

    /// Register a callback to run once when the connection closes.
    ///
    /// Runs immediately if the connection is already closed.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(&CloseReason) + Send + 'static,
    {
        {
            let mut callbacks = lock(&self.shared.on_closed);
            if let Some(callbacks) = callbacks.as_mut() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(&self.close_reason().unwrap_or(CloseReason::LocalDisconnect));
    }

    /// Wait until the connection is closed and return why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        self.close_reason().unwrap_or(CloseReason::LocalDisconnect)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Process-unique id for logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the handshake has completed and the connection is open.
    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Move from `Handshaking` to `Established`.
    pub fn mark_established(&self) -> bool {
        self.state() == ConnectionState::Handshaking
            && self.transition(ConnectionState::Established)
    }

    /// Why the connection closed, once it is closing.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared.close_reason).clone()
    }

    fn closed_error(&self) -> Error {
        Error::ConnectionClosed(self.close_reason().unwrap_or(CloseReason::LocalDisconnect))
    }

    /// This instance's CVID on the connection, 0 until assigned.
    pub fn local_cvid(&self) -> Cvid {
        self.shared.local_cvid.load(Ordering::SeqCst)
    }

    pub fn set_local_cvid(&self, cvid: Cvid) {
        self.shared.local_cvid.store(cvid, Ordering::SeqCst);
    }

    /// The peer's CVID, 0 until known.
    pub fn remote_cvid(&self) -> Cvid {
        self.shared.remote_cvid.load(Ordering::SeqCst)
    }

    pub fn set_remote_cvid(&self, cvid: Cvid) {
        self.shared.remote_cvid.store(cvid, Ordering::SeqCst);
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending()
    }

    /// Number of live streams.
    pub fn open_streams(&self) -> usize {
        self.shared.streams.len()
    }

    /// Whether two handles refer to the same connection.
    pub fn ptr_eq(a: &Connection, b: &Connection) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("local_cvid", &self.local_cvid())
            .field("remote_cvid", &self.remote_cvid())
            .finish()
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>) -> CloseReason
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let written = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    return CloseReason::Io(e.to_string());
                }
            }
            Outbound::Shutdown => {
                let _ = writer.shutdown().await;
                return CloseReason::LocalDisconnect;
            }
        }
    }
    CloseReason::LocalDisconnect
}

/// Sending side of a stream.
///
/// Dropping the handle does not close the stream; call
/// [`close`](Self::close) or [`Connection::close_stream`].
#[derive(Clone, Debug)]
pub struct StreamHandle {
    id: i32,
    to: Cvid,
    connection: Connection,
}

impl StreamHandle {
    /// The stream's odd id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The stream's remote end.
    pub fn recipient(&self) -> Cvid {
        self.to
    }

    /// Send a message on the stream.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.connection
            .send_envelope(Envelope::new(self.to, payload).with_id(self.id))
    }

    /// Close the stream locally.
    pub fn close(&self) -> bool {
        self.connection.close_stream(self.id)
    }
}
