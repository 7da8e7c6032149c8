//! A multiplexed connection over one duplex byte stream.
//!
//! [`Connection`] is the handle callers share. It can be driven two ways:
//!
//! - [`Connection::new`] returns the handle together with an [`Inbound`]
//!   half (feed it received bytes) and an [`Outbound`] half (drain it into
//!   the transport). Nothing here touches a socket.
//! - [`Connection::spawn`] and [`Connection::connect`] wire both halves to
//!   an `AsyncRead + AsyncWrite` stream with one reader and one writer task.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use seqwire_framing::{BufferArena, FrameCodec, FramingError, ParserState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ClientConfig;
use crate::engine::{Event, OutboundRequest, ProtocolEngine};
use crate::error::{Error, Result};
use crate::handler::{self, EventHandler, Notification};
use crate::multiplexer::{Dispatch, Multiplexer};
use crate::writer::{self, Outbound, WriteRequest, WriterState};

/// Connection lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting requests.
    Open,
    /// Shutting down; new requests and writes are rejected.
    Closing,
    /// Torn down; every outstanding request has been failed.
    Closed,
}

struct Shared {
    config: ClientConfig,
    multiplexer: Multiplexer,
    writer_state: WriterState,
    encoder: FrameCodec,
    outbound: mpsc::Sender<WriteRequest>,
    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<String>>,
    notifications: mpsc::UnboundedSender<Notification>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Handle to a multiplexed connection. Cloning is cheap.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection that is driven by the caller.
    ///
    /// Feed received bytes to the returned [`Inbound`] and write every frame
    /// taken from the returned [`Outbound`] to the transport, completing
    /// each [`WriteRequest`] with the outcome. Call
    /// [`Connection::on_closed`] when the transport goes away.
    ///
    /// Must be called within a Tokio runtime: the notification pump for
    /// `handler` is spawned here.
    pub fn new<E>(
        engine: Arc<E>,
        config: ClientConfig,
        handler: Arc<dyn EventHandler>,
    ) -> (Self, Inbound<E>, Outbound)
    where
        E: ProtocolEngine,
    {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Open);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(handler::pump(handler, notify_rx, shutdown.clone()));

        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let arena = BufferArena::with_slack(config.arena_slack);

        let connection = Self {
            shared: Arc::new(Shared {
                encoder: FrameCodec::new().with_max_frame_size(config.max_frame_size),
                multiplexer: Multiplexer::new(notify_tx.clone()),
                writer_state: WriterState::new(),
                outbound: outbound_tx,
                state,
                close_reason: Mutex::new(None),
                notifications: notify_tx,
                shutdown,
                tasks,
                config,
            }),
        };

        let inbound = Inbound {
            connection: connection.clone(),
            engine,
            arena,
            codec,
        };

        (connection, inbound, Outbound::new(outbound_rx))
    }

    /// Drive a connection over `stream` with a reader and a writer task.
    ///
    /// The reader reads straight into the receive arena. Both tasks stop when
    /// the connection closes.
    pub fn spawn<S, E>(
        stream: S,
        engine: Arc<E>,
        config: ClientConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        E: ProtocolEngine,
    {
        let read_size_hint = config.read_size_hint;
        let (connection, inbound, outbound) = Self::new(engine, config, handler);
        let (reader, writer) = tokio::io::split(stream);
        let shared = &connection.shared;

        shared.tasks.spawn(read_loop(inbound, reader, read_size_hint));

        let closer = connection.clone();
        shared.tasks.spawn(async move {
            let shared = &closer.shared;
            let result = writer::write_loop(
                writer,
                outbound,
                shared.writer_state.clone(),
                shared.shutdown.clone(),
            )
            .await;
            if let Err(e) = result {
                closer.on_closed(Some(e));
            }
        });

        debug!("connection tasks started");
        connection
    }

    /// Open a TCP connection to `addr` and [`Connection::spawn`] over it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the connect takes longer than
    /// `config.connect_timeout`, or [`Error::Io`] if it fails.
    pub async fn connect<A, E>(
        addr: A,
        engine: Arc<E>,
        config: ClientConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        E: ProtocolEngine,
    {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(config.connect_timeout))??;
        stream.set_nodelay(true)?;

        info!(peer = ?stream.peer_addr().ok(), "connected");

        Ok(Self::spawn(stream, engine, config, handler))
    }

    /// Send a request and wait for its reply.
    ///
    /// The waiter is registered before any byte is written, and the
    /// configured request timeout covers the backpressure wait as well as
    /// the round trip.
    ///
    /// # Errors
    ///
    /// - [`Error::Closing`] or [`Error::ConnectionClosed`] if the connection
    ///   is not open;
    /// - [`Error::DuplicateRequest`] if the sequence id is already in flight;
    /// - [`Error::Framing`] if the payload is too large to frame;
    /// - [`Error::Timeout`] if no reply arrives in time;
    /// - [`Error::Io`] if the transport write fails.
    pub async fn request(&self, request: OutboundRequest) -> Result<Event> {
        self.request_with_token(request, CancellationToken::new())
            .await
    }

    /// Like [`Connection::request`], abandoned with [`Error::Cancelled`] when
    /// `cancel` fires.
    ///
    /// Cancelling after the frame was handed to the writer does not stop the
    /// frame from being written whole.
    ///
    /// # Errors
    ///
    /// See [`Connection::request`].
    #[instrument(
        skip(self, request, cancel),
        fields(sequence_id = request.sequence_id, command = %request.command_name)
    )]
    pub async fn request_with_token(
        &self,
        request: OutboundRequest,
        cancel: CancellationToken,
    ) -> Result<Event> {
        self.ensure_open()?;

        let request_timeout = self.shared.config.request_timeout;
        let slot = self.shared.multiplexer.register_waiter_with_token(
            request.sequence_id,
            request_timeout,
            cancel.clone(),
        )?;
        let frame = self.shared.encoder.encode(&request.payload)?;

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            written = timeout_at(slot.deadline(), self.write_frame(frame)) => written,
        };
        written.map_err(|_| Error::Timeout(request_timeout))??;

        trace!("request written, awaiting reply");
        slot.wait().await
    }

    /// Write a frame without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::request`], minus the reply-related cases.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub async fn fire_and_forget(&self, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let frame = self.shared.encoder.encode(&payload)?;
        self.write_frame(frame).await
    }

    /// Report transport writability. While not writable, writes wait.
    pub fn on_writable(&self, writable: bool) {
        if self.shared.writer_state.set_writable(writable) {
            debug!(writable, "transport writability changed");
        }
    }

    /// Whether writes may proceed right now.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.shared.writer_state.is_writable()
    }

    /// Tear the connection down. Fails every outstanding request with
    /// [`Error::ConnectionClosed`] and stops the I/O tasks.
    ///
    /// Only the first call has any effect. `error`, when given, becomes the
    /// close reason reported to waiters and by [`Connection::wait_closed`].
    pub fn on_closed(&self, error: Option<io::Error>) {
        let reason = error.as_ref().map(ToString::to_string);

        let first = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
            *self.shared.close_reason.lock() = reason.clone();
            true
        });
        if !first {
            return;
        }

        self.shared.shutdown.cancel();
        let failed = self.shared.multiplexer.fail_all(reason.as_deref());
        self.shared.tasks.close();

        match error {
            Some(e) => warn!(error = %e, failed, "connection closed with error"),
            None => info!(failed, "connection closed"),
        }
    }

    /// Close the connection and wait for its tasks to finish.
    ///
    /// Must not be awaited from inside an [`EventHandler`] callback, since
    /// the handler runs on one of the tasks being waited for.
    pub async fn close(&self) {
        let closing = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if closing {
            debug!("connection closing");
        }

        self.on_closed(None);
        self.shared.tasks.wait().await;
    }

    /// Wait until the connection is closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] carrying the reason if the
    /// connection was closed by an error rather than by [`Connection::close`]
    /// or a clean end of stream.
    pub async fn wait_closed(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;

        match self.shared.close_reason.lock().clone() {
            Some(reason) => Err(Error::ConnectionClosed {
                reason: Some(reason),
            }),
            None => Ok(()),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of requests waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.multiplexer.pending_count()
    }

    /// Configuration this connection was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing => Err(Error::Closing),
            ConnectionState::Closed => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> Error {
        Error::closed(self.shared.close_reason.lock().as_deref())
    }

    fn notify(&self, notification: Notification) {
        if self.shared.notifications.send(notification).is_err() {
            debug!("notification dropped, pump is gone");
        }
    }

    /// Wait for writability, hand `frame` to the writer and wait until it is
    /// on the transport.
    async fn write_frame(&self, frame: Bytes) -> Result<()> {
        let shared = &self.shared;

        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => return Err(self.rejection()),
            () = shared.writer_state.wait_writable() => {}
        }

        let (done, completion) = oneshot::channel();
        shared
            .outbound
            .send(WriteRequest::new(frame, done))
            .await
            .map_err(|_| self.closed_error())?;

        match completion.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(self.closed_error()),
        }
    }

    fn rejection(&self) -> Error {
        match self.state() {
            ConnectionState::Closing => Error::Closing,
            _ => self.closed_error(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Receiving half of a [`Connection`].
///
/// Splits received bytes into frames, decodes each one with the engine and
/// routes the result to its waiter or to the [`EventHandler`].
pub struct Inbound<E> {
    connection: Connection,
    engine: Arc<E>,
    arena: BufferArena,
    codec: FrameCodec,
}

impl<E> Inbound<E>
where
    E: ProtocolEngine,
{
    /// Process bytes received from the transport. Returns the number of
    /// frames completed.
    ///
    /// A frame the engine cannot decode is reported to the handler and the
    /// remaining frames are still processed. Frames that complete before a
    /// corrupt length prefix are dispatched before the connection closes.
    ///
    /// # Errors
    ///
    /// - [`Error::Framing`] for empty input (harmless) or a corrupt stream,
    ///   in which case the connection has been closed;
    /// - [`Error::ConnectionClosed`] once the connection is closed.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) -> Result<usize> {
        self.ensure_receiving()?;
        let mut frames = Vec::new();
        let decoded = self.codec.decode_into(bytes, &mut frames);
        self.complete(frames, decoded)
    }

    /// Region the transport can read into directly. Follow with
    /// [`Inbound::commit`].
    pub fn read_region(&mut self, size_hint: usize) -> &mut [u8] {
        self.arena.acquire_write_region(size_hint)
    }

    /// Process the first `n` bytes written into the last
    /// [`Inbound::read_region`]. Returns the number of frames completed.
    ///
    /// # Errors
    ///
    /// Same as [`Inbound::on_bytes_received`], plus
    /// [`seqwire_framing::FramingError::CommitOutOfBounds`] if `n` exceeds
    /// the region.
    pub fn commit(&mut self, n: usize) -> Result<usize> {
        self.ensure_receiving()?;
        let mut frames = Vec::new();
        let decoded = self
            .arena
            .commit_write_into(n, &mut self.codec, &mut frames);
        self.complete(frames, decoded)
    }

    /// Whether bytes of an unfinished frame are buffered.
    #[must_use]
    pub fn has_partial_frame(&self) -> bool {
        self.codec.buffered_len() > 0
            || matches!(self.codec.state(), ParserState::ReadPayload { .. })
    }

    /// The connection this half belongs to.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    fn ensure_receiving(&self) -> Result<()> {
        if self.connection.is_closed() {
            return Err(self.connection.closed_error());
        }
        Ok(())
    }

    /// Dispatch `frames`, then report the codec outcome. Frames completed
    /// before a corrupt prefix reach their waiters before the teardown.
    fn complete(
        &self,
        frames: Vec<Bytes>,
        decoded: seqwire_framing::Result<usize>,
    ) -> Result<usize> {
        let count = self.process(frames);
        decoded
            .map(|_| count)
            .map_err(|e| self.framing_failed(e))
    }

    fn process(&self, frames: Vec<Bytes>) -> usize {
        let count = frames.len();
        let multiplexer = &self.connection.shared.multiplexer;

        for frame in frames {
            match self.engine.decode(&frame) {
                Ok(event) => {
                    let sequence_id = event.sequence_id;
                    let outcome = multiplexer.dispatch(event);
                    trace!(sequence_id, ?outcome, "frame dispatched");
                    if outcome == Dispatch::Stale {
                        debug!(sequence_id, "reply for abandoned request dropped");
                    }
                }
                Err(e) => {
                    warn!(error = %e, len = frame.len(), "failed to decode frame");
                    self.connection.notify(Notification::DecodeFailed(e));
                }
            }
        }

        count
    }

    fn framing_failed(&self, err: FramingError) -> Error {
        if err.is_stream_corrupt() {
            error!(error = %err, "inbound stream corrupt, closing connection");
            self.connection
                .notify(Notification::ProtocolError(err.clone()));
            self.connection.on_closed(Some(err.clone().into()));
        }
        Error::Framing(err)
    }
}

impl<E> std::fmt::Debug for Inbound<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("arena", &self.arena)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

async fn read_loop<E, R>(mut inbound: Inbound<E>, mut reader: R, size_hint: usize)
where
    E: ProtocolEngine,
    R: AsyncRead + Unpin,
{
    let shutdown = inbound.connection.shared.shutdown.clone();

    loop {
        let region = inbound.read_region(size_hint);
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = reader.read(region) => read,
        };

        match read {
            Ok(0) => {
                let error = inbound.has_partial_frame().then(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended mid-frame")
                });
                debug!("peer closed the stream");
                inbound.connection.on_closed(error);
                break;
            }
            Ok(n) => {
                if let Err(e) = inbound.commit(n) {
                    debug!(error = %e, "stopping reader");
                    break;
                }
            }
            Err(e) => {
                inbound.connection.on_closed(Some(e));
                break;
            }
        }
    }

    debug!("reader stopped");
}
