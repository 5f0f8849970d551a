//! # Overlay Reactor
//!
//! The single task that owns every [`Connection`] and performs every state
//! change on one.
//!
//! Commands from other tasks and completions of asynchronous I/O all arrive
//! as [`Event`]s on one FIFO channel. Async operations (connect, header read,
//! body read, write, flush) run in spawned tasks that borrow the relevant
//! socket half, then post the half back with their result. Continuations
//! carry only a [`ConnectionId`]; when a connection is gone by the time its
//! completion arrives, the completion is a no-op.
//!
//! Shutdown phases are posted to the back of the same channel, so they always
//! run after the I/O completions that were already queued.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::core::envelope::{Envelope, ErrorCode};
use crate::core::framing::{frame, HEADER_SIZE};
use crate::error::{canceled, constants, ProtocolError, Result};
use crate::protocol::session::{ActivePeers, PeerRegistry, SessionHandler};
use crate::transport::connection::{
    Connection, ConnectionId, ConnectionSnapshot, ConnectionState, DropDirection, DropMode,
    Inbound, PeerRole, PeerWriter,
};
use crate::transport::inbound::BufferedRead;
use crate::transport::shutdown::{ShutdownAction, ShutdownEvent};
use crate::utils::metrics::{global_metrics, Metrics};
use crate::utils::yield_timer::YieldTimer;

pub(crate) enum Event {
    Initiate {
        addr: SocketAddr,
        reply: oneshot::Sender<ConnectionId>,
    },
    Accept {
        stream: TcpStream,
        reply: Option<oneshot::Sender<Option<ConnectionId>>>,
    },
    Send {
        id: ConnectionId,
        body: Bytes,
    },
    Drop {
        id: ConnectionId,
        reason: Cow<'static, str>,
        direction: DropDirection,
        mode: DropMode,
    },
    Authenticated {
        id: ConnectionId,
    },
    Snapshot {
        id: ConnectionId,
        reply: oneshot::Sender<Option<ConnectionSnapshot>>,
    },
    Stop,

    Connected {
        id: ConnectionId,
        result: io::Result<TcpStream>,
    },
    HeaderRead {
        id: ConnectionId,
        inbound: Inbound,
        result: io::Result<usize>,
    },
    BodyRead {
        id: ConnectionId,
        inbound: Inbound,
        result: io::Result<usize>,
    },
    Written {
        id: ConnectionId,
        writer: PeerWriter,
        result: io::Result<usize>,
    },
    Flushed {
        id: ConnectionId,
        writer: PeerWriter,
        result: io::Result<()>,
    },
    IdleCheck {
        id: ConnectionId,
    },
    HalfClose {
        id: ConnectionId,
    },
    Close {
        id: ConnectionId,
    },
}

/// Cloneable, `Send` handle for submitting work to the reactor from any task or thread.
#[derive(Clone)]
pub struct OverlayHandle {
    tx: mpsc::UnboundedSender<Event>,
    metrics: Arc<Metrics>,
}

impl OverlayHandle {
    fn submit(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| ProtocolError::ReactorStopped)
    }

    /// Dial `addr`. Returns as soon as the connection exists; the session
    /// layer hears about the outcome through `on_connected` / `on_connect_failed`.
    pub async fn initiate(&self, addr: SocketAddr) -> Result<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Initiate { addr, reply })?;
        rx.await.map_err(|_| ProtocolError::ReactorStopped)
    }

    /// Hand over an already-accepted socket. `None` if it could not be set up.
    pub async fn accept(&self, stream: TcpStream) -> Result<Option<ConnectionId>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Accept {
            stream,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| ProtocolError::ReactorStopped)
    }

    /// Hand over an accepted socket without waiting for the outcome
    pub fn accept_detached(&self, stream: TcpStream) -> Result<()> {
        self.submit(Event::Accept {
            stream,
            reply: None,
        })
    }

    /// Queue one opaque message body; it is framed and written in submission order.
    pub fn send(&self, id: ConnectionId, body: impl Into<Bytes>) -> Result<()> {
        self.submit(Event::Send {
            id,
            body: body.into(),
        })
    }

    pub fn send_envelope(&self, id: ConnectionId, envelope: &Envelope) -> Result<()> {
        self.send(id, envelope.encode()?)
    }

    pub fn drop_connection(
        &self,
        id: ConnectionId,
        reason: impl Into<Cow<'static, str>>,
        direction: DropDirection,
        mode: DropMode,
    ) -> Result<()> {
        self.submit(Event::Drop {
            id,
            reason: reason.into(),
            direction,
            mode,
        })
    }

    /// Raise the inbound ceiling for this peer to the authenticated limit
    pub fn mark_authenticated(&self, id: ConnectionId) -> Result<()> {
        self.submit(Event::Authenticated { id })
    }

    pub async fn snapshot(&self, id: ConnectionId) -> Result<Option<ConnectionSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Snapshot { id, reply })?;
        rx.await.map_err(|_| ProtocolError::ReactorStopped)
    }

    /// Drop every connection and end the reactor once they are all closed
    pub fn stop(&self) -> Result<()> {
        self.submit(Event::Stop)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }
}

/// How a read cycle continues after the synchronous fast path
enum ReadNext {
    Header,
    Body(usize),
    Stop,
    Fail(ProtocolError, &'static str),
}

pub struct Overlay<S, R = ActivePeers> {
    config: ConnectionConfig,
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
    session: S,
    registry: R,
    metrics: Arc<Metrics>,
    handle: OverlayHandle,
    events: mpsc::UnboundedReceiver<Event>,
    stopping: bool,
}

impl<S, R> Overlay<S, R>
where
    S: SessionHandler,
    R: PeerRegistry,
{
    pub fn new(config: ConnectionConfig, session: S, registry: R) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let metrics = global_metrics();
        Self {
            config,
            connections: HashMap::new(),
            next_id: 1,
            session,
            registry,
            metrics: metrics.clone(),
            handle: OverlayHandle { tx, metrics },
            events,
            stopping: false,
        }
    }

    /// Report into a private metrics instance instead of the global one
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.handle.metrics = metrics.clone();
        self.metrics = metrics;
        self
    }

    pub fn handle(&self) -> OverlayHandle {
        self.handle.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run the reactor until [`OverlayHandle::stop`] has closed every connection.
    ///
    /// Hands the session handler and registry back to the caller.
    pub async fn run(mut self) -> (S, R) {
        info!("Overlay reactor started");
        while let Some(event) = self.events.recv().await {
            self.dispatch(event);
            if self.stopping && self.connections.is_empty() {
                break;
            }
        }
        self.metrics.log_metrics();
        info!("Overlay reactor stopped");
        (self.session, self.registry)
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Initiate { addr, reply } => {
                if let Some(id) = self.initiate(addr) {
                    let _ = reply.send(id);
                }
            }
            Event::Accept { stream, reply } => {
                let id = self.accept(stream);
                if let Some(reply) = reply {
                    let _ = reply.send(id);
                }
            }
            Event::Send { id, body } => self.send_message(id, body),
            Event::Drop {
                id,
                reason,
                direction,
                mode,
            } => self.drop_connection(id, &reason, direction, mode),
            Event::Authenticated { id } => self.mark_authenticated(id),
            Event::Snapshot { id, reply } => {
                let _ = reply.send(self.connections.get(&id).map(Connection::snapshot));
            }
            Event::Stop => self.stop(),
            Event::Connected { id, result } => self.connect_handler(id, result),
            Event::HeaderRead {
                id,
                inbound,
                result,
            } => self.read_header_handler(id, inbound, result),
            Event::BodyRead {
                id,
                inbound,
                result,
            } => self.read_body_handler(id, inbound, result),
            Event::Written { id, writer, result } => self.write_done(id, writer, result),
            Event::Flushed { id, writer, result } => self.flush_done(id, writer, result),
            Event::IdleCheck { id } => self.idle_check(id),
            Event::HalfClose { id } => self.half_close(id),
            Event::Close { id } => self.close(id),
        }
    }

    fn post(&self, event: Event) {
        // the receiver lives in `self`, so this cannot fail while the reactor runs
        let _ = self.handle.tx.send(event);
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn register(&mut self, conn: Connection) {
        let (id, role) = (conn.id(), conn.role());
        self.connections.insert(id, conn);
        self.metrics.connection_established();
        self.registry.add_peer(id, role);
        self.start_idle_timer(id, self.config.idle_timeout);
    }

    // ----------------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------------

    fn initiate(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        if self.stopping {
            warn!(peer = %addr, "Refusing to initiate while stopping");
            return None;
        }

        let id = self.allocate_id();
        debug!(conn = %id, peer = %addr, "Initiating connection");
        self.register(Connection::new(
            id,
            PeerRole::WeCalledRemote,
            self.config.size_limits(),
        ));

        let conn = self.connections.get_mut(&id)?;
        conn.pending_io += 1;
        let cancel = conn.cancel.clone();
        let connect_timeout = self.config.connect_timeout;
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(canceled()),
                r = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)) => {
                    r.unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))
                }
            };
            let result = result.and_then(|stream| {
                stream.set_nodelay(true)?;
                Ok(stream)
            });
            let _ = tx.send(Event::Connected { id, result });
        });
        Some(id)
    }

    fn connect_handler(&mut self, id: ConnectionId, result: io::Result<TcpStream>) {
        if !self.io_returned(id) {
            return;
        }

        let outcome = match self.connections.get_mut(&id) {
            Some(conn) if conn.should_abort() => None,
            Some(conn) => Some(result.and_then(|stream| {
                conn.attach(stream, self.config.buffer_size)?;
                conn.state = ConnectionState::Connected;
                Ok(conn.role())
            })),
            None => None,
        };

        match outcome {
            Some(Ok(role)) => {
                debug!(conn = %id, "Connected");
                self.session.on_connected(id, role, &self.handle);
                self.kick_writer(id);
                self.start_read(id);
            }
            Some(Err(e)) => {
                self.metrics.connect_failed();
                debug!(conn = %id, error = %e, "Connect failed");
                let error = match e.kind() {
                    io::ErrorKind::TimedOut => ProtocolError::ConnectionTimeout,
                    _ => ProtocolError::Io(e),
                };
                self.session.on_connect_failed(id, &error);
                self.drop_connection(
                    id,
                    constants::ERR_CONNECT_FAILED,
                    DropDirection::WeDroppedRemote,
                    DropMode::DiscardPendingWrites,
                );
            }
            None => {}
        }
        self.try_reap(id);
    }

    fn accept(&mut self, stream: TcpStream) -> Option<ConnectionId> {
        if self.stopping {
            debug!("Rejecting accepted socket while stopping");
            return None;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Accept abandoned: failed to set TCP_NODELAY");
            return None;
        }

        let id = self.allocate_id();
        let mut conn = Connection::new(id, PeerRole::RemoteCalledUs, self.config.size_limits());
        if let Err(e) = conn.attach(stream, self.config.buffer_size) {
            debug!(error = %e, "Accept abandoned: failed to attach socket");
            return None;
        }
        debug!(conn = %conn, "Accepted connection");
        self.register(conn);

        self.session
            .on_connected(id, PeerRole::RemoteCalledUs, &self.handle);
        self.start_read(id);
        Some(id)
    }

    fn mark_authenticated(&mut self, id: ConnectionId) {
        match self.connections.get_mut(&id) {
            Some(conn) if conn.state() == ConnectionState::Connected => {
                conn.state = ConnectionState::Authenticated;
                debug!(conn = %id, "Peer authenticated");
            }
            Some(conn) => {
                debug!(conn = %id, state = ?conn.state(), "Ignoring authentication in this state");
            }
            None => debug!(conn = %id, "Ignoring authentication for unknown connection"),
        }
    }

    fn drop_connection(
        &mut self,
        id: ConnectionId,
        reason: &str,
        direction: DropDirection,
        mode: DropMode,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.should_abort() {
            return;
        }

        if conn.state() != ConnectionState::Authenticated {
            debug!(conn = %conn, state = ?conn.state(), role = ?conn.role(), reason, "Dropping connection");
        } else if direction == DropDirection::WeDroppedRemote {
            info!(conn = %conn, reason, "Dropping peer");
        } else {
            info!(conn = %conn, reason, "Peer dropped us");
        }

        conn.state = ConnectionState::Closing;
        let writing = conn.writing;
        if mode == DropMode::DiscardPendingWrites {
            let discarded = conn.queue.discard_backlog();
            if discarded > 0 {
                debug!(conn = %id, discarded, "Discarding queued messages");
            }
        }
        self.registry.remove_peer(id);

        // with a drain in progress the writer triggers shutdown once the queue is empty
        if mode == DropMode::DiscardPendingWrites || !writing {
            self.shutdown(id, ShutdownEvent::Requested);
        } else if let Some(conn) = self.connections.get_mut(&id) {
            conn.shutdown.defer();
        }
    }

    fn stop(&mut self) {
        info!(connections = self.connections.len(), "Stopping overlay");
        self.stopping = true;
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if self.should_abort(id) {
                self.abandon_drain(id, constants::ERR_OVERLAY_STOPPING);
            } else {
                self.drop_connection(
                    id,
                    constants::ERR_OVERLAY_STOPPING,
                    DropDirection::WeDroppedRemote,
                    DropMode::DiscardPendingWrites,
                );
            }
        }
    }

    /// Give up on a drain-mode drop still waiting for its queue to empty.
    ///
    /// A peer that stops reading would otherwise hold the connection open
    /// forever.
    fn abandon_drain(&mut self, id: ConnectionId, reason: &str) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.shutdown.is_delayed() || conn.shutdown.is_scheduled() {
            return;
        }
        let discarded = conn.queue.discard_backlog();
        debug!(conn = %id, discarded, reason, "Abandoning drain");
        self.shutdown(id, ShutdownEvent::Requested);
    }

    // ----------------------------------------------------------------------
    // Shutdown
    // ----------------------------------------------------------------------

    fn shutdown(&mut self, id: ConnectionId, event: ShutdownEvent) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.shutdown.apply(event) {
            Ok(ShutdownAction::HalfClose) => {
                conn.cancel_idle_timer();
                self.post(Event::HalfClose { id });
            }
            Ok(_) => {}
            Err(e) => {
                self.metrics.logic_error();
                error!(conn = %id, error = %e, "Double schedule of shutdown");
                error!("{}", constants::ERR_INTERNAL_BUG);
            }
        }
    }

    /// Phase 1: best-effort half-close in both directions
    fn half_close(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = conn.half_close() {
            debug!(conn = %id, error = %e, "Shutdown of socket failed");
        }
        match conn.shutdown.apply(ShutdownEvent::HalfCloseDone) {
            Ok(ShutdownAction::Close) => self.post(Event::Close { id }),
            Ok(_) => {}
            Err(e) => {
                self.metrics.logic_error();
                error!(conn = %id, error = %e, "{}", constants::ERR_INTERNAL_BUG);
            }
        }
    }

    /// Phase 2: release the socket; outstanding I/O reports back canceled
    fn close(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.close();
        if let Err(e) = conn.shutdown.apply(ShutdownEvent::CloseDone) {
            self.metrics.logic_error();
            error!(conn = %id, error = %e, "{}", constants::ERR_INTERNAL_BUG);
        }
        trace!(conn = %id, pending_io = conn.pending_io, "Socket closed");
        self.try_reap(id);
    }

    /// An I/O task reported back. False if the connection no longer exists.
    fn io_returned(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.pending_io = conn.pending_io.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    fn try_reap(&mut self, id: ConnectionId) {
        let reapable = self
            .connections
            .get(&id)
            .is_some_and(Connection::is_reapable);
        if reapable {
            self.connections.remove(&id);
            self.metrics.connection_closed();
            debug!(conn = %id, "Connection released");
            self.session.on_closed(id);
        }
    }

    // ----------------------------------------------------------------------
    // Idle timer
    // ----------------------------------------------------------------------

    fn start_idle_timer(&mut self, id: ConnectionId, after: Duration) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let tx = self.handle.tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Event::IdleCheck { id });
        });
        conn.cancel_idle_timer();
        conn.idle_timer = Some(timer.abort_handle());
    }

    fn idle_check(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.idle_timer.take().is_none() {
            return;
        }
        let draining = conn.shutdown.is_delayed() && !conn.shutdown.is_scheduled();
        if conn.should_abort() && !draining {
            return;
        }

        let idle = conn.last_activity().elapsed();
        if idle >= self.config.idle_timeout {
            if draining {
                self.abandon_drain(id, constants::ERR_IDLE_TIMEOUT);
            } else {
                self.drop_connection(
                    id,
                    constants::ERR_IDLE_TIMEOUT,
                    DropDirection::WeDroppedRemote,
                    DropMode::DiscardPendingWrites,
                );
            }
        } else {
            self.start_idle_timer(id, self.config.idle_timeout - idle);
        }
    }

    // ----------------------------------------------------------------------
    // Outbound
    // ----------------------------------------------------------------------

    fn send_message(&mut self, id: ConnectionId, body: Bytes) {
        let Some(conn) = self.connections.get_mut(&id) else {
            debug!(conn = %id, "Dropping message for unknown connection");
            return;
        };
        if conn.should_abort() {
            self.metrics.logic_error();
            error!(conn = %conn, "Trying to send message after drop");
            error!("{}", constants::ERR_INTERNAL_BUG);
            return;
        }

        let bytes = match frame(&body, self.config.max_message_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(conn = %id, error = %e, "Refusing to queue unframeable message");
                return;
            }
        };
        trace!(conn = %id, bytes = bytes.len(), "Queueing message");
        conn.queue.push(bytes, Instant::now());
        self.kick_writer(id);
    }

    /// Start the drain loop if it is not running and the socket is up
    fn kick_writer(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.writing || conn.writer.is_none() || conn.queue.is_empty() {
            return;
        }
        conn.writing = true;
        self.message_sender(id);
    }

    /// One step of the drain loop: write the head of the queue, or flush when it is empty
    fn message_sender(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(mut writer) = conn.writer.take() else {
            return;
        };
        conn.pending_io += 1;
        let cancel = conn.cancel.clone();
        let tx = self.handle.tx.clone();

        match conn.queue.begin_next(Instant::now()) {
            None => {
                tokio::spawn(async move {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(canceled()),
                        r = writer.flush() => r,
                    };
                    let _ = tx.send(Event::Flushed { id, writer, result });
                });
            }
            Some(bytes) => {
                tokio::spawn(async move {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(canceled()),
                        r = writer.write_all(&bytes) => r.map(|()| bytes.len()),
                    };
                    let _ = tx.send(Event::Written { id, writer, result });
                });
            }
        }
    }

    fn park_writer(&mut self, id: ConnectionId, writer: PeerWriter) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.has_socket() {
                conn.writer = Some(writer);
            }
        }
    }

    fn write_done(&mut self, id: ConnectionId, writer: PeerWriter, result: io::Result<usize>) {
        if !self.io_returned(id) {
            return;
        }
        self.park_writer(id, writer);

        let ok = self.write_handler(id, result);
        if let Some(conn) = self.connections.get_mut(&id) {
            if let Some(timing) = conn.queue.complete(Instant::now()) {
                self.metrics
                    .write_timing(timing.queue_delay(), timing.write_delay());
            }
        }
        if ok {
            self.message_sender(id);
        }
        self.try_reap(id);
    }

    fn flush_done(&mut self, id: ConnectionId, writer: PeerWriter, result: io::Result<()>) {
        if !self.io_returned(id) {
            return;
        }
        self.park_writer(id, writer);

        if self.write_handler(id, result.map(|()| 0)) {
            let more = self
                .connections
                .get(&id)
                .is_some_and(|conn| !conn.queue.is_empty());
            if more {
                self.message_sender(id);
            } else {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.writing = false;
                }
                // a deferred shutdown is safe now that nothing is in flight
                self.shutdown(id, ShutdownEvent::WriteQueueDrained);
            }
        }
        self.try_reap(id);
    }

    /// Common completion handling for writes and flushes. True on success.
    fn write_handler(&mut self, id: ConnectionId, result: io::Result<usize>) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        match result {
            Ok(0) => true,
            Ok(n) => {
                self.metrics.message_sent(n as u64);
                conn.metrics.on_write(n);
                conn.metrics.last_write = Some(Instant::now());
                true
            }
            Err(e) => {
                if conn.is_connected() {
                    // errors while connecting or closing are expected noise
                    self.metrics.write_error();
                    error!(conn = %conn, error = %e, "Error during sending message");
                }
                if conn.shutdown.is_delayed() {
                    if !conn.shutdown.is_scheduled() {
                        self.shutdown(id, ShutdownEvent::Requested);
                    }
                } else {
                    self.drop_connection(
                        id,
                        constants::ERR_DURING_WRITE,
                        DropDirection::WeDroppedRemote,
                        DropMode::DiscardPendingWrites,
                    );
                }
                false
            }
        }
    }

    // ----------------------------------------------------------------------
    // Inbound
    // ----------------------------------------------------------------------

    fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id)
            .is_some_and(Connection::is_authenticated)
    }

    fn should_abort(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).map_or(true, Connection::should_abort)
    }

    fn park_inbound(&mut self, id: ConnectionId, inbound: Inbound) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.has_socket() {
                conn.inbound = Some(inbound);
            }
        }
    }

    /// Read cycle: drain whatever is already buffered, then go async.
    fn start_read(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.should_abort() {
            return;
        }
        let Some(mut inbound) = conn.inbound.take() else {
            return;
        };
        trace!(conn = %id, buffered = inbound.reader.buffer().len(), "Starting read");

        let mut budget = YieldTimer::new(
            self.config.read_yield_budget,
            self.config.read_yield_max_messages,
        );
        let next = loop {
            if !budget.should_keep_going() {
                break ReadNext::Header;
            }
            let authenticated = self.is_authenticated(id);
            match inbound.frame.next_buffered(&mut inbound.reader, authenticated) {
                Ok(BufferedRead::Message(length)) => {
                    self.metrics.sync_read();
                    self.received_bytes(id, length, true);
                    self.recv_message(id, inbound.frame.body());
                    inbound.frame.clear_header();
                    if self.should_abort(id) {
                        break ReadNext::Stop;
                    }
                }
                Ok(BufferedRead::NeedHeader) => break ReadNext::Header,
                Ok(BufferedRead::NeedBody(length)) => break ReadNext::Body(length),
                Err(e) => {
                    let reason = match e {
                        ProtocolError::ShortRead { expected, .. } if expected == HEADER_SIZE => {
                            constants::ERR_HEADER_READ_SOME
                        }
                        ProtocolError::ShortRead { .. } => constants::ERR_BODY_READ_SOME,
                        _ => constants::ERR_DURING_READ,
                    };
                    break ReadNext::Fail(e, reason);
                }
            }
        };

        match next {
            ReadNext::Header => {
                self.metrics.async_read();
                self.spawn_header_read(id, inbound);
            }
            ReadNext::Body(length) => self.spawn_body_read(id, inbound, length),
            ReadNext::Stop => self.park_inbound(id, inbound),
            ReadNext::Fail(e, reason) => {
                self.park_inbound(id, inbound);
                self.inbound_failed(id, e, reason);
            }
        }
    }

    fn spawn_header_read(&mut self, id: ConnectionId, mut inbound: Inbound) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.pending_io += 1;
        let cancel = conn.cancel.clone();
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(canceled()),
                r = inbound.frame.read_header(&mut inbound.reader) => r,
            };
            let _ = tx.send(Event::HeaderRead {
                id,
                inbound,
                result,
            });
        });
    }

    fn spawn_body_read(&mut self, id: ConnectionId, mut inbound: Inbound, length: usize) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.pending_io += 1;
        let cancel = conn.cancel.clone();
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(canceled()),
                r = inbound.frame.read_body(&mut inbound.reader, length) => r,
            };
            let _ = tx.send(Event::BodyRead {
                id,
                inbound,
                result,
            });
        });
    }

    fn read_header_handler(&mut self, id: ConnectionId, inbound: Inbound, result: io::Result<usize>) {
        if !self.io_returned(id) {
            return;
        }

        match result {
            Ok(HEADER_SIZE) if !self.should_abort(id) => {
                self.received_bytes(id, HEADER_SIZE, false);
                match inbound.frame.decode(self.is_authenticated(id)) {
                    Ok(length) => self.spawn_body_read(id, inbound, length),
                    Err(e) => {
                        self.park_inbound(id, inbound);
                        self.inbound_failed(id, e, constants::ERR_DURING_READ);
                    }
                }
            }
            Ok(HEADER_SIZE) => self.park_inbound(id, inbound),
            Ok(n) => {
                self.park_inbound(id, inbound);
                self.inbound_failed(
                    id,
                    ProtocolError::ShortRead {
                        expected: HEADER_SIZE,
                        actual: n,
                    },
                    constants::ERR_DURING_READ,
                );
            }
            Err(e) => {
                self.park_inbound(id, inbound);
                self.read_error(id, e, "header");
            }
        }
        self.try_reap(id);
    }

    fn read_body_handler(&mut self, id: ConnectionId, mut inbound: Inbound, result: io::Result<usize>) {
        if !self.io_returned(id) {
            return;
        }

        match result {
            Ok(_) if self.should_abort(id) => self.park_inbound(id, inbound),
            Ok(n) => {
                self.received_bytes(id, n, true);
                self.recv_message(id, inbound.frame.body());
                inbound.frame.clear_header();
                self.park_inbound(id, inbound);
                self.start_read(id);
            }
            Err(e) => {
                self.park_inbound(id, inbound);
                self.read_error(id, e, "body");
            }
        }
        self.try_reap(id);
    }

    fn received_bytes(&mut self, id: ConnectionId, byte_count: usize, completed_message: bool) {
        self.metrics
            .bytes_read(byte_count as u64, completed_message);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.metrics
                .on_read(byte_count, completed_message, Instant::now());
        }
    }

    /// Asynchronous read failure; cancellation after close lands here too
    fn read_error(&mut self, id: ConnectionId, e: io::Error, stage: &'static str) {
        if let Some(conn) = self.connections.get(&id) {
            if conn.is_connected() {
                self.metrics.read_error();
                if stage == "header" {
                    debug!(conn = %conn, error = %e, stage, "Read error");
                } else {
                    error!(conn = %conn, error = %e, stage, "Read error");
                }
            }
        }
        self.drop_connection(
            id,
            constants::ERR_DURING_READ,
            DropDirection::WeDroppedRemote,
            DropMode::DiscardPendingWrites,
        );
    }

    /// Framing violation or short synchronous read
    fn inbound_failed(&mut self, id: ConnectionId, e: ProtocolError, reason: &'static str) {
        self.metrics.read_error();
        if e.is_protocol_violation() {
            self.metrics.protocol_error();
            let authenticated = self.is_authenticated(id);
            error!(conn = %id, error = %e, authenticated, "Message size unacceptable");
        } else {
            debug!(conn = %id, error = %e, "Synchronous read failed");
        }
        self.drop_connection(
            id,
            reason,
            DropDirection::WeDroppedRemote,
            DropMode::DiscardPendingWrites,
        );
    }

    /// Decode one body and hand it to the session layer
    fn recv_message(&mut self, id: ConnectionId, body: &[u8]) {
        match Envelope::decode(body) {
            Ok(envelope) => {
                self.session
                    .on_envelope_received(id, envelope, &self.handle);
            }
            Err(e) => {
                self.metrics.protocol_error();
                error!(conn = %id, error = %e, "Received corrupt envelope");
                self.send_error_and_drop(
                    id,
                    ErrorCode::Data,
                    constants::ERR_CORRUPT_ENVELOPE,
                    DropMode::DiscardPendingWrites,
                );
            }
        }
    }

    fn send_error_and_drop(&mut self, id: ConnectionId, code: ErrorCode, message: &'static str, mode: DropMode) {
        match Envelope::error(code, message).encode() {
            Ok(body) => self.send_message(id, Bytes::from(body)),
            Err(e) => debug!(conn = %id, error = %e, "Failed to encode error notification"),
        }
        self.drop_connection(id, message, DropDirection::WeDroppedRemote, mode);
    }
}
