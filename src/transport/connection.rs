//! # Connection
//!
//! One instance per socket. Owns the socket halves, the inbound scratch
//! buffers, the outbound queue and the lifecycle flags. Lives in the
//! reactor's connection map and is only ever touched from the reactor task;
//! I/O continuations refer to it by [`ConnectionId`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use socket2::SockRef;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::framing::SizeLimits;
use crate::transport::inbound::FrameReader;
use crate::transport::outbound::OutboundQueue;
use crate::transport::shutdown::{ShutdownSequencer, ShutdownState};
use crate::utils::metrics::PeerMetrics;

/// Stable identifier captured by every continuation instead of the connection itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    WeCalledRemote,
    RemoteCalledUs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound connect in progress
    Connecting,
    Connected,
    /// Session layer authenticated the peer; the large message ceiling applies
    Authenticated,
    /// Dropped; teardown running or deferred
    Closing,
}

/// Who initiated a drop, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDirection {
    WeDroppedRemote,
    RemoteDroppedUs,
}

/// What happens to queued outbound messages when a connection is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    /// Shut down now; queued messages are abandoned
    DiscardPendingWrites,
    /// Shut down once the writer has drained the queue
    DrainPendingWrites,
}

pub(crate) type PeerReader = BufReader<OwnedReadHalf>;
pub(crate) type PeerWriter = BufWriter<OwnedWriteHalf>;

/// The read half together with the scratch buffers it fills
#[derive(Debug)]
pub(crate) struct Inbound {
    pub reader: PeerReader,
    pub frame: FrameReader,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub role: PeerRole,
    pub state: ConnectionState,
    pub shutdown: ShutdownState,
    pub peer_addr: Option<SocketAddr>,
    /// Messages queued or in flight
    pub queued: usize,
    pub writing: bool,
    pub delayed_shutdown: bool,
    pub metrics: PeerMetrics,
}

#[derive(Debug)]
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) role: PeerRole,
    pub(crate) state: ConnectionState,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) created: Instant,
    limits: SizeLimits,
    /// `None` before connect and while a read is outstanding
    pub(crate) inbound: Option<Inbound>,
    /// `None` before connect and while a write or flush is outstanding
    pub(crate) writer: Option<PeerWriter>,
    /// Duplicate descriptor for socket-level operations while halves are lent out
    control: Option<socket2::Socket>,
    pub(crate) queue: OutboundQueue,
    /// An outbound drain is active
    pub(crate) writing: bool,
    pub(crate) shutdown: ShutdownSequencer,
    pub(crate) cancel: CancellationToken,
    pub(crate) idle_timer: Option<AbortHandle>,
    /// I/O tasks that hold part of this connection and have not reported back
    pub(crate) pending_io: usize,
    pub(crate) metrics: PeerMetrics,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, role: PeerRole, limits: SizeLimits) -> Self {
        let state = match role {
            PeerRole::WeCalledRemote => ConnectionState::Connecting,
            PeerRole::RemoteCalledUs => ConnectionState::Connected,
        };
        Self {
            id,
            role,
            state,
            peer_addr: None,
            created: Instant::now(),
            limits,
            inbound: None,
            writer: None,
            control: None,
            queue: OutboundQueue::new(),
            writing: false,
            shutdown: ShutdownSequencer::new(),
            cancel: CancellationToken::new(),
            idle_timer: None,
            pending_io: 0,
            metrics: PeerMetrics::default(),
        }
    }

    /// Take ownership of an established socket and split it into buffered halves.
    pub(crate) fn attach(&mut self, stream: TcpStream, buffer_size: usize) -> io::Result<()> {
        self.peer_addr = stream.peer_addr().ok();
        let control = SockRef::from(&stream).try_clone()?;
        let (read_half, write_half) = stream.into_split();

        self.control = Some(control);
        self.inbound = Some(Inbound {
            reader: BufReader::with_capacity(buffer_size, read_half),
            frame: FrameReader::new(self.limits),
        });
        self.writer = Some(BufWriter::with_capacity(buffer_size, write_half));
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    /// Dropped already; no new reads or sends
    pub fn should_abort(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub(crate) fn has_socket(&self) -> bool {
        self.control.is_some()
    }

    /// Phase 1: shut down both directions without releasing the descriptor.
    pub(crate) fn half_close(&self) -> io::Result<()> {
        match &self.control {
            Some(socket) => socket.shutdown(std::net::Shutdown::Both),
            None => Ok(()),
        }
    }

    /// Phase 2: release the descriptor. Outstanding reads and writes are
    /// canceled and report back with an error.
    pub(crate) fn close(&mut self) {
        self.cancel.cancel();
        self.inbound = None;
        self.writer = None;
        self.control = None;
    }

    /// Closed and no I/O task still holds part of it
    pub(crate) fn is_reapable(&self) -> bool {
        self.shutdown.state() == ShutdownState::Closed && self.pending_io == 0
    }

    /// Most recent read or write, or creation time if there was none
    pub(crate) fn last_activity(&self) -> Instant {
        self.metrics.last_activity().unwrap_or(self.created)
    }

    pub(crate) fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            role: self.role,
            state: self.state,
            shutdown: self.shutdown.state(),
            peer_addr: self.peer_addr,
            queued: self.queue.len(),
            writing: self.writing,
            delayed_shutdown: self.shutdown.is_delayed(),
            metrics: self.metrics.clone(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel_idle_timer();
        // canceling I/O on a socket that never finished connecting is expected to be a no-op
        self.cancel.cancel();
        if self.control.is_some() {
            debug!(conn = %self.id, "Closing socket still open at destruction");
            self.close();
        }
    }
}
