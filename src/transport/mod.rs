//! # Transport Layer
//!
//! Framed duplex connections over TCP.
//!
//! ## Components
//! - **Overlay**: the reactor task that owns every connection and serializes all state changes
//! - **Connection**: per-socket state: buffered halves, queues, lifecycle flags
//! - **Inbound**: synchronous fast path plus async header/body reads
//! - **Outbound**: FIFO with a single in-flight write
//! - **Shutdown**: two-phase teardown sequencing
//! - **Listener**: accept loop with a connection cap
//!
//! ## Guarantees
//! - Messages are delivered to the peer in submission order, one write at a time
//! - Received messages reach the session layer in wire order
//! - Every connection is torn down at most once, and only after its I/O has returned

pub mod connection;
pub mod inbound;
pub mod listener;
pub mod outbound;
pub mod overlay;
pub mod shutdown;

pub use connection::{
    ConnectionId, ConnectionSnapshot, ConnectionState, DropDirection, DropMode, PeerRole,
};
pub use listener::PeerListener;
pub use overlay::{Overlay, OverlayHandle};
pub use shutdown::ShutdownState;
