//! # peer-transport
//!
//! Length-framed, full-duplex peer connections over TCP.
//!
//! Each connection carries a stream of opaque messages, each prefixed with a
//! 4-byte big-endian length. A single reactor task owns every connection;
//! callers talk to it through a cloneable [`OverlayHandle`] and receive
//! decoded envelopes through a [`SessionHandler`].
//!
//! ## Quick Start
//! ```no_run
//! use peer_transport::{
//!     ActivePeers, ConnectionId, Envelope, OverlayConfig, Overlay, OverlayHandle, PeerRole,
//!     ProtocolError, SessionHandler,
//! };
//!
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn on_connected(&mut self, _id: ConnectionId, _role: PeerRole, _handle: &OverlayHandle) {}
//!
//!     fn on_envelope_received(&mut self, id: ConnectionId, envelope: Envelope, handle: &OverlayHandle) {
//!         let _ = handle.send_envelope(id, &envelope);
//!     }
//!
//!     fn on_connect_failed(&mut self, _id: ConnectionId, _error: &ProtocolError) {}
//! }
//!
//! # async fn run() -> peer_transport::Result<()> {
//! let config = OverlayConfig::default();
//! let overlay = Overlay::new(config.connection.clone(), Echo, ActivePeers::new());
//! let handle = overlay.handle();
//! let reactor = tokio::spawn(overlay.run());
//!
//! let listener = peer_transport::PeerListener::bind(&config.listener, handle.clone()).await?;
//! // ...
//! listener.shutdown().await;
//! handle.stop()?;
//! let _ = reactor.await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::{ConnectionConfig, ListenerConfig, LoggingConfig, OverlayConfig};
pub use crate::core::envelope::{Envelope, ErrorCode, Payload};
pub use crate::core::framing::{FrameCodec, SizeLimits};
pub use error::{ProtocolError, Result};
pub use protocol::{ActivePeers, PeerRegistry, SessionHandler};
pub use transport::{
    ConnectionId, ConnectionSnapshot, ConnectionState, DropDirection, DropMode, Overlay,
    OverlayHandle, PeerListener, PeerRole,
};
pub use utils::metrics::{global_metrics, Metrics, MetricsSnapshot};
