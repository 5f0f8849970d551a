//! # Error Types
//!
//! Error handling for peer connections.
//!
//! This module defines every error variant that can surface while moving bytes
//! between a socket and discrete message boundaries.
//!
//! ## Error Categories
//! - **Protocol Errors**: malformed length, oversized message, corrupt envelope.
//!   Always fatal to the connection since the stream offset can no longer be trusted.
//! - **I/O Errors**: short reads, failed async operations, failed connects
//! - **Logic Errors**: invariant violations such as scheduling shutdown twice
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use peer_transport::core::framing::{decode_header, encode_header, SizeLimits};
//! use peer_transport::error::ProtocolError;
//!
//! let header = encode_header(8192);
//! match decode_header(&header, false, &SizeLimits::default()) {
//!     Err(ProtocolError::MessageTooLarge { length, limit }) => {
//!         assert_eq!(length, 8192);
//!         assert_eq!(limit, 4096);
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Static drop reasons and log messages, borrowed to keep error paths allocation free.
pub mod constants {
    /// Drop reasons reported to the session layer and logs
    pub const ERR_HEADER_READ_SOME: &str = "error during header read_some";
    pub const ERR_BODY_READ_SOME: &str = "error during body read_some";
    pub const ERR_DURING_READ: &str = "error during read";
    pub const ERR_DURING_WRITE: &str = "error during write";
    pub const ERR_CORRUPT_ENVELOPE: &str = "received corrupt envelope";
    pub const ERR_IDLE_TIMEOUT: &str = "idle timeout";
    pub const ERR_CONNECT_FAILED: &str = "connect failed";
    pub const ERR_OVERLAY_STOPPING: &str = "overlay stopping";

    /// Internal invariant violations
    pub const ERR_INTERNAL_BUG: &str =
        "internal invariant violated; this is a bug and should be reported";

    /// Cancellation of pending I/O when the socket is closed
    pub const ERR_OPERATION_CANCELED: &str = "operation canceled: socket closed";
}

/// ProtocolError is the primary error type for all connection operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Malformed message length: {0}")]
    MalformedLength(u32),

    #[error("Message too large: {length} bytes (limit {limit})")]
    MessageTooLarge { length: usize, limit: usize },

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Corrupt envelope: {0}")]
    CorruptEnvelope(String),

    #[error("Invalid shutdown transition: {event} in state {state}")]
    InvalidShutdownTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("Overlay reactor has stopped")]
    ReactorStopped,

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Whether this error is a violation of the wire contract by the remote peer.
    ///
    /// Protocol violations are never retried; the byte position in the
    /// stream is no longer trustworthy once one is seen.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedLength(_)
                | ProtocolError::MessageTooLarge { .. }
                | ProtocolError::CorruptEnvelope(_)
        )
    }

    /// Whether this error reports a broken internal invariant rather than remote input.
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidShutdownTransition { .. }
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// The error handed to pending reads and writes when their socket is closed underneath them.
pub(crate) fn canceled() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        constants::ERR_OPERATION_CANCELED,
    )
}
