//! # Authenticated Message Envelope
//!
//! The structure carried inside one framed body. The connection layer only
//! decodes the envelope shell; the meaning of the inner message belongs to
//! the session layer.
//!
//! Encoding is bincode with fixed-width integers, trailing bytes rejected and
//! a size limit equal to the absolute frame ceiling.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, Result};

/// Length of the message authentication code carried by every envelope
pub const MAC_SIZE: usize = 32;

/// Error codes reported to a peer before it is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed data
    Data,
    /// Configuration mismatch
    Conf,
    /// Authentication failure
    Auth,
    /// Resource exhaustion
    Load,
    /// Unspecified
    Misc,
}

/// Envelope contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Last-gasp error notification sent before dropping a peer
    Error { code: ErrorCode, message: String },
    /// Opaque session-layer message
    Message(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    pub payload: Payload,
    pub mac: [u8; MAC_SIZE],
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

impl Envelope {
    /// Wrap an opaque session message
    pub fn message(sequence: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence,
            payload: Payload::Message(body.into()),
            mac: [0u8; MAC_SIZE],
        }
    }

    /// Build an error notification for the remote peer
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            payload: Payload::Error {
                code,
                message: message.into(),
            },
            mac: [0u8; MAC_SIZE],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(options().serialize(self)?)
    }

    /// Decode one framed body. Any malformed encoding is a `CorruptEnvelope`.
    pub fn decode(body: &[u8]) -> Result<Self> {
        options()
            .deserialize(body)
            .map_err(|e| ProtocolError::CorruptEnvelope(e.to_string()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, Payload::Error { .. })
    }
}
