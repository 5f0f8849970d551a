//! # Message Framing
//!
//! Every message on the wire is a 4-byte big-endian length header followed by
//! exactly that many body bytes. The most significant bit of the header is a
//! reserved continuation flag and is masked off before the remaining 31 bits
//! are read as the body length.
//!
//! Framing errors are never recoverable mid-stream: once a bad length is seen
//! the offset of the next message cannot be trusted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::{MAX_MESSAGE_SIZE, MAX_UNAUTH_MESSAGE_SIZE};
use crate::error::{ProtocolError, Result};

/// Size of the length header in bytes
pub const HEADER_SIZE: usize = 4;

/// Reserved continuation flag carried in the top bit of the header
pub const CONTINUATION_BIT: u32 = 0x8000_0000;

/// Size ceilings applied when decoding incoming headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    /// Ceiling while the peer has not authenticated
    pub unauthenticated: usize,
    /// Absolute ceiling for any peer
    pub authenticated: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            unauthenticated: MAX_UNAUTH_MESSAGE_SIZE,
            authenticated: MAX_MESSAGE_SIZE,
        }
    }
}

impl SizeLimits {
    /// The ceiling that applies to a peer in the given authentication state
    #[inline]
    pub fn limit_for(&self, authenticated: bool) -> usize {
        if authenticated {
            self.authenticated
        } else {
            self.unauthenticated.min(self.authenticated)
        }
    }
}

/// Decode a length header into a body length.
///
/// Bit 31 is ignored. A zero length is `MalformedLength`; a length over the
/// ceiling for the peer's authentication state is `MessageTooLarge`.
pub fn decode_header(
    header: &[u8; HEADER_SIZE],
    authenticated: bool,
    limits: &SizeLimits,
) -> Result<usize> {
    let raw = u32::from_be_bytes(*header) & !CONTINUATION_BIT;
    if raw == 0 {
        return Err(ProtocolError::MalformedLength(raw));
    }

    let length = raw as usize;
    let limit = limits.limit_for(authenticated);
    if length > limit {
        return Err(ProtocolError::MessageTooLarge { length, limit });
    }
    Ok(length)
}

/// Encode a body length into a header.
///
/// The caller has already validated the length against its ceiling; only
/// the low 31 bits are representable.
#[inline]
pub fn encode_header(length: usize) -> [u8; HEADER_SIZE] {
    debug_assert!(length <= !CONTINUATION_BIT as usize);
    ((length as u32) & !CONTINUATION_BIT).to_be_bytes()
}

/// Build one complete frame (header + body) ready for the outbound queue.
pub fn frame(body: &[u8], max_message_size: usize) -> Result<Bytes> {
    if body.is_empty() {
        return Err(ProtocolError::MalformedLength(0));
    }
    if body.len() > max_message_size {
        return Err(ProtocolError::MessageTooLarge {
            length: body.len(),
            limit: max_message_size,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_slice(&encode_header(body.len()));
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Tokio codec speaking the same framing, for driving a peer through
/// `tokio_util::codec::Framed`.
///
/// Decoded items are message bodies without their header.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    limits: SizeLimits,
    authenticated: bool,
}

impl FrameCodec {
    pub fn new(limits: SizeLimits) -> Self {
        Self {
            limits,
            authenticated: false,
        }
    }

    /// Apply the authenticated ceiling to incoming frames
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&src[..HEADER_SIZE]);
        let length = decode_header(&header, self.authenticated, &self.limits)?;

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        trace!(length, "Decoded frame");
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<()> {
        if body.is_empty() {
            return Err(ProtocolError::MalformedLength(0));
        }
        if body.len() > self.limits.authenticated {
            return Err(ProtocolError::MessageTooLarge {
                length: body.len(),
                limit: self.limits.authenticated,
            });
        }

        dst.reserve(HEADER_SIZE + body.len());
        dst.put_slice(&encode_header(body.len()));
        dst.put_slice(&body);
        Ok(())
    }
}
