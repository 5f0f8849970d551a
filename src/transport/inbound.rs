//! # Inbound Reader
//!
//! Turns a buffered byte stream into framed message bodies.
//!
//! Messages whose header and body are already sitting in the stream buffer
//! are assembled synchronously through [`FrameReader::next_buffered`]; only
//! when the buffer runs dry does the caller fall back to the async
//! [`FrameReader::read_header`] / [`FrameReader::read_body`] pair. A header
//! consumed on the fast path is never read a second time.

use std::io;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader};

use crate::core::framing::{decode_header, SizeLimits, HEADER_SIZE};
use crate::error::{ProtocolError, Result};

/// Outcome of one synchronous step over buffered input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedRead {
    /// A complete body is available via [`FrameReader::body`]
    Message(usize),
    /// Fewer than [`HEADER_SIZE`] bytes are buffered; issue an async header read
    NeedHeader,
    /// The header was consumed but the body is incomplete; issue an async body read
    NeedBody(usize),
}

/// Header and body scratch buffers for the single message being assembled.
#[derive(Debug)]
pub struct FrameReader {
    header: [u8; HEADER_SIZE],
    body: Vec<u8>,
    limits: SizeLimits,
}

impl FrameReader {
    pub fn new(limits: SizeLimits) -> Self {
        Self {
            header: [0u8; HEADER_SIZE],
            body: Vec::new(),
            limits,
        }
    }

    /// Assemble at most one message from bytes already in `reader`'s buffer.
    ///
    /// Never touches the underlying stream.
    pub fn next_buffered<R>(
        &mut self,
        reader: &mut BufReader<R>,
        authenticated: bool,
    ) -> Result<BufferedRead>
    where
        R: AsyncRead + Unpin,
    {
        if reader.buffer().len() < HEADER_SIZE {
            return Ok(BufferedRead::NeedHeader);
        }

        let n = take_buffered(reader, &mut self.header);
        if n != HEADER_SIZE {
            return Err(ProtocolError::ShortRead {
                expected: HEADER_SIZE,
                actual: n,
            });
        }

        let length = self.decode(authenticated)?;
        if reader.buffer().len() < length {
            return Ok(BufferedRead::NeedBody(length));
        }

        self.body.clear();
        self.body.resize(length, 0);
        let n = take_buffered(reader, &mut self.body);
        if n != length {
            return Err(ProtocolError::ShortRead {
                expected: length,
                actual: n,
            });
        }
        Ok(BufferedRead::Message(length))
    }

    /// Read one header from the stream, refilling the buffer as needed.
    pub async fn read_header<R>(&mut self, reader: &mut BufReader<R>) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        reader.read_exact(&mut self.header).await
    }

    /// Read exactly `length` body bytes from the stream.
    pub async fn read_body<R>(&mut self, reader: &mut BufReader<R>, length: usize) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.body.clear();
        self.body.resize(length, 0);
        reader.read_exact(&mut self.body).await
    }

    /// Decode the length held in the header scratch buffer
    pub fn decode(&self, authenticated: bool) -> Result<usize> {
        decode_header(&self.header, authenticated, &self.limits)
    }

    /// The most recently assembled body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Forget the current header once its message has been delivered
    pub fn clear_header(&mut self) {
        self.header = [0u8; HEADER_SIZE];
    }
}

/// Copy as many buffered bytes as fit into `dst` without touching the stream.
fn take_buffered<R>(reader: &mut BufReader<R>, dst: &mut [u8]) -> usize
where
    R: AsyncRead + Unpin,
{
    let n = reader.buffer().len().min(dst.len());
    dst[..n].copy_from_slice(&reader.buffer()[..n]);
    Pin::new(reader).consume(n);
    n
}
