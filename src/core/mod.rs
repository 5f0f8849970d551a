//! # Core Framing Components
//!
//! Low-level message framing and envelope decoding.
//!
//! This module provides the foundation for the connection layer, handling
//! message boundaries inside a continuous byte stream and the envelope
//! carried inside each framed body.
//!
//! ## Components
//! - **Framing**: 4-byte length header encode/decode and a Tokio codec
//! - **Envelope**: the protocol message structure carried in one framed body
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian, bit 31 reserved)] [Envelope(Length)]
//! ```
//!
//! ## Security
//! - Unauthenticated peers are capped at 4 KiB per message
//! - Every peer is capped at 16 MiB per message
//! - Length validation before allocation

pub mod envelope;
pub mod framing;
