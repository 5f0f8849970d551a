//! # Session Layer Contracts
//!
//! The connection layer moves framed envelopes; everything above framing
//! (handshake, authentication, message meaning) lives behind the traits in
//! this module.
//!
//! ## Components
//! - **SessionHandler**: receives connect notifications and decoded envelopes
//! - **PeerRegistry**: tracks live peers; told exactly once when one is dropped

pub mod session;

pub use session::{ActivePeers, PeerRegistry, SessionHandler};
