use std::collections::HashMap;

use tracing::warn;

use crate::core::envelope::Envelope;
use crate::error::ProtocolError;
use crate::transport::connection::{ConnectionId, PeerRole};
use crate::transport::overlay::OverlayHandle;

/// Session-layer collaborator driven by the reactor.
///
/// Callbacks run on the reactor task and must not block. Replies and drops
/// go through `handle`, which queues them behind the current event.
pub trait SessionHandler: Send + 'static {
    /// The connection is live: outbound after connect + socket options, inbound right after accept
    fn on_connected(&mut self, id: ConnectionId, role: PeerRole, handle: &OverlayHandle);

    /// One decoded envelope, in wire order
    fn on_envelope_received(&mut self, id: ConnectionId, envelope: Envelope, handle: &OverlayHandle);

    /// An outbound connect failed; the connection is dropped right after
    fn on_connect_failed(&mut self, id: ConnectionId, error: &ProtocolError);

    /// The socket is closed and the connection released
    fn on_closed(&mut self, _id: ConnectionId) {}
}

/// Registry of live peers.
pub trait PeerRegistry: Send + 'static {
    fn add_peer(&mut self, id: ConnectionId, role: PeerRole);

    /// Called exactly once per connection, when it is dropped
    fn remove_peer(&mut self, id: ConnectionId);
}

/// In-memory registry keyed by connection id
#[derive(Debug, Default)]
pub struct ActivePeers {
    peers: HashMap<ConnectionId, PeerRole>,
}

impl ActivePeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of live peers in the given role
    pub fn count(&self, role: PeerRole) -> usize {
        self.peers.values().filter(|r| **r == role).count()
    }
}

impl PeerRegistry for ActivePeers {
    fn add_peer(&mut self, id: ConnectionId, role: PeerRole) {
        self.peers.insert(id, role);
    }

    fn remove_peer(&mut self, id: ConnectionId) {
        if self.peers.remove(&id).is_none() {
            warn!(conn = %id, "Removing peer that was not registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_peers_tracks_roles() {
        let mut peers = ActivePeers::new();
        peers.add_peer(ConnectionId::new(1), PeerRole::WeCalledRemote);
        peers.add_peer(ConnectionId::new(2), PeerRole::RemoteCalledUs);
        peers.add_peer(ConnectionId::new(3), PeerRole::RemoteCalledUs);
        assert_eq!(peers.count(PeerRole::RemoteCalledUs), 2);

        peers.remove_peer(ConnectionId::new(2));
        assert!(!peers.contains(ConnectionId::new(2)));
        assert_eq!(peers.len(), 2);
    }
}
