//! End-to-end tests of the overlay reactor against a real loopback peer.
//!
//! The remote side of every connection is driven through `Framed` with the
//! crate's own `FrameCodec`, so both directions speak the wire format.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peer_transport::config::{ListenerConfig, MAX_MESSAGE_SIZE};
use peer_transport::core::framing::{frame, HEADER_SIZE};
use peer_transport::{
    ActivePeers, ConnectionConfig, ConnectionId, ConnectionState, DropDirection, DropMode,
    Envelope, ErrorCode, FrameCodec, Metrics, Overlay, OverlayHandle, Payload, PeerListener,
    PeerRole, ProtocolError, SessionHandler, SizeLimits,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SessionEvent {
    Connected(ConnectionId, PeerRole),
    Envelope(ConnectionId, Envelope),
    ConnectFailed(ConnectionId),
    Closed(ConnectionId),
}

struct Recorder {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandler for Recorder {
    fn on_connected(&mut self, id: ConnectionId, role: PeerRole, _handle: &OverlayHandle) {
        let _ = self.tx.send(SessionEvent::Connected(id, role));
    }

    fn on_envelope_received(&mut self, id: ConnectionId, envelope: Envelope, _handle: &OverlayHandle) {
        let _ = self.tx.send(SessionEvent::Envelope(id, envelope));
    }

    fn on_connect_failed(&mut self, id: ConnectionId, _error: &ProtocolError) {
        let _ = self.tx.send(SessionEvent::ConnectFailed(id));
    }

    fn on_closed(&mut self, id: ConnectionId) {
        let _ = self.tx.send(SessionEvent::Closed(id));
    }
}

struct Harness {
    handle: OverlayHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    metrics: Arc<Metrics>,
    reactor: JoinHandle<(Recorder, ActivePeers)>,
}

impl Harness {
    fn start(config: ConnectionConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::new());
        let overlay = Overlay::new(config, Recorder { tx }, ActivePeers::new())
            .with_metrics(metrics.clone());
        let handle = overlay.handle();
        let reactor = tokio::spawn(overlay.run());
        Self {
            handle,
            events,
            metrics,
            reactor,
        }
    }

    async fn next_event(&mut self) -> SessionEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("reactor dropped the session")
    }

    /// Dial a fresh loopback listener; returns our id and the remote end
    async fn connect_pair(&mut self) -> (ConnectionId, Framed<TcpStream, FrameCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let id = self.handle.initiate(addr).await.unwrap();
        let (remote, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        match self.next_event().await {
            SessionEvent::Connected(connected, PeerRole::WeCalledRemote) => assert_eq!(connected, id),
            other => panic!("expected outbound connect, got {other:?}"),
        }

        let codec = FrameCodec::new(SizeLimits::default()).authenticated();
        (id, Framed::new(remote, codec))
    }

    async fn shutdown(self) -> ActivePeers {
        self.handle.stop().unwrap();
        let (_, registry) = timeout(WAIT, self.reactor).await.unwrap().unwrap();
        registry
    }
}

async fn next_envelope(remote: &mut Framed<TcpStream, FrameCodec>) -> Envelope {
    let body = timeout(WAIT, remote.next())
        .await
        .expect("timed out waiting for frame")
        .expect("remote saw EOF")
        .expect("frame error");
    Envelope::decode(&body).unwrap()
}

/// True once the remote observes EOF or a reset
async fn remote_closed(remote: &mut Framed<TcpStream, FrameCodec>) -> bool {
    loop {
        match timeout(WAIT, remote.next()).await {
            Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

fn send_to_remote(envelope: &Envelope) -> Bytes {
    Bytes::from(envelope.encode().unwrap())
}

#[tokio::test]
async fn test_messages_arrive_in_submission_order() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    for (seq, body) in [(1u64, "alpha"), (2, "beta"), (3, "gamma")] {
        harness
            .handle
            .send_envelope(id, &Envelope::message(seq, body))
            .unwrap();
    }

    for (seq, body) in [(1u64, "alpha"), (2, "beta"), (3, "gamma")] {
        let envelope = next_envelope(&mut remote).await;
        assert_eq!(envelope.sequence, seq);
        assert_eq!(envelope.payload, Payload::Message(body.as_bytes().to_vec()));
    }

    // the writer goes idle once everything is flushed
    let idle = timeout(WAIT, async {
        loop {
            let snapshot = harness.handle.snapshot(id).await.unwrap().unwrap();
            if snapshot.queued == 0 && !snapshot.writing {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(idle.metrics.messages_written, 3);
    assert_eq!(harness.metrics.messages_sent.load(Ordering::Relaxed), 3);

    assert!(harness.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_inbound_envelopes_delivered_in_wire_order() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    for seq in 1..=3u64 {
        remote
            .feed(send_to_remote(&Envelope::message(seq, vec![seq as u8; 16])))
            .await
            .unwrap();
    }
    remote.flush().await.unwrap();

    for seq in 1..=3u64 {
        match harness.next_event().await {
            SessionEvent::Envelope(from, envelope) => {
                assert_eq!(from, id);
                assert_eq!(envelope.sequence, seq);
            }
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    let snapshot = harness.handle.snapshot(id).await.unwrap().unwrap();
    assert_eq!(snapshot.metrics.messages_read, 3);
    harness.shutdown().await;
}

fn wire_bytes(envelope: &Envelope) -> Vec<u8> {
    frame(&envelope.encode().unwrap(), MAX_MESSAGE_SIZE)
        .unwrap()
        .to_vec()
}

async fn expect_envelope(harness: &mut Harness, id: ConnectionId, seq: u64) -> Envelope {
    match harness.next_event().await {
        SessionEvent::Envelope(from, envelope) => {
            assert_eq!(from, id);
            assert_eq!(envelope.sequence, seq);
            envelope
        }
        other => panic!("expected envelope {seq}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_buffered_second_message_takes_fast_path() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    let mut bytes = wire_bytes(&Envelope::message(1, "first"));
    bytes.extend(wire_bytes(&Envelope::message(2, "second")));
    remote.get_mut().write_all(&bytes).await.unwrap();

    expect_envelope(&mut harness, id, 1).await;
    expect_envelope(&mut harness, id, 2).await;
    harness.handle.snapshot(id).await.unwrap();

    // one async header read at connect, one after the buffer ran dry
    assert_eq!(harness.metrics.sync_reads.load(Ordering::Relaxed), 1);
    assert_eq!(harness.metrics.async_reads.load(Ordering::Relaxed), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_partial_body_resumes_without_rereading_header() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    let second = Envelope::message(2, vec![0x33; 64]);
    let mut bytes = wire_bytes(&Envelope::message(1, "first"));
    let second_wire = wire_bytes(&second);
    let split = bytes.len() + HEADER_SIZE + 3;
    bytes.extend(&second_wire);

    remote.get_mut().write_all(&bytes[..split]).await.unwrap();
    expect_envelope(&mut harness, id, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.get_mut().write_all(&bytes[split..]).await.unwrap();

    assert_eq!(expect_envelope(&mut harness, id, 2).await, second);
    harness.handle.snapshot(id).await.unwrap();

    assert_eq!(harness.metrics.sync_reads.load(Ordering::Relaxed), 0);
    assert_eq!(harness.metrics.async_reads.load(Ordering::Relaxed), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_oversized_unauthenticated_message_drops_peer() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    // 5000 bytes is over the unauthenticated ceiling
    let body = send_to_remote(&Envelope::message(1, vec![0u8; 5000]));
    remote.send(body).await.unwrap();

    assert!(remote_closed(&mut remote).await);
    loop {
        match harness.next_event().await {
            SessionEvent::Closed(closed) => {
                assert_eq!(closed, id);
                break;
            }
            SessionEvent::Envelope(..) => panic!("oversized message was delivered"),
            _ => {}
        }
    }
    assert_eq!(harness.metrics.protocol_errors.load(Ordering::Relaxed), 1);
    assert!(harness.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_authenticated_peer_may_send_large_messages() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    harness.handle.mark_authenticated(id).unwrap();
    let snapshot = harness.handle.snapshot(id).await.unwrap().unwrap();
    assert_eq!(snapshot.state, ConnectionState::Authenticated);

    remote
        .send(send_to_remote(&Envelope::message(9, vec![7u8; 5000])))
        .await
        .unwrap();

    match harness.next_event().await {
        SessionEvent::Envelope(_, envelope) => {
            assert_eq!(envelope.payload, Payload::Message(vec![7u8; 5000]));
        }
        other => panic!("expected envelope, got {other:?}"),
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn test_drain_mode_drop_flushes_queue_before_close() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    let large = Envelope::message(1, vec![0xAB; 1 << 20]);
    harness.handle.send_envelope(id, &large).unwrap();
    harness
        .handle
        .send_envelope(id, &Envelope::message(2, "tail"))
        .unwrap();
    harness
        .handle
        .drop_connection(id, "done", DropDirection::WeDroppedRemote, DropMode::DrainPendingWrites)
        .unwrap();

    assert_eq!(next_envelope(&mut remote).await, large);
    assert_eq!(next_envelope(&mut remote).await.sequence, 2);
    assert!(remote_closed(&mut remote).await);

    match harness.next_event().await {
        SessionEvent::Closed(closed) => assert_eq!(closed, id),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(harness.shutdown().await.is_empty());
}

/// Queue more than the socket buffers hold toward a peer that never reads
fn stall_writer(harness: &Harness, id: ConnectionId) {
    for seq in 1..=4u64 {
        harness
            .handle
            .send_envelope(id, &Envelope::message(seq, vec![0x5A; 8 << 20]))
            .unwrap();
    }
    harness
        .handle
        .drop_connection(id, "done", DropDirection::WeDroppedRemote, DropMode::DrainPendingWrites)
        .unwrap();
}

#[tokio::test]
async fn test_stop_abandons_drain_to_stalled_peer() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, _remote) = harness.connect_pair().await;

    stall_writer(&harness, id);
    let snapshot = harness.handle.snapshot(id).await.unwrap().unwrap();
    assert_eq!(snapshot.state, ConnectionState::Closing);

    assert!(harness.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_idle_timer_abandons_drain_to_stalled_peer() {
    let config = ConnectionConfig {
        idle_timeout: Duration::from_millis(300),
        ..ConnectionConfig::default()
    };
    let mut harness = Harness::start(config);
    let (id, _remote) = harness.connect_pair().await;

    stall_writer(&harness, id);
    match harness.next_event().await {
        SessionEvent::Closed(closed) => assert_eq!(closed, id),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(harness.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_discard_mode_drop_closes_connection() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    harness
        .handle
        .drop_connection(id, "bye", DropDirection::WeDroppedRemote, DropMode::DiscardPendingWrites)
        .unwrap();
    assert!(remote_closed(&mut remote).await);

    // sending after the drop is an internal bug, counted but otherwise ignored
    harness.handle.send(id, Bytes::from_static(b"late")).unwrap();
    harness.handle.snapshot(id).await.unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_envelope_closes_connection() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let (id, mut remote) = harness.connect_pair().await;

    remote.send(Bytes::from_static(b"garbage")).await.unwrap();

    // the error notification may or may not make it out before the socket closes
    loop {
        match timeout(WAIT, remote.next()).await.unwrap() {
            Some(Ok(body)) => {
                let envelope = Envelope::decode(&body).unwrap();
                assert!(matches!(
                    envelope.payload,
                    Payload::Error {
                        code: ErrorCode::Data,
                        ..
                    }
                ));
            }
            None | Some(Err(_)) => break,
        }
    }

    match harness.next_event().await {
        SessionEvent::Closed(closed) => assert_eq!(closed, id),
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(harness.metrics.protocol_errors.load(Ordering::Relaxed), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let id = harness.handle.initiate(addr).await.unwrap();
    match harness.next_event().await {
        SessionEvent::ConnectFailed(failed) => assert_eq!(failed, id),
        other => panic!("expected connect failure, got {other:?}"),
    }
    match harness.next_event().await {
        SessionEvent::Closed(closed) => assert_eq!(closed, id),
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(harness.metrics.connect_failures.load(Ordering::Relaxed), 1);
    assert!(harness.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_idle_connection_is_dropped() {
    let config = ConnectionConfig {
        idle_timeout: Duration::from_millis(200),
        ..ConnectionConfig::default()
    };
    let mut harness = Harness::start(config);
    let (id, mut remote) = harness.connect_pair().await;

    assert!(remote_closed(&mut remote).await);
    match harness.next_event().await {
        SessionEvent::Closed(closed) => assert_eq!(closed, id),
        other => panic!("expected close, got {other:?}"),
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn test_listener_hands_peers_to_overlay() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let config = ListenerConfig {
        address: "127.0.0.1:0".to_string(),
        max_connections: 8,
    };
    let listener = PeerListener::bind(&config, harness.handle.clone())
        .await
        .unwrap();

    let client = TcpStream::connect(listener.local_addr()).await.unwrap();
    let id = match harness.next_event().await {
        SessionEvent::Connected(id, PeerRole::RemoteCalledUs) => id,
        other => panic!("expected inbound connect, got {other:?}"),
    };

    let mut client = Framed::new(client, FrameCodec::new(SizeLimits::default()));
    client
        .send(send_to_remote(&Envelope::message(42, "hello")))
        .await
        .unwrap();
    match harness.next_event().await {
        SessionEvent::Envelope(from, envelope) => {
            assert_eq!(from, id);
            assert_eq!(envelope.sequence, 42);
        }
        other => panic!("expected envelope, got {other:?}"),
    }

    listener.shutdown().await;
    let registry = harness.shutdown().await;
    assert!(registry.is_empty());
    assert!(remote_closed(&mut client).await);
}

#[tokio::test]
async fn test_listener_enforces_connection_cap() {
    let mut harness = Harness::start(ConnectionConfig::default());
    let config = ListenerConfig {
        address: "127.0.0.1:0".to_string(),
        max_connections: 1,
    };
    let listener = PeerListener::bind(&config, harness.handle.clone())
        .await
        .unwrap();

    let _first = TcpStream::connect(listener.local_addr()).await.unwrap();
    assert!(matches!(
        harness.next_event().await,
        SessionEvent::Connected(_, PeerRole::RemoteCalledUs)
    ));

    let mut second = TcpStream::connect(listener.local_addr()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // writing into the rejected socket never produces a session event
    let _ = second.write_all(b"ignored").await;
    assert_eq!(harness.metrics.connections_total.load(Ordering::Relaxed), 1);

    listener.shutdown().await;
    harness.shutdown().await;
}
