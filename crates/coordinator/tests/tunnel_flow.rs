//! Coordinator behaviour against a scripted overlay.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::channel::mpsc as futures_mpsc;
use parking_lot::Mutex;
use stitch_backend::BackendLauncher;
use stitch_coordinator::{
    Coordinator, InboundTunnelHandler, OutboundTunnelService, PeerDiscovery, RetryPolicy,
    peer_queue,
};
use stitch_net_ports::{PortAllocator, PortRange};
use stitch_overlay::{Overlay, OverlayError, PeerAddress, PeerId};
use stitch_tasks::TaskManager;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

#[derive(Default)]
struct MockState {
    peers: Vec<PeerId>,
    refuse_connect: HashSet<PeerId>,
    connect_attempts: Vec<PeerId>,
    stream_failures: u32,
    advertised: bool,
    fail_advertise: bool,
}

/// An overlay whose behaviour is scripted through shared state. Streams it
/// hands out are duplex pipes; the far ends arrive on a channel so tests can
/// play the remote peer.
#[derive(Clone)]
struct MockOverlay {
    local: PeerId,
    state: Arc<Mutex<MockState>>,
    far_tx: mpsc::UnboundedSender<DuplexStream>,
}

impl MockOverlay {
    fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (far_tx, far_rx) = mpsc::unbounded_channel();
        let overlay = Self {
            local: PeerId::random(),
            state: Arc::new(Mutex::new(MockState::default())),
            far_tx,
        };
        (overlay, far_rx)
    }
}

impl Overlay for MockOverlay {
    type Stream = Compat<DuplexStream>;

    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn advertise(&self) -> Result<(), OverlayError> {
        let mut state = self.state.lock();
        if state.fail_advertise {
            return Err(OverlayError::Advertise("no known peers".to_string()));
        }
        state.advertised = true;
        Ok(())
    }

    async fn find_peers(&self) -> Result<Vec<PeerId>, OverlayError> {
        Ok(self.state.lock().peers.clone())
    }

    fn add_address(&self, _peer: &PeerAddress) {}

    async fn connect(&self, peer: &PeerAddress) -> Result<(), OverlayError> {
        let mut state = self.state.lock();
        state.connect_attempts.push(peer.peer_id());
        if state.refuse_connect.contains(&peer.peer_id()) {
            return Err(OverlayError::Dial {
                peer: peer.peer_id(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn open_stream(&self, peer: PeerId) -> Result<Self::Stream, OverlayError> {
        {
            let mut state = self.state.lock();
            if state.stream_failures > 0 {
                state.stream_failures -= 1;
                return Err(OverlayError::OpenStream {
                    peer,
                    message: "no route".to_string(),
                });
            }
        }
        let (near, far) = duplex(4096);
        self.far_tx
            .send(far)
            .map_err(|_| OverlayError::OpenStream {
                peer,
                message: "test finished".to_string(),
            })?;
        Ok(near.compat())
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn discovery_filters_out_local_peer() {
    let (overlay, _far) = MockOverlay::new();
    let first = PeerId::random();
    let second = PeerId::random();
    overlay.state.lock().peers = vec![overlay.local_peer_id(), first, second];

    let (tx, mut rx) = peer_queue();
    let discovery =
        PeerDiscovery::new(overlay.clone(), tx).with_poll_interval(Duration::from_millis(10));
    let task = tokio::spawn(discovery.run());

    assert_eq!(rx.recv().await.unwrap().peer_id(), first);
    assert_eq!(rx.recv().await.unwrap().peer_id(), second);
    assert!(overlay.state.lock().advertised);

    // Duplicates across cycles are expected, the local id never is.
    for _ in 0..5 {
        assert_ne!(rx.recv().await.unwrap().peer_id(), overlay.local_peer_id());
    }

    task.abort();
}

#[tokio::test]
async fn discovery_bootstrap_failure_is_an_error() {
    let (overlay, _far) = MockOverlay::new();
    overlay.state.lock().fail_advertise = true;

    let (tx, _rx) = peer_queue();
    let discovery = PeerDiscovery::new(overlay, tx);
    assert!(discovery.run().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_continues_past_unreachable_peer() {
    let manager = TaskManager::current();
    let executor = manager.executor();
    let (overlay, _far) = MockOverlay::new();
    let unreachable = PeerId::random();
    let reachable = PeerId::random();
    overlay.state.lock().refuse_connect.insert(unreachable);

    let (tx, rx) = peer_queue();
    tx.send(PeerAddress::from_peer_id(unreachable)).await.unwrap();
    tx.send(PeerAddress::from_peer_id(reachable)).await.unwrap();
    drop(tx);

    let coordinator = Coordinator::new(
        overlay.clone(),
        executor,
        BackendLauncher::new("true"),
        PortAllocator::new(PortRange::new(34000, 2000)),
        None,
        rx,
    );
    coordinator.run().await.unwrap();

    assert_eq!(
        overlay.state.lock().connect_attempts,
        vec![unreachable, reachable]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_service_bridges_local_connections() {
    let manager = TaskManager::current();
    let executor = manager.executor();
    let (overlay, mut far_rx) = MockOverlay::new();
    let peer = PeerId::random();

    let port = free_port();
    let service = OutboundTunnelService::bind(overlay, executor, peer, port)
        .await
        .unwrap();
    service.spawn();

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(b"to the peer").await.unwrap();

    let mut far = far_rx.recv().await.unwrap();
    let mut buf = [0u8; 11];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to the peer");

    far.write_all(b"and back").await.unwrap();
    let mut reply = [0u8; 8];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"and back");
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_service_keeps_accepting_after_stream_failure() {
    let manager = TaskManager::current();
    let executor = manager.executor();
    let (overlay, mut far_rx) = MockOverlay::new();
    overlay.state.lock().stream_failures = 1;
    let peer = PeerId::random();

    let port = free_port();
    let service = OutboundTunnelService::bind(overlay, executor, peer, port)
        .await
        .unwrap();
    service.spawn();

    // First connection: stream open fails, the connection is dropped.
    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut sink = Vec::new();
    let eof = tokio::time::timeout(Duration::from_secs(5), first.read_to_end(&mut sink)).await;
    assert!(eof.is_ok(), "dropped connection must reach end-of-stream");

    // Second connection: served normally.
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    second.write_all(b"still here").await.unwrap();
    let mut far = far_rx.recv().await.unwrap();
    let mut buf = [0u8; 10];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_tunnel_waits_for_slow_backend() {
    let manager = TaskManager::current();
    let executor = manager.executor();
    let backend_port = free_port();

    let (in_tx, in_rx) = futures_mpsc::unbounded();
    let handler = InboundTunnelHandler::new(
        in_rx,
        BackendLauncher::new("true"),
        PortAllocator::new(PortRange::new(backend_port, 1)),
        executor.clone(),
    )
    .with_retry(RetryPolicy {
        attempts: 50,
        interval: Duration::from_millis(50),
    });
    tokio::spawn(handler.run());

    let (near, far) = duplex(4096);
    in_tx
        .unbounded_send((PeerId::random(), far.compat()))
        .unwrap();

    // The backend's listener only appears after a few dial attempts.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let backend = TcpListener::bind(("127.0.0.1", backend_port)).await.unwrap();
    let (mut served, _) = backend.accept().await.unwrap();

    let (mut near_rd, mut near_wr) = tokio::io::split(near);
    near_wr.write_all(b"payload in").await.unwrap();
    let mut buf = [0u8; 10];
    served.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"payload in");

    served.write_all(b"payload out").await.unwrap();
    let mut reply = [0u8; 11];
    near_rd.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"payload out");
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_tunnel_abandoned_when_backend_never_appears() {
    let manager = TaskManager::current();
    let executor = manager.executor();
    let backend_port = free_port();

    let (in_tx, in_rx) = futures_mpsc::unbounded();
    let handler = InboundTunnelHandler::new(
        in_rx,
        BackendLauncher::new("true"),
        PortAllocator::new(PortRange::new(backend_port, 1)),
        executor.clone(),
    )
    .with_retry(RetryPolicy {
        attempts: 3,
        interval: Duration::from_millis(10),
    });
    tokio::spawn(handler.run());

    let (near, far) = duplex(4096);
    in_tx
        .unbounded_send((PeerId::random(), far.compat()))
        .unwrap();

    // Exhausted retries close the inbound stream.
    let (mut near_rd, _near_wr) = tokio::io::split(near);
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), near_rd.read_to_end(&mut buf))
        .await
        .expect("stream must be closed, not left dangling")
        .unwrap();
    assert_eq!(read, 0);
}
