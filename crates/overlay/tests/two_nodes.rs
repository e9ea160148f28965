//! Two-node overlay tests over loopback TCP.

use std::time::Duration;

use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use stitch_overlay::{Overlay, OverlayConfig, OverlayHandle, OverlayService, PeerAddress};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

async fn spawn_node() -> (OverlayHandle, PeerAddress) {
    let (service, handle) = OverlayService::build(OverlayConfig { listen_port: 0 }).unwrap();
    tokio::spawn(service.run());

    let addrs = handle.wait_for_listen_addrs().await.unwrap();
    let loopback = addrs
        .iter()
        .find(|addr| addr.to_string().starts_with("/ip4/127.0.0.1/"))
        .expect("loopback listen address");
    let address: PeerAddress = format!("{}/p2p/{}", loopback, handle.local_peer_id())
        .parse()
        .unwrap();
    (handle, address)
}

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_stream_carries_bytes_both_ways() {
    init_tracing();

    let (client, _client_addr) = spawn_node().await;
    let (server, server_addr) = spawn_node().await;

    // The server echoes every tunnel stream back to the sender.
    let mut incoming = server.incoming_streams().unwrap();
    tokio::spawn(async move {
        while let Some((_peer, stream)) = incoming.next().await {
            tokio::spawn(async move {
                let (reader, mut writer) = stream.split();
                let _ = futures::io::copy(reader, &mut writer).await;
                let _ = writer.close().await;
            });
        }
    });

    client.connect(&server_addr).await.unwrap();
    let mut stream = client.open_stream(server_addr.peer_id()).await.unwrap();

    stream.write_all(b"across the overlay").await.unwrap();
    stream.close().await.unwrap();

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"across the overlay");
}

#[tokio::test(flavor = "multi_thread")]
async fn rendezvous_query_finds_advertised_peer() {
    init_tracing();

    let (seeker, _) = spawn_node().await;
    let (provider, provider_addr) = spawn_node().await;

    seeker.connect(&provider_addr).await.unwrap();
    provider.advertise().await.unwrap();

    let mut found = false;
    for _ in 0..40 {
        let peers = seeker.find_peers().await.unwrap();
        if peers.contains(&provider_addr.peer_id()) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(found, "provider never surfaced in rendezvous queries");
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_to_unreachable_peer_fails() {
    init_tracing();

    let (node, _) = spawn_node().await;
    // Nothing listens on this port.
    let dead: PeerAddress = format!(
        "/ip4/127.0.0.1/tcp/19999/p2p/{}",
        libp2p::PeerId::random()
    )
    .parse()
    .unwrap();

    let result = node.connect(&dead).await;
    assert!(result.is_err());
}
