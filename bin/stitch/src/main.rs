//! Stitch node binary.

mod cli;
mod exit;
mod logging;

use std::fs;

use clap::Parser;
use eyre::eyre;
use stitch_backend::BackendLauncher;
use stitch_coordinator::{
    Coordinator, InboundTunnelHandler, PeerDiscovery, Role, peer_queue,
};
use stitch_net_ports::{
    INBOUND_BACKEND_RANGE, OUTBOUND_LISTEN_RANGE, OVERLAY_LISTEN_RANGE, PortAllocator,
};
use stitch_overlay::{Overlay, OverlayConfig, OverlayService, PeerAddress};
use stitch_tasks::TaskManager;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::{cli::Cli, exit::NodeExitFuture};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.logs)?;

    let role = cli.node.role();
    info!(%role, "starting stitch node");

    let mut task_manager = TaskManager::current();
    let executor = task_manager.executor();

    // Overlay host on a random port from the transport range.
    let listen_port = PortAllocator::new(OVERLAY_LISTEN_RANGE).pick();
    let (service, overlay) = OverlayService::build(OverlayConfig { listen_port })?;
    executor.spawn_critical("overlay service", service.run());

    // Print every reachable address; the last one is what gets persisted.
    let listen_addrs = overlay.wait_for_listen_addrs().await?;
    let mut node_addr = String::new();
    for addr in &listen_addrs {
        node_addr = format!("{addr}/p2p/{}", overlay.local_peer_id());
        println!("{node_addr}");
    }

    // Bootstrap through the configured relay and advertise the circuit
    // route, so NAT-hidden nodes stay reachable.
    if let Some(relay) = &cli.node.relay {
        info!(%relay, "connecting to relay");
        overlay.add_address(relay);
        match overlay.connect(relay).await {
            Ok(()) => {
                if let Err(error) = overlay.listen_via_relay(relay).await {
                    warn!(%error, "failed to listen through relay");
                }
                let mut own = PeerAddress::from_peer_id(overlay.local_peer_id());
                own.push_circuit_via(relay);
                if !own.addrs().is_empty() {
                    node_addr = own.to_string();
                    println!("{node_addr}");
                }
            }
            Err(error) => warn!(%error, "failed to connect to relay"),
        }
    }

    // Persist our address for out-of-band sharing with other nodes.
    fs::create_dir_all(&cli.node.datadir)?;
    let addr_file = cli.node.datadir.join(format!("{role}.p2p"));
    fs::write(&addr_file, &node_addr)?;
    info!(path = %addr_file.display(), "wrote node address");

    if role == Role::Relay {
        info!("running as relay");
        tokio::select! {
            error = &mut task_manager => return Err(eyre!(error)),
            _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
        }
        return Ok(());
    }

    let launcher = BackendLauncher::new(&cli.node.backend);

    // Serve inbound tunnels for the lifetime of the node.
    let incoming = overlay.incoming_streams()?;
    let inbound = InboundTunnelHandler::new(
        incoming,
        launcher.clone(),
        PortAllocator::new(INBOUND_BACKEND_RANGE),
        executor.clone(),
    );
    executor.spawn(inbound.run());

    // Fatal component failures (discovery, in auto mode) land here.
    let (exit_tx, exit_rx) = oneshot::channel();
    let mut exit_tx = Some(exit_tx);

    let peers = match &cli.node.remote_peer {
        Some(peer) => {
            // Client role: a single-element peer source.
            let (tx, rx) = peer_queue();
            tx.send(peer.clone()).await?;
            rx
        }
        None => {
            // Auto role: discovery feeds the queue for the process lifetime.
            let (tx, rx) = peer_queue();
            let discovery = PeerDiscovery::new(overlay.clone(), tx);
            if let Some(exit_tx) = exit_tx.take() {
                executor.spawn(async move {
                    if let Err(error) = discovery.run().await {
                        let _ = exit_tx.send(Err(eyre!(error)));
                    }
                });
            }
            rx
        }
    };

    let coordinator = Coordinator::new(
        overlay.clone(),
        executor.clone(),
        launcher,
        PortAllocator::new(OUTBOUND_LISTEN_RANGE),
        cli.node.relay.clone(),
        peers,
    );
    let node_exit = NodeExitFuture::new(exit_rx);

    tokio::select! {
        result = coordinator.run() => result?,
        result = node_exit => result?,
        error = &mut task_manager => return Err(eyre!(error)),
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
    }

    Ok(())
}
