//! The main control loop.
//!
//! Consumes the discovered-peer queue: per peer, augment its address with a
//! relay circuit when one is configured, connect, stand up an outbound
//! tunnel service on a fresh port, and run the outgoing backend against that
//! port. Every failure in here is peer-scoped: log, skip, take the next
//! peer.

use stitch_backend::{BackendEvent, BackendLauncher};
use stitch_net_ports::PortAllocator;
use stitch_overlay::{Overlay, PeerAddress};
use stitch_tasks::TaskExecutor;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{CoordinatorError, OutboundTunnelService};

/// Drives one outbound tunnel service and one backend invocation per peer.
#[derive(Debug)]
pub struct Coordinator<O> {
    overlay: O,
    executor: TaskExecutor,
    launcher: BackendLauncher,
    ports: PortAllocator,
    relay: Option<PeerAddress>,
    peers: mpsc::Receiver<PeerAddress>,
}

impl<O: Overlay> Coordinator<O> {
    /// Create a coordinator consuming `peers`.
    ///
    /// `relay` is the configured bootstrap relay, if any; discovered peers
    /// get a circuit route through it appended before dialing.
    pub fn new(
        overlay: O,
        executor: TaskExecutor,
        launcher: BackendLauncher,
        ports: PortAllocator,
        relay: Option<PeerAddress>,
        peers: mpsc::Receiver<PeerAddress>,
    ) -> Self {
        Self {
            overlay,
            executor,
            launcher,
            ports,
            relay,
            peers,
        }
    }

    /// Process peers until the source is exhausted.
    ///
    /// The discovery-driven source never ends; a client's single-peer source
    /// ends once that peer's outgoing backend has finished, and so does this
    /// loop.
    pub async fn run(mut self) -> Result<(), CoordinatorError> {
        while let Some(mut peer) = self.peers.recv().await {
            info!(%peer, "peer found");

            if let Some(relay) = &self.relay {
                peer.push_circuit_via(relay);
            }

            if let Err(error) = self.overlay.connect(&peer).await {
                warn!(peer = %peer.peer_id(), %error, "failed to connect, skipping");
                continue;
            }

            let port = self.ports.pick();
            let service = match OutboundTunnelService::bind(
                self.overlay.clone(),
                self.executor.clone(),
                peer.peer_id(),
                port,
            )
            .await
            {
                Ok(service) => service,
                Err(error) => {
                    warn!(peer = %peer.peer_id(), %error, "failed to bind tunnel listener, skipping");
                    continue;
                }
            };
            service.spawn();

            // The outgoing backend is the one that connects to the listener
            // above, so it only starts once the listener is up.
            if let Err(error) = self.launcher.run(BackendEvent::OutgoingConnection, port).await {
                warn!(peer = %peer.peer_id(), %error, "outgoing backend failed");
            }
        }
        debug!("peer source exhausted, coordinator finished");
        Ok(())
    }
}
