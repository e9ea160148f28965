//! Peer discovery loop.
//!
//! Advertises this node under the rendezvous tag once, then polls the
//! overlay for fellow advertisers on a fixed interval, pushing every peer
//! except ourselves onto the bounded peer queue. The coordinator consumes
//! the queue; duplicates across polling cycles are its problem to tolerate,
//! not ours to dedupe.

use std::time::Duration;

use stitch_overlay::{Overlay, PeerAddress};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::CoordinatorError;

/// How often the overlay is polled for rendezvous peers.
pub const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the discovered-peer queue.
///
/// Polling backpressures once the coordinator falls this far behind.
pub const DISCOVERY_QUEUE_CAPACITY: usize = 100;

/// Create the discovered-peer queue.
pub fn peer_queue() -> (mpsc::Sender<PeerAddress>, mpsc::Receiver<PeerAddress>) {
    mpsc::channel(DISCOVERY_QUEUE_CAPACITY)
}

/// The discovery loop, producing [`PeerAddress`]es for the coordinator.
#[derive(Debug)]
pub struct PeerDiscovery<O> {
    overlay: O,
    queue: mpsc::Sender<PeerAddress>,
    poll_interval: Duration,
}

impl<O: Overlay> PeerDiscovery<O> {
    /// Create a discovery loop feeding `queue`.
    pub fn new(overlay: O, queue: mpsc::Sender<PeerAddress>) -> Self {
        Self {
            overlay,
            queue,
            poll_interval: DISCOVERY_POLL_INTERVAL,
        }
    }

    /// Override the polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until the overlay fails or the queue consumer goes away.
    ///
    /// An overlay error here means discovery is broken, which is fatal for a
    /// node that depends on it; the caller routes the error accordingly.
    pub async fn run(self) -> Result<(), CoordinatorError> {
        self.overlay.advertise().await?;
        info!("advertised under rendezvous tag");

        let local = self.overlay.local_peer_id();
        loop {
            for peer in self.overlay.find_peers().await? {
                if peer == local {
                    continue;
                }
                debug!(%peer, "discovered peer");
                if self.queue.send(PeerAddress::from_peer_id(peer)).await.is_err() {
                    debug!("peer queue consumer gone, stopping discovery");
                    return Ok(());
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
