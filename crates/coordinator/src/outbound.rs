//! Outbound tunnel service.
//!
//! One listener per selected remote peer. Every local connection accepted on
//! it gets its own protocol-tagged stream to that peer and a tunnel bridging
//! the two; a failed stream open drops that one connection and the listener
//! keeps accepting.

use stitch_net_tunnel::Tunnel;
use stitch_overlay::{Overlay, PeerId};
use stitch_tasks::TaskExecutor;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, error, info, warn};

use crate::CoordinatorError;

/// Accepts local connections destined for one remote peer.
#[derive(Debug)]
pub struct OutboundTunnelService<O> {
    overlay: O,
    peer: PeerId,
    listener: TcpListener,
    executor: TaskExecutor,
}

impl<O: Overlay> OutboundTunnelService<O> {
    /// Bind the listener for `peer` on the given loopback port.
    ///
    /// A bind failure is fatal for this peer attempt only; the caller picks
    /// a fresh port on its next attempt.
    pub async fn bind(
        overlay: O,
        executor: TaskExecutor,
        peer: PeerId,
        port: u16,
    ) -> Result<Self, CoordinatorError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| CoordinatorError::Bind { port, source })?;
        info!(%peer, port, "listening for local connections");
        Ok(Self {
            overlay,
            peer,
            listener,
            executor,
        })
    }

    /// Run the accept loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        let executor = self.executor.clone();
        executor.spawn(self.run())
    }

    async fn run(self) {
        loop {
            let (conn, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(peer = %self.peer, %error, "accept failed, stopping tunnel listener");
                    break;
                }
            };
            debug!(peer = %self.peer, %remote, "forwarding local connection to remote peer");

            let overlay = self.overlay.clone();
            let executor = self.executor.clone();
            let peer = self.peer;
            self.executor.spawn(async move {
                match overlay.open_stream(peer).await {
                    Ok(stream) => {
                        Tunnel::bridge(&executor, stream.compat(), conn);
                    }
                    Err(error) => {
                        warn!(%peer, %error, "failed to open tunnel stream, dropping connection");
                    }
                }
            });
        }
    }
}
