//! Inbound tunnel handling.
//!
//! A remote peer opened a tunnel stream to us: launch a backend for it on a
//! fresh port, dial that port until the backend is up, and bridge. The
//! backend opens the listening socket itself, so the dial is retried to
//! cover its startup latency; once the budget is spent the stream is closed
//! and the attempt is abandoned for good.

use std::time::Duration;

use futures::{AsyncRead, AsyncWrite, Stream, StreamExt};
use stitch_backend::{BackendEvent, BackendLauncher};
use stitch_net_ports::PortAllocator;
use stitch_net_tunnel::Tunnel;
use stitch_overlay::PeerId;
use stitch_tasks::TaskExecutor;
use tokio::net::TcpStream;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, error, info, warn};

use crate::CoordinatorError;

/// How many times the local backend is dialed before giving up.
pub const BACKEND_DIAL_ATTEMPTS: u32 = 60;

/// Spacing between backend dial attempts.
pub const BACKEND_DIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Retry budget for dialing the freshly launched backend.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum dial attempts.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: BACKEND_DIAL_ATTEMPTS,
            interval: BACKEND_DIAL_INTERVAL,
        }
    }
}

/// Serves inbound tunnel streams for the lifetime of the node.
#[derive(Debug)]
pub struct InboundTunnelHandler<I> {
    incoming: I,
    launcher: BackendLauncher,
    ports: PortAllocator,
    retry: RetryPolicy,
    executor: TaskExecutor,
}

impl<I> InboundTunnelHandler<I> {
    /// Create a handler over the overlay's incoming tunnel streams.
    pub fn new(
        incoming: I,
        launcher: BackendLauncher,
        ports: PortAllocator,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            incoming,
            launcher,
            ports,
            retry: RetryPolicy::default(),
            executor,
        }
    }

    /// Override the backend dial retry budget.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Serve incoming streams until the source closes.
    ///
    /// Every stream is handled on its own task; a stuck backend never blocks
    /// acceptance of further tunnels.
    pub async fn run<S>(mut self)
    where
        I: Stream<Item = (PeerId, S)> + Send + Unpin + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        while let Some((peer, stream)) = self.incoming.next().await {
            info!(%peer, "forwarding remote tunnel to local backend");
            let launcher = self.launcher.clone();
            let ports = self.ports.clone();
            let retry = self.retry;
            let executor = self.executor.clone();
            self.executor.spawn(async move {
                serve_stream(executor, launcher, ports, retry, stream).await;
            });
        }
        debug!("incoming tunnel stream source closed");
    }
}

/// Launch a backend and bridge one inbound stream to it.
///
/// Dropping `stream` on any failure path closes the inbound side, telling
/// the remote peer the tunnel is dead.
async fn serve_stream<S>(
    executor: TaskExecutor,
    launcher: BackendLauncher,
    ports: PortAllocator,
    retry: RetryPolicy,
    stream: S,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let port = match ports.pick_free() {
        Ok(port) => port,
        Err(error) => {
            error!(%error, "abandoning inbound tunnel");
            return;
        }
    };

    launcher.spawn(&executor, BackendEvent::IncomingConnection, port);

    match dial_backend(port, retry).await {
        Ok(conn) => {
            Tunnel::bridge(&executor, stream.compat(), conn);
        }
        Err(error) => {
            error!(%error, "abandoning inbound tunnel");
        }
    }
}

/// Dial the backend's loopback port, retrying while it starts up.
pub(crate) async fn dial_backend(
    port: u16,
    retry: RetryPolicy,
) -> Result<TcpStream, CoordinatorError> {
    for attempt in 1..=retry.attempts {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(conn) => {
                debug!(port, attempt, "local backend dialable");
                return Ok(conn);
            }
            Err(error) => {
                warn!(port, attempt, %error, "local backend not ready, retrying");
                tokio::time::sleep(retry.interval).await;
            }
        }
    }
    Err(CoordinatorError::BackendUnreachable {
        port,
        attempts: retry.attempts,
    })
}
