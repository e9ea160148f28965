//! The tunnel: one overlay stream paired with one TCP connection, bridged by
//! two byte forwarders.
//!
//! Each forwarder copies one direction until its source reaches end-of-stream
//! or errors, then shuts down the destination's write side so the far end sees
//! end-of-stream too. The two directions are independent tasks; a tunnel has
//! no identity beyond the pair and is gone once both finish.

use stitch_tasks::TaskExecutor;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Copy bytes from `src` to `dst` until end-of-stream or an I/O error, then
/// shut down `dst`'s write side.
///
/// An error ends this direction only; it is reported as a warning, never
/// propagated. Returns the number of bytes forwarded.
pub async fn forward<R, W>(mut src: R, mut dst: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(&mut src, &mut dst).await {
        Ok(bytes) => {
            debug!(direction, bytes, "forwarding finished");
            bytes
        }
        Err(error) => {
            warn!(direction, %error, "forwarding failed");
            0
        }
    };
    if let Err(error) = dst.shutdown().await {
        debug!(direction, %error, "failed to shut down destination");
    }
    copied
}

/// A bridged pair of endpoints.
///
/// Owns the two forwarder task handles so a supervisor can observe or await
/// the tunnel; dropping the handle detaches the tasks, which still terminate
/// on their own once either endpoint closes.
#[derive(Debug)]
pub struct Tunnel {
    remote_to_local: JoinHandle<u64>,
    local_to_remote: JoinHandle<u64>,
}

impl Tunnel {
    /// Bridge `remote` (the overlay stream) and `local` (the TCP connection),
    /// spawning one forwarder task per direction.
    pub fn bridge<R, L>(executor: &TaskExecutor, remote: R, local: L) -> Self
    where
        R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (remote_rd, remote_wr) = tokio::io::split(remote);
        let (local_rd, local_wr) = tokio::io::split(local);
        Self {
            remote_to_local: executor.spawn(forward(remote_rd, local_wr, "remote->local")),
            local_to_remote: executor.spawn(forward(local_rd, remote_wr, "local->remote")),
        }
    }

    /// Wait for both directions to finish.
    ///
    /// Returns the byte counts as `(remote_to_local, local_to_remote)`.
    pub async fn join(self) -> (u64, u64) {
        let remote_to_local = self.remote_to_local.await.unwrap_or_default();
        let local_to_remote = self.local_to_remote.await.unwrap_or_default();
        (remote_to_local, local_to_remote)
    }

    /// Whether both directions have finished.
    pub fn is_finished(&self) -> bool {
        self.remote_to_local.is_finished() && self.local_to_remote.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stitch_tasks::TaskManager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn bytes_cross_in_both_directions_unchanged() {
        let manager = TaskManager::current();
        let executor = manager.executor();

        let (remote, remote_far) = duplex(64);
        let (local, local_far) = duplex(64);
        let tunnel = Tunnel::bridge(&executor, remote, local);

        let (mut remote_far_rd, mut remote_far_wr) = tokio::io::split(remote_far);
        let (mut local_far_rd, mut local_far_wr) = tokio::io::split(local_far);

        remote_far_wr.write_all(b"ping from remote").await.unwrap();
        remote_far_wr.shutdown().await.unwrap();
        local_far_wr.write_all(b"pong from local").await.unwrap();
        local_far_wr.shutdown().await.unwrap();

        let mut at_local = Vec::new();
        local_far_rd.read_to_end(&mut at_local).await.unwrap();
        assert_eq!(at_local, b"ping from remote");

        let mut at_remote = Vec::new();
        remote_far_rd.read_to_end(&mut at_remote).await.unwrap();
        assert_eq!(at_remote, b"pong from local");

        let (remote_to_local, local_to_remote) = tunnel.join().await;
        assert_eq!(remote_to_local, 16);
        assert_eq!(local_to_remote, 15);
    }

    #[tokio::test]
    async fn closing_one_endpoint_terminates_both_directions() {
        let manager = TaskManager::current();
        let executor = manager.executor();

        let (remote, remote_far) = duplex(64);
        let (local, local_far) = duplex(64);
        let tunnel = Tunnel::bridge(&executor, remote, local);

        // Closing the remote's far end propagates end-of-stream through the
        // tunnel and back out the other side.
        drop(remote_far);

        let (mut local_far_rd, mut local_far_wr) = tokio::io::split(local_far);
        let mut rest = Vec::new();
        local_far_rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        local_far_wr.shutdown().await.unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(1), tunnel.join()).await;
        assert!(joined.is_ok(), "forwarder tasks must terminate");
    }

    #[tokio::test]
    async fn large_transfer_preserves_order() {
        let manager = TaskManager::current();
        let executor = manager.executor();

        let (remote, remote_far) = duplex(1024);
        let (local, local_far) = duplex(1024);
        let tunnel = Tunnel::bridge(&executor, remote, local);

        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (_, mut remote_far_wr) = tokio::io::split(remote_far);
        let writer = tokio::spawn(async move {
            remote_far_wr.write_all(&payload).await.unwrap();
            remote_far_wr.shutdown().await.unwrap();
        });

        let (mut local_far_rd, _local_far_wr) = tokio::io::split(local_far);
        let mut received = Vec::new();
        local_far_rd.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        drop(tunnel);
    }
}
