//! Waiting for a fatal component failure.

use futures::FutureExt;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::sync::oneshot;

/// Resolves when a node component reports a result the process must act on.
///
/// Components that are fatal when they stop (the discovery loop in auto
/// mode) hold the sender half and report their terminal result through it.
/// While every sender is alive and silent, the future stays pending.
#[derive(Debug)]
pub struct NodeExitFuture {
    exit_rx: Option<oneshot::Receiver<eyre::Result<()>>>,
}

impl NodeExitFuture {
    /// Create a new `NodeExitFuture` from the receiving half of the exit
    /// channel.
    pub const fn new(exit_rx: oneshot::Receiver<eyre::Result<()>>) -> Self {
        Self {
            exit_rx: Some(exit_rx),
        }
    }
}

impl Future for NodeExitFuture {
    type Output = eyre::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.exit_rx.as_mut() {
            Some(rx) => {
                let result = ready!(rx.poll_unpin(cx));
                this.exit_rx.take();
                match result {
                    Ok(res) => Poll::Ready(res),
                    Err(_) => Poll::Ready(Err(eyre::eyre!("exit channel closed unexpectedly"))),
                }
            }
            None => Poll::Pending,
        }
    }
}
