//! Overlay error types.

use libp2p::PeerId;

/// Errors surfaced by overlay operations.
///
/// Peer-scoped failures (dial, stream open) carry the peer so callers can
/// log and skip; [`OverlayError::ServiceStopped`] means the overlay event
/// loop itself is gone, which no caller can recover from.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The overlay service event loop has stopped.
    #[error("overlay service stopped")]
    ServiceStopped,

    /// Dialing a peer failed.
    #[error("failed to connect to {peer}: {message}")]
    Dial {
        /// The peer that could not be reached.
        peer: PeerId,
        /// Stringified dial error.
        message: String,
    },

    /// Opening a protocol-tagged stream failed.
    #[error("failed to open tunnel stream to {peer}: {message}")]
    OpenStream {
        /// The peer the stream was intended for.
        peer: PeerId,
        /// Stringified stream error.
        message: String,
    },

    /// Publishing the rendezvous advertisement failed.
    #[error("failed to advertise under rendezvous tag: {0}")]
    Advertise(String),

    /// A listen request was rejected by the transport.
    #[error("failed to listen: {0}")]
    Listen(String),

    /// No listen address was established within the startup grace period.
    #[error("no listen address established")]
    NoListenAddr,

    /// The tunnel stream handler is already registered.
    #[error("tunnel stream handler already registered")]
    HandlerRegistered,
}
