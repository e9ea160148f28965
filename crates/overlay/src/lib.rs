//! The libp2p overlay boundary.
//!
//! This crate owns everything libp2p: host construction, the behaviour
//! stack, rendezvous discovery through Kademlia provider records, circuit
//! relay, and the raw stream protocol that carries tunnel bytes. Consumers
//! see the [`Overlay`] trait, [`PeerAddress`], and plain byte streams.

use std::future::Future;

use futures::{AsyncRead, AsyncWrite};
use libp2p::StreamProtocol;

mod address;
mod behaviour;
mod error;
mod service;

pub use address::{AddressError, PeerAddress};
pub use behaviour::{NodeBehaviour, NodeBehaviourEvent};
pub use error::OverlayError;
pub use service::{OverlayConfig, OverlayHandle, OverlayService};

pub use libp2p::{Multiaddr, PeerId};
pub use libp2p_stream::IncomingStreams;

/// Protocol tag distinguishing tunnel streams from other traffic
/// multiplexed over the same connections.
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/stitch/tunnel/1.0.0");

/// Rendezvous tag nodes advertise and search under to find each other
/// without prior knowledge of addresses.
pub const RENDEZVOUS_TAG: &str = "/stitch/rendezvous";

/// Identify protocol version string.
pub const IDENTIFY_PROTOCOL: &str = "/stitch/id/1.0.0";

/// The overlay operations the tunnel coordinator relies on.
///
/// Implemented by [`OverlayHandle`]; the seam exists so coordinator logic
/// can be exercised without a network.
pub trait Overlay: Clone + Send + Sync + 'static {
    /// A protocol-tagged bidirectional byte stream to a peer.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// This node's peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Advertise this node under the rendezvous tag.
    fn advertise(&self) -> impl Future<Output = Result<(), OverlayError>> + Send;

    /// One discovery poll: peers currently advertising the rendezvous tag.
    ///
    /// The local peer may be included; callers filter it out.
    fn find_peers(&self) -> impl Future<Output = Result<Vec<PeerId>, OverlayError>> + Send;

    /// Register a peer's addresses with the address book.
    fn add_address(&self, peer: &PeerAddress);

    /// Register a peer's addresses, then establish a connection to it.
    fn connect(&self, peer: &PeerAddress) -> impl Future<Output = Result<(), OverlayError>> + Send;

    /// Open a new tunnel stream to a connected peer.
    fn open_stream(
        &self,
        peer: PeerId,
    ) -> impl Future<Output = Result<Self::Stream, OverlayError>> + Send;
}
