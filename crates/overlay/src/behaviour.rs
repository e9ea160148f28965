//! Network behaviour composition for the overlay host.
//!
//! Combines the ambient host protocols (identify, ping), Kademlia for
//! rendezvous discovery, the relay service and client for circuit
//! connectivity, and the raw stream protocol carrying tunnel bytes.

use libp2p::{
    PeerId, identify,
    identity::PublicKey,
    kad::{self, store::MemoryStore},
    ping, relay,
    swarm::NetworkBehaviour,
};

use crate::IDENTIFY_PROTOCOL;

/// Combined behaviour for an overlay node.
///
/// Every node runs the relay service, so any reachable node can serve as a
/// circuit hop for others; dedicated relay nodes simply do nothing else.
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    /// Identify protocol - exchange peer info and listen addresses.
    pub identify: identify::Behaviour,

    /// Keep-alive and liveness checks.
    pub ping: ping::Behaviour,

    /// Kademlia DHT - provider records under the rendezvous tag.
    pub kad: kad::Behaviour<MemoryStore>,

    /// Circuit relay service (hop).
    pub relay: relay::Behaviour,

    /// Circuit relay client (dial and listen through a relay).
    pub relay_client: relay::client::Behaviour,

    /// Raw protocol-tagged streams for tunnels.
    pub stream: libp2p_stream::Behaviour,
}

impl NodeBehaviour {
    /// Create the behaviour for the local node.
    pub fn new(
        local_peer_id: PeerId,
        local_public_key: PublicKey,
        relay_client: relay::client::Behaviour,
    ) -> Self {
        let mut kad = kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
        // Provider records must be served even on nodes that never query.
        kad.set_mode(Some(kad::Mode::Server));

        Self {
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                local_public_key,
            )),
            ping: ping::Behaviour::default(),
            kad,
            relay: relay::Behaviour::new(local_peer_id, relay::Config::default()),
            relay_client,
            stream: libp2p_stream::Behaviour::new(),
        }
    }
}
