//! Tunnel orchestration: peer discovery, inbound and outbound tunnel
//! services, and the coordinator loop tying them to the backend process.

mod coordinator;
mod discovery;
mod error;
mod inbound;
mod outbound;

pub use coordinator::Coordinator;
pub use discovery::{
    DISCOVERY_POLL_INTERVAL, DISCOVERY_QUEUE_CAPACITY, PeerDiscovery, peer_queue,
};
pub use error::CoordinatorError;
pub use inbound::{
    BACKEND_DIAL_ATTEMPTS, BACKEND_DIAL_INTERVAL, InboundTunnelHandler, RetryPolicy,
};
pub use outbound::OutboundTunnelService;

/// What this node does for the lifetime of the process.
///
/// Chosen once at startup from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Assist connectivity as a circuit hop; never tunnels.
    Relay,
    /// Tunnel to one explicitly supplied peer.
    Client,
    /// Discover peers under the rendezvous tag and tunnel to each.
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_match_address_files() {
        assert_eq!(Role::Relay.to_string(), "relay");
        assert_eq!(Role::Client.to_string(), "client");
        assert_eq!(Role::Server.to_string(), "server");
    }
}
