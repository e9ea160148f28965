//! Peer addressing.
//!
//! A [`PeerAddress`] is a peer id plus the transport addresses it is
//! reachable at, parsed once from a textual multiaddress ending in
//! `/p2p/<peer-id>`. Discovered peers start out with no transport address
//! at all; the DHT supplies routes for those at dial time.

use std::{fmt, str::FromStr};

use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};

/// Failure to parse a textual peer address.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// Not a valid multiaddress at all.
    #[error("invalid multiaddress: {0}")]
    Multiaddr(#[from] libp2p::multiaddr::Error),
    /// Valid multiaddress, but it does not end in `/p2p/<peer-id>`.
    #[error("peer address `{0}` does not end in /p2p/<peer-id>")]
    MissingPeerId(String),
}

/// A resolvable locator for a peer: its id and zero or more transport
/// addresses (without the trailing `/p2p` component).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    peer_id: PeerId,
    addrs: Vec<Multiaddr>,
}

impl PeerAddress {
    /// Address of a peer known only by id, e.g. one found via discovery.
    pub fn from_peer_id(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
        }
    }

    /// The peer's id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Known transport addresses, most recently added last.
    pub fn addrs(&self) -> &[Multiaddr] {
        &self.addrs
    }

    /// Append a relay-circuit route through `relay`, so the peer stays
    /// reachable when it cannot be dialed directly.
    ///
    /// The route is `<relay>/p2p-circuit`, using the relay's first known
    /// transport address; a relay without one is skipped.
    pub fn push_circuit_via(&mut self, relay: &PeerAddress) {
        let Some(transport) = relay.addrs.first() else {
            return;
        };
        let route = transport
            .clone()
            .with(Protocol::P2p(relay.peer_id))
            .with(Protocol::P2pCircuit);
        self.addrs.push(route);
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr: Multiaddr = s.trim().parse()?;
        match addr.pop() {
            Some(Protocol::P2p(peer_id)) => {
                let addrs = if addr.is_empty() { Vec::new() } else { vec![addr] };
                Ok(Self { peer_id, addrs })
            }
            _ => Err(AddressError::MissingPeerId(s.to_string())),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{}/p2p/{}", addr, self.peer_id),
            None => write!(f, "/p2p/{}", self.peer_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id() -> PeerId {
        PeerId::random()
    }

    #[test]
    fn parses_address_with_peer_id() {
        let id = peer_id();
        let parsed: PeerAddress = format!("/ip4/127.0.0.1/tcp/10500/p2p/{id}")
            .parse()
            .unwrap();
        assert_eq!(parsed.peer_id(), id);
        assert_eq!(
            parsed.addrs(),
            &["/ip4/127.0.0.1/tcp/10500".parse::<Multiaddr>().unwrap()]
        );
    }

    #[test]
    fn rejects_address_without_peer_id() {
        let err = "/ip4/127.0.0.1/tcp/10500".parse::<PeerAddress>().unwrap_err();
        assert!(matches!(err, AddressError::MissingPeerId(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            "not a multiaddr".parse::<PeerAddress>(),
            Err(AddressError::Multiaddr(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        let id = peer_id();
        let text = format!("/ip4/10.0.0.7/tcp/10123/p2p/{id}");
        let parsed: PeerAddress = text.parse().unwrap();
        assert_eq!(parsed.to_string(), text);
        assert_eq!(parsed.to_string().parse::<PeerAddress>().unwrap(), parsed);
    }

    #[test]
    fn circuit_route_goes_through_relay() {
        let relay_id = peer_id();
        let relay: PeerAddress = format!("/ip4/203.0.113.5/tcp/10400/p2p/{relay_id}")
            .parse()
            .unwrap();

        let mut target = PeerAddress::from_peer_id(peer_id());
        target.push_circuit_via(&relay);

        let expected: Multiaddr = format!("/ip4/203.0.113.5/tcp/10400/p2p/{relay_id}/p2p-circuit")
            .parse()
            .unwrap();
        assert_eq!(target.addrs(), &[expected]);
    }

    #[test]
    fn circuit_route_requires_relay_transport_addr() {
        let relay = PeerAddress::from_peer_id(peer_id());
        let mut target = PeerAddress::from_peer_id(peer_id());
        target.push_circuit_via(&relay);
        assert!(target.addrs().is_empty());
    }
}
