//! The overlay service: owns the libp2p swarm and drives all network
//! activity.
//!
//! [`OverlayService::build`] constructs the host; [`OverlayService::run`] is
//! the event loop, selecting over swarm events and commands sent from
//! [`OverlayHandle`] clones. Stream opening bypasses the command channel and
//! goes through [`libp2p_stream::Control`] directly, which is safe to drive
//! from any task as long as the swarm keeps being polled.

use std::{
    collections::HashMap,
    time::Duration,
};

use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, Swarm, SwarmBuilder, identify, kad,
    multiaddr::Protocol,
    noise, relay,
    swarm::{DialError, SwarmEvent, dial_opts::DialOpts},
    tcp, yamux,
};
use libp2p_stream::IncomingStreams;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::{
    Overlay, OverlayError, PeerAddress, RENDEZVOUS_TAG, TUNNEL_PROTOCOL,
    behaviour::{NodeBehaviour, NodeBehaviourEvent},
};

/// How long a connection without active streams is kept open.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Polling interval while waiting for the first listen address.
const LISTEN_ADDR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How many times to poll for a listen address before giving up.
const LISTEN_ADDR_POLL_ATTEMPTS: u32 = 50;

/// Overlay host configuration.
#[derive(Debug, Clone, Default)]
pub struct OverlayConfig {
    /// TCP port the transport listens on; 0 for an ephemeral port.
    pub listen_port: u16,
}

/// Commands sent from handles to the service loop.
enum Command {
    LocalAddresses {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    AddAddress {
        peer: PeerAddress,
    },
    Connect {
        peer: PeerAddress,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    Advertise {
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    FindPeers {
        reply: oneshot::Sender<Result<Vec<PeerId>, OverlayError>>,
    },
    ListenCircuit {
        relay: PeerAddress,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
}

/// A provider query in flight, accumulating results until the final step.
struct ProviderQuery {
    providers: Vec<PeerId>,
    reply: oneshot::Sender<Result<Vec<PeerId>, OverlayError>>,
}

/// Handle for interacting with a running [`OverlayService`].
#[derive(Clone)]
pub struct OverlayHandle {
    local_peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<Command>,
    control: libp2p_stream::Control,
}

impl std::fmt::Debug for OverlayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayHandle")
            .field("local_peer_id", &self.local_peer_id)
            .finish_non_exhaustive()
    }
}

impl OverlayHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OverlayError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .map_err(|_| OverlayError::ServiceStopped)?;
        rx.await.map_err(|_| OverlayError::ServiceStopped)
    }

    /// Addresses the transport is currently listening on.
    pub async fn local_addresses(&self) -> Result<Vec<Multiaddr>, OverlayError> {
        self.request(|reply| Command::LocalAddresses { reply }).await
    }

    /// Wait until the transport has established at least one listen address.
    pub async fn wait_for_listen_addrs(&self) -> Result<Vec<Multiaddr>, OverlayError> {
        for _ in 0..LISTEN_ADDR_POLL_ATTEMPTS {
            let addrs = self.local_addresses().await?;
            if !addrs.is_empty() {
                return Ok(addrs);
            }
            tokio::time::sleep(LISTEN_ADDR_POLL_INTERVAL).await;
        }
        Err(OverlayError::NoListenAddr)
    }

    /// Start listening for inbound circuit connections through `relay`.
    ///
    /// Requires an established connection to the relay.
    pub async fn listen_via_relay(&self, relay: &PeerAddress) -> Result<(), OverlayError> {
        let relay = relay.clone();
        self.request(|reply| Command::ListenCircuit { relay, reply })
            .await?
    }

    /// The incoming protocol-tagged tunnel streams.
    ///
    /// May be obtained once per node; relay-only nodes never call this, so
    /// they never accept tunnel streams.
    pub fn incoming_streams(&self) -> Result<IncomingStreams, OverlayError> {
        self.control
            .clone()
            .accept(TUNNEL_PROTOCOL)
            .map_err(|_| OverlayError::HandlerRegistered)
    }
}

impl Overlay for OverlayHandle {
    type Stream = libp2p::Stream;

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn advertise(&self) -> Result<(), OverlayError> {
        self.request(|reply| Command::Advertise { reply }).await?
    }

    async fn find_peers(&self) -> Result<Vec<PeerId>, OverlayError> {
        self.request(|reply| Command::FindPeers { reply }).await?
    }

    fn add_address(&self, peer: &PeerAddress) {
        let _ = self.command_tx.send(Command::AddAddress { peer: peer.clone() });
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), OverlayError> {
        let peer = peer.clone();
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    async fn open_stream(&self, peer: PeerId) -> Result<Self::Stream, OverlayError> {
        self.control
            .clone()
            .open_stream(peer, TUNNEL_PROTOCOL)
            .await
            .map_err(|error| OverlayError::OpenStream {
                peer,
                message: error.to_string(),
            })
    }
}

/// The overlay host service.
///
/// Owns the swarm; must be spawned (via [`OverlayService::run`]) before any
/// handle operation can complete.
pub struct OverlayService {
    swarm: Swarm<NodeBehaviour>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), OverlayError>>>>,
    provider_queries: HashMap<kad::QueryId, ProviderQuery>,
}

impl OverlayService {
    /// Build the overlay host and start listening.
    pub fn build(config: OverlayConfig) -> eyre::Result<(Self, OverlayHandle)> {
        let mut swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_dns()?
            .with_relay_client(noise::Config::new, yamux::Config::default)?
            .with_behaviour(|keypair, relay_client| {
                NodeBehaviour::new(
                    keypair.public().to_peer_id(),
                    keypair.public(),
                    relay_client,
                )
            })?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let local_peer_id = *swarm.local_peer_id();
        info!(%local_peer_id, "local peer id");

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port).parse()?;
        swarm.listen_on(listen_addr)?;

        let control = swarm.behaviour().stream.new_control();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = OverlayHandle {
            local_peer_id,
            command_tx,
            control,
        };
        let service = Self {
            swarm,
            command_rx,
            pending_dials: HashMap::new(),
            provider_queries: HashMap::new(),
        };
        Ok((service, handle))
    }

    /// Run the network event loop until every handle is dropped.
    pub async fn run(mut self) {
        info!("starting overlay event loop");
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("all overlay handles dropped, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LocalAddresses { reply } => {
                let addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
                let _ = reply.send(addrs);
            }
            Command::AddAddress { peer } => {
                self.register_addresses(&peer);
            }
            Command::Connect { peer, reply } => {
                self.connect(peer, reply);
            }
            Command::Advertise { reply } => {
                let key = kad::RecordKey::new(&RENDEZVOUS_TAG);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(key)
                    .map(|query_id| {
                        debug!(?query_id, "publishing rendezvous advertisement");
                    })
                    .map_err(|error| OverlayError::Advertise(error.to_string()));
                let _ = reply.send(result);
            }
            Command::FindPeers { reply } => {
                let key = kad::RecordKey::new(&RENDEZVOUS_TAG);
                let query_id = self.swarm.behaviour_mut().kad.get_providers(key);
                self.provider_queries.insert(
                    query_id,
                    ProviderQuery {
                        providers: Vec::new(),
                        reply,
                    },
                );
            }
            Command::ListenCircuit { relay, reply } => {
                let Some(transport) = relay.addrs().first() else {
                    let _ = reply.send(Err(OverlayError::Listen(
                        "relay address has no transport component".to_string(),
                    )));
                    return;
                };
                let circuit = transport
                    .clone()
                    .with(Protocol::P2p(relay.peer_id()))
                    .with(Protocol::P2pCircuit);
                let result = self
                    .swarm
                    .listen_on(circuit.clone())
                    .map(|_| info!(%circuit, "requested circuit reservation"))
                    .map_err(|error| OverlayError::Listen(error.to_string()));
                let _ = reply.send(result);
            }
        }
    }

    /// Register a peer's addresses, then dial it.
    ///
    /// Registration happens before the dial so the address book and routing
    /// table know the peer by the time the connection attempt resolves.
    fn connect(&mut self, peer: PeerAddress, reply: oneshot::Sender<Result<(), OverlayError>>) {
        let peer_id = peer.peer_id();
        self.register_addresses(&peer);

        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        let opts = DialOpts::peer_id(peer_id)
            .addresses(peer.addrs().to_vec())
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.entry(peer_id).or_default().push(reply);
            }
            Err(DialError::DialPeerConditionFalse(_)) => {
                // A dial is already in flight; piggyback on its outcome.
                self.pending_dials.entry(peer_id).or_default().push(reply);
            }
            Err(error) => {
                let _ = reply.send(Err(OverlayError::Dial {
                    peer: peer_id,
                    message: error.to_string(),
                }));
            }
        }
    }

    fn register_addresses(&mut self, peer: &PeerAddress) {
        let peer_id = peer.peer_id();
        for addr in peer.addrs() {
            self.swarm.add_peer_address(peer_id, addr.clone());
            self.swarm
                .behaviour_mut()
                .kad
                .add_address(&peer_id, addr.clone());
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "new listen address");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                debug!(
                    %peer_id,
                    endpoint = %endpoint.get_remote_address(),
                    num_established,
                    "connection established"
                );
                if let Some(replies) = self.pending_dials.remove(&peer_id) {
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    warn!(%peer_id, %error, "outgoing connection error");
                    if let Some(replies) = self.pending_dials.remove(&peer_id) {
                        let message = error.to_string();
                        for reply in replies {
                            let _ = reply.send(Err(OverlayError::Dial {
                                peer: peer_id,
                                message: message.clone(),
                            }));
                        }
                    }
                } else {
                    warn!(%error, "outgoing connection error (unknown peer)");
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(%peer_id, num_established, cause = ?cause, "connection closed");
            }
            SwarmEvent::IncomingConnection {
                local_addr,
                send_back_addr,
                ..
            } => {
                trace!(%local_addr, %send_back_addr, "incoming connection");
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(
                    %peer_id,
                    agent_version = %info.agent_version,
                    "received identify info"
                );
                // Feed the routing table so rendezvous queries can reach the
                // peer's neighbourhood.
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            NodeBehaviourEvent::Identify(identify::Event::Error { peer_id, error, .. }) => {
                debug!(%peer_id, %error, "identify error");
            }
            NodeBehaviourEvent::Identify(_) => {}
            NodeBehaviourEvent::Ping(_) => {}
            NodeBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            }) => {
                self.handle_query_progress(id, result, step.last);
            }
            NodeBehaviourEvent::Kad(_) => {}
            NodeBehaviourEvent::Relay(event) => {
                debug!(?event, "relay service event");
            }
            NodeBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                ..
            }) => {
                info!(%relay_peer_id, "circuit reservation accepted");
            }
            NodeBehaviourEvent::RelayClient(event) => {
                debug!(?event, "relay client event");
            }
            NodeBehaviourEvent::Stream(()) => {}
        }
    }

    fn handle_query_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::GetProviders(result) => {
                if let Some(query) = self.provider_queries.get_mut(&id) {
                    match result {
                        Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                            query.providers.extend(providers);
                        }
                        Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        // An exhausted or timed-out query is a normal empty
                        // cycle, not a discovery failure.
                        Err(error) => {
                            debug!(%error, "provider query ended early");
                        }
                    }
                }
                if last {
                    if let Some(query) = self.provider_queries.remove(&id) {
                        let mut providers = query.providers;
                        providers.sort_unstable();
                        providers.dedup();
                        trace!(count = providers.len(), "provider query finished");
                        let _ = query.reply.send(Ok(providers));
                    }
                }
            }
            kad::QueryResult::StartProviding(Ok(kad::AddProviderOk { .. })) => {
                debug!("rendezvous advertisement published");
            }
            kad::QueryResult::StartProviding(Err(error)) => {
                warn!(%error, "rendezvous advertisement not fully published");
            }
            _ => {}
        }
    }
}
