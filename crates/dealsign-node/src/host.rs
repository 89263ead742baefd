//! libp2p implementation of [`Transport`].
//!
//! The swarm is owned by a driver task; `Libp2pHost` handles talk to it over
//! a command channel. Streams are opened and accepted through
//! `libp2p-stream`, which works on relayed connections like any other.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::transport::ListenerId,
    identify, identity, noise, ping, relay,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        DialError, NetworkBehaviour, SwarmEvent,
    },
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dealsign_protocol::RELAY_ATTEMPT_TIMEOUT;

use crate::{
    relay::RelayDescriptor,
    transport::{Connectedness, IncomingStreams, Reservation, Transport, TransportError},
};

/// libp2p identify protocol string.
const IDENTIFY_PROTOCOL: &str = "/dealsign/id/1.0.0";

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

const COMMAND_BUFFER: usize = 64;

// ============================================================================
// Combined behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
pub struct SignerBehaviour {
    /// Relay client: reservations on relays and dialing through circuits.
    pub relay_client: relay::client::Behaviour,
    pub identify:     identify::Behaviour,
    pub ping:         ping::Behaviour,
    /// Raw protocol streams for the signing exchange.
    pub stream:       libp2p_stream::Behaviour,
}

/// Build the libp2p swarm.
///
/// The node never listens on a direct address: it is reachable only through
/// the relay circuits it holds reservations on.
pub fn build_swarm(keypair: identity::Keypair) -> anyhow::Result<Swarm<SignerBehaviour>> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_quic()
        .with_dns()?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| SignerBehaviour {
            relay_client,
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            )),
            ping: ping::Behaviour::default(),
            stream: libp2p_stream::Behaviour::new(),
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();
    Ok(swarm)
}

// ============================================================================
// Host handle
// ============================================================================

enum Command {
    IsConnected {
        peer:  PeerId,
        reply: oneshot::Sender<bool>,
    },
    /// Dial `peer`; empty `addrs` means "use the address book".
    Dial {
        peer:  PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Reserve {
        relay: RelayDescriptor,
        reply: oneshot::Sender<Result<Reservation, TransportError>>,
    },
    AddAddresses {
        peer:  PeerId,
        addrs: Vec<Multiaddr>,
    },
}

/// Cloneable handle to a running libp2p swarm.
#[derive(Clone)]
pub struct Libp2pHost {
    local_peer_id: PeerId,
    commands:      mpsc::Sender<Command>,
    control:       libp2p_stream::Control,
}

impl Libp2pHost {
    /// Build the swarm and spawn its driver task.
    ///
    /// The driver stops when `shutdown` fires or every handle is dropped.
    pub fn spawn(keypair: identity::Keypair, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let swarm = build_swarm(keypair)?;
        let local_peer_id = *swarm.local_peer_id();
        let control = swarm.behaviour().stream.new_control();
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);

        tokio::spawn(Driver::new(swarm, rx).run(shutdown));
        tracing::info!(peer_id = %local_peer_id, "network host started");

        Ok(Self { local_peer_id, commands, control })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TransportError::HostShutdown)?;
        rx.await.map_err(|_| TransportError::HostShutdown)
    }
}

#[async_trait]
impl Transport for Libp2pHost {
    type Stream = libp2p::Stream;

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn connectedness(&self, peer: PeerId) -> Connectedness {
        match self.request(|reply| Command::IsConnected { peer, reply }).await {
            Ok(true) => Connectedness::Connected,
            _ => Connectedness::NotConnected,
        }
    }

    async fn connect(&self, relay: &RelayDescriptor) -> Result<(), TransportError> {
        let addrs = relay.addresses.clone();
        self.request(|reply| Command::Dial { peer: relay.id, addrs, reply })
            .await?
    }

    async fn reserve(&self, relay: &RelayDescriptor) -> Result<Reservation, TransportError> {
        let relay = relay.clone();
        self.request(|reply| Command::Reserve { relay, reply }).await?
    }

    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        if self.commands.send(Command::AddAddresses { peer, addrs }).await.is_err() {
            tracing::debug!(%peer, "address book update dropped: host shut down");
        }
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, TransportError> {
        if self.connectedness(peer).await == Connectedness::NotConnected {
            self.request(|reply| Command::Dial { peer, addrs: Vec::new(), reply })
                .await??;
        }
        self.control
            .clone()
            .open_stream(peer, protocol)
            .await
            .map_err(|e| TransportError::OpenStream { peer, reason: e.to_string() })
    }

    fn accept(
        &self,
        protocol: StreamProtocol,
    ) -> Result<IncomingStreams<Self::Stream>, TransportError> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| TransportError::AlreadyRegistered(protocol.to_string()))?;
        Ok(incoming.boxed())
    }
}

// ============================================================================
// Swarm driver
// ============================================================================

type ReserveReply = oneshot::Sender<Result<Reservation, TransportError>>;

/// Circuit listener on one relay.
struct RelayListener {
    id:       ListenerId,
    /// Set once the relay accepted the reservation; the relay client renews
    /// it from then on for as long as the listener lives.
    reserved: bool,
    opened:   Instant,
    pending:  Vec<ReserveReply>,
}

impl RelayListener {
    fn new(id: ListenerId, reply: ReserveReply) -> Self {
        Self { id, reserved: false, opened: Instant::now(), pending: vec![reply] }
    }

    /// Queue `reply` until the relay answers. Hands it back when the
    /// listener has gone unaccepted for a full attempt timeout and should be
    /// replaced.
    fn wait_for_acceptance(&mut self, reply: ReserveReply) -> Result<(), ReserveReply> {
        // Callers that timed out have dropped their receivers.
        self.pending.retain(|pending| !pending.is_closed());
        if self.opened.elapsed() >= RELAY_ATTEMPT_TIMEOUT {
            return Err(reply);
        }
        self.pending.push(reply);
        Ok(())
    }

    fn accepted(&mut self, relay: PeerId, renewal: bool) {
        self.reserved = true;
        for reply in self.pending.drain(..) {
            let _ = reply.send(Ok(Reservation { relay, renewal }));
        }
    }

    fn fail(self, relay: PeerId, reason: &str) {
        for reply in self.pending {
            let _ = reply.send(Err(TransportError::Reservation {
                relay,
                reason: reason.to_string(),
            }));
        }
    }
}

struct Driver {
    swarm:           Swarm<SignerBehaviour>,
    commands:        mpsc::Receiver<Command>,
    address_book:    HashMap<PeerId, Vec<Multiaddr>>,
    pending_dials:   HashMap<PeerId, Vec<oneshot::Sender<Result<(), TransportError>>>>,
    relay_listeners: HashMap<PeerId, RelayListener>,
}

impl Driver {
    fn new(swarm: Swarm<SignerBehaviour>, commands: mpsc::Receiver<Command>) -> Self {
        Self {
            swarm,
            commands,
            address_book:    HashMap::new(),
            pending_dials:   HashMap::new(),
            relay_listeners: HashMap::new(),
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        tracing::debug!("network driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            Command::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),
            Command::Reserve { relay, reply } => self.reserve(relay, reply),
            Command::AddAddresses { peer, addrs } => {
                let book = self.address_book.entry(peer).or_default();
                for addr in addrs {
                    if !book.contains(&addr) {
                        book.push(addr);
                    }
                }
            }
        }
    }

    fn dial(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    ) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        let addrs = if addrs.is_empty() {
            self.address_book.get(&peer).cloned().unwrap_or_default()
        } else {
            addrs
        };
        if addrs.is_empty() {
            let _ = reply.send(Err(TransportError::NoAddresses(peer)));
            return;
        }

        let opts = DialOpts::peer_id(peer)
            .addresses(addrs)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match self.swarm.dial(opts) {
            // A dial already in flight resolves this reply too.
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(TransportError::Dial { peer, reason: e.to_string() }));
            }
        }
    }

    fn reserve(
        &mut self,
        relay: RelayDescriptor,
        reply: ReserveReply,
    ) {
        let reply = match self.relay_listeners.get_mut(&relay.id) {
            Some(listener) if listener.reserved => {
                let _ = reply.send(Ok(Reservation { relay: relay.id, renewal: true }));
                return;
            }
            Some(listener) => match listener.wait_for_acceptance(reply) {
                Ok(()) => return,
                Err(reply) => reply,
            },
            None => reply,
        };

        if let Some(stale) = self.relay_listeners.remove(&relay.id) {
            tracing::debug!(
                relay = %relay.id,
                "reservation not accepted in time, reopening circuit listener"
            );
            self.swarm.remove_listener(stale.id);
            stale.fail(relay.id, "reservation not accepted in time");
        }

        let Some(addr) = relay.reservation_addr() else {
            let _ = reply.send(Err(TransportError::NoAddresses(relay.id)));
            return;
        };
        match self.swarm.listen_on(addr) {
            Ok(id) => {
                self.relay_listeners.insert(relay.id, RelayListener::new(id, reply));
            }
            Err(e) => {
                let _ = reply.send(Err(TransportError::Reservation {
                    relay:  relay.id,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn resolve_dials(&mut self, peer: PeerId, result: impl Fn() -> Result<(), TransportError>) {
        if let Some(replies) = self.pending_dials.remove(&peer) {
            for reply in replies {
                let _ = reply.send(result());
            }
        }
    }

    fn reservation_accepted(&mut self, relay: PeerId, renewal: bool) {
        if let Some(listener) = self.relay_listeners.get_mut(&relay) {
            listener.accepted(relay, renewal);
        }
    }

    fn relay_listener_closed(&mut self, listener_id: ListenerId, reason: String) {
        let relay = self
            .relay_listeners
            .iter()
            .find(|(_, l)| l.id == listener_id)
            .map(|(relay, _)| *relay);
        let Some(relay) = relay else {
            return;
        };
        tracing::warn!(%relay, "relay circuit listener closed: {reason}");
        if let Some(listener) = self.relay_listeners.remove(&relay) {
            listener.fail(relay, &reason);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<SignerBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                tracing::debug!("Connected to {peer_id} via {}", endpoint.get_remote_address());
                self.resolve_dials(peer_id, || Ok(()));
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, cause, .. } => {
                tracing::debug!(
                    "Disconnected from {peer_id} ({num_established} remaining): {cause:?}"
                );
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                if self.swarm.is_connected(&peer_id) {
                    self.resolve_dials(peer_id, || Ok(()));
                } else {
                    let reason = error.to_string();
                    tracing::warn!("Outgoing connection error to {peer_id}: {reason}");
                    self.resolve_dials(peer_id, || {
                        Err(TransportError::Dial { peer: peer_id, reason: reason.clone() })
                    });
                }
            }
            SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                self.relay_listener_closed(listener_id, reason);
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                tracing::warn!("Listener {listener_id:?} error: {error}");
            }
            SwarmEvent::Behaviour(SignerBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, renewal, .. },
            )) => {
                tracing::debug!(relay = %relay_peer_id, renewal, "reservation accepted");
                self.reservation_accepted(relay_peer_id, renewal);
            }
            SwarmEvent::Behaviour(SignerBehaviourEvent::RelayClient(event)) => {
                tracing::debug!("Relay client event: {event:?}");
            }
            SwarmEvent::Behaviour(SignerBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                tracing::trace!("Identified {peer_id}: agent={}", info.agent_version);
            }
            _ => {}
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
