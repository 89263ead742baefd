//! In-memory transport: streams are `tokio::io::duplex` pairs routed by
//! (peer, protocol). Connectivity operations always succeed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::io::DuplexStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::{
    relay::RelayDescriptor,
    transport::{Connectedness, IncomingStreams, Reservation, Transport, TransportError},
};

pub type MemoryStream = Compat<DuplexStream>;

const PIPE_CAPACITY: usize = 16 * 1024;

type HandlerKey = (PeerId, String);

#[derive(Default)]
pub struct MemoryNetwork {
    handlers: Mutex<HashMap<HandlerKey, mpsc::UnboundedSender<(PeerId, MemoryStream)>>>,
}

pub struct MemoryTransport {
    local:            PeerId,
    network:          Arc<MemoryNetwork>,
    pub address_book: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl MemoryTransport {
    pub fn new(network: &Arc<MemoryNetwork>) -> Self {
        Self {
            local:        PeerId::random(),
            network:      Arc::clone(network),
            address_book: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = MemoryStream;

    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn connectedness(&self, _peer: PeerId) -> Connectedness {
        Connectedness::Connected
    }

    async fn connect(&self, _relay: &RelayDescriptor) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reserve(&self, relay: &RelayDescriptor) -> Result<Reservation, TransportError> {
        Ok(Reservation { relay: relay.id, renewal: false })
    }

    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        self.address_book.lock().unwrap().entry(peer).or_default().extend(addrs);
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, TransportError> {
        if !self.address_book.lock().unwrap().contains_key(&peer) {
            return Err(TransportError::NoAddresses(peer));
        }
        let handler = self
            .network
            .handlers
            .lock()
            .unwrap()
            .get(&(peer, protocol.to_string()))
            .cloned()
            .ok_or_else(|| TransportError::OpenStream {
                peer,
                reason: "protocol not supported".into(),
            })?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        handler
            .unbounded_send((self.local, remote.compat()))
            .map_err(|_| TransportError::OpenStream { peer, reason: "handler gone".into() })?;
        Ok(local.compat())
    }

    fn accept(
        &self,
        protocol: StreamProtocol,
    ) -> Result<IncomingStreams<Self::Stream>, TransportError> {
        let mut handlers = self.network.handlers.lock().unwrap();
        let key = (self.local, protocol.to_string());
        if handlers.contains_key(&key) {
            return Err(TransportError::AlreadyRegistered(protocol.to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        handlers.insert(key, tx);
        Ok(rx.boxed())
    }
}
