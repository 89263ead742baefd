//! The networking contract the signer and client are written against.
//!
//! `host::Libp2pHost` implements it over a real libp2p swarm; tests use an
//! in-memory implementation.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::BoxStream;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;

use crate::relay::RelayDescriptor;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("no known addresses for {0}")]
    NoAddresses(PeerId),

    #[error("reservation on relay {relay} failed: {reason}")]
    Reservation { relay: PeerId, reason: String },

    #[error("open stream to {peer} failed: {reason}")]
    OpenStream { peer: PeerId, reason: String },

    #[error("protocol {0} already has a handler")]
    AlreadyRegistered(String),

    #[error("operation timed out")]
    Timeout,

    #[error("network host has shut down")]
    HostShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// An accepted relay reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub relay: PeerId,
    /// True when this confirms an already-held reservation.
    pub renewal: bool,
}

/// Bidirectional stream. `close()` half-closes the write side; dropping
/// releases it.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Inbound streams for one protocol, tagged with the remote peer.
pub type IncomingStreams<S> = BoxStream<'static, (PeerId, S)>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: ByteStream;

    fn local_peer_id(&self) -> PeerId;

    async fn connectedness(&self, peer: PeerId) -> Connectedness;

    /// Dial a relay on any of its addresses.
    async fn connect(&self, relay: &RelayDescriptor) -> Result<(), TransportError>;

    /// Obtain (or confirm) a reservation on a connected relay.
    async fn reserve(&self, relay: &RelayDescriptor) -> Result<Reservation, TransportError>;

    /// Remember addresses for `peer` for the lifetime of the host.
    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>);

    /// Open an outbound stream, dialing through known (possibly relayed)
    /// addresses if not yet connected.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, TransportError>;

    /// Register as the handler for `protocol` and receive its inbound streams.
    fn accept(
        &self,
        protocol: StreamProtocol,
    ) -> Result<IncomingStreams<Self::Stream>, TransportError>;
}

/// Read until EOF, failing if the body exceeds `limit` bytes.
pub async fn read_to_end_bounded<S>(stream: &mut S, limit: usize) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    use futures::io::AsyncReadExt;

    let mut buf = Vec::new();
    (&mut *stream).take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("body exceeds {limit} bytes"),
        ));
    }
    Ok(buf)
}
