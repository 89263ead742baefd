use std::fmt;
use std::str::FromStr;

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use thiserror::Error;

// ============================================================================
// Default relay fleet (one per region)
// ============================================================================
//
// Format: <transport addr>/p2p/<relay PeerId>
// Overridden entirely by --relay-info.

const DEFAULT_RELAYS: &[&str] = &[
    // North America
    "/dns4/relay-na.spade.services/tcp/4001/p2p/12D3KooWBVheEM7TdvfQHNLsGy39PFuDSXnnkHyXfgH5uD1pheqv",
    // Europe
    "/dns4/relay-eu.spade.services/tcp/4001/p2p/12D3KooWGxyLaT4h4XYYrcCpRVHh5N3WNTLJmCtaKHrfVz7sfTjM",
];

#[derive(Debug, Error)]
pub enum RelayParseError {
    #[error("invalid multiaddr '{input}': {reason}")]
    InvalidMultiaddr { input: String, reason: String },

    #[error("relay address '{0}' does not end in /p2p/<peer id>")]
    MissingPeerId(String),
}

/// A relay server: its peer id and the transport addresses it is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    pub id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl RelayDescriptor {
    pub fn new(id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self { id, addresses }
    }

    /// Listen address that asks this relay for a reservation:
    /// `<addr>/p2p/<relay>/p2p-circuit`.
    pub fn reservation_addr(&self) -> Option<Multiaddr> {
        self.addresses.first().map(|addr| {
            addr.clone()
                .with(Protocol::P2p(self.id))
                .with(Protocol::P2pCircuit)
        })
    }
}

impl FromStr for RelayDescriptor {
    type Err = RelayParseError;

    /// Parse `<transport addr>/p2p/<relay peer id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr: Multiaddr = s.trim().parse().map_err(|e: libp2p::multiaddr::Error| {
            RelayParseError::InvalidMultiaddr {
                input: s.to_owned(),
                reason: e.to_string(),
            }
        })?;
        match addr.pop() {
            Some(Protocol::P2p(id)) => {
                let addresses = if addr.is_empty() { Vec::new() } else { vec![addr] };
                Ok(Self { id, addresses })
            }
            _ => Err(RelayParseError::MissingPeerId(s.to_owned())),
        }
    }
}

impl fmt::Display for RelayDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for addr in &self.addresses {
            write!(f, " {addr}")?;
        }
        Ok(())
    }
}

/// The built-in relay fleet.
pub fn default_relays() -> Result<Vec<RelayDescriptor>, RelayParseError> {
    DEFAULT_RELAYS.iter().map(|s| s.parse()).collect()
}

/// Relays from operator input, or the default fleet when none are given.
pub fn relays_or_default(infos: &[String]) -> Result<Vec<RelayDescriptor>, RelayParseError> {
    if infos.is_empty() {
        default_relays()
    } else {
        infos.iter().map(|s| s.parse()).collect()
    }
}

/// One circuit address per (relay, relay address) through which `dest` can
/// be dialed: `<addr>/p2p/<relay>/p2p-circuit/p2p/<dest>`.
pub fn circuit_addresses(relays: &[RelayDescriptor], dest: PeerId) -> Vec<Multiaddr> {
    relays
        .iter()
        .flat_map(|relay| {
            relay.addresses.iter().map(move |addr| {
                addr.clone()
                    .with(Protocol::P2p(relay.id))
                    .with(Protocol::P2pCircuit)
                    .with(Protocol::P2p(dest))
            })
        })
        .collect()
}
