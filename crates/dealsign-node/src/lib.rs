//! Relay-reachable signer for storage deal proposals, and the client that
//! talks to it.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod health;
pub mod host;
pub mod identity;
pub mod keystore;
pub mod relay;
pub mod server;
pub mod transport;
pub mod wallet;

#[cfg(test)]
mod testutil;

pub use client::{ClientError, ProposalSigner, RequestError, SignerClient};
pub use host::Libp2pHost;
pub use keystore::KeyStore;
pub use server::SignerServer;
pub use transport::{Transport, TransportError};
pub use wallet::{Ed25519Wallet, ExportedKey, Wallet};
