use std::collections::{HashMap, HashSet};

use dealsign_protocol::Address;
use libp2p::PeerId;
use thiserror::Error;

use crate::wallet::{ExportedKey, Wallet, WalletError};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to resolve private key #{index} to an address: {source}")]
    Resolve {
        index: usize,
        #[source]
        source: WalletError,
    },
}

/// Signing keys indexed by address, plus the peers allowed to request
/// signatures.
///
/// Built once at startup and never mutated afterwards, so handlers share it
/// through an `Arc` without locking.
#[derive(Debug)]
pub struct KeyStore {
    keys: HashMap<Address, ExportedKey>,
    allowed_requesters: HashSet<PeerId>,
}

impl KeyStore {
    /// Resolve every key to its address through `wallet`.
    ///
    /// Any unresolvable key fails the whole construction.
    pub fn new<W: Wallet + ?Sized>(
        wallet: &W,
        keys: impl IntoIterator<Item = ExportedKey>,
        allowed_requesters: impl IntoIterator<Item = PeerId>,
    ) -> Result<Self, KeyStoreError> {
        let mut map = HashMap::new();
        for (index, key) in keys.into_iter().enumerate() {
            let address = wallet
                .public_address(&key)
                .map_err(|source| KeyStoreError::Resolve { index, source })?;
            map.insert(address, key);
        }

        Ok(Self {
            keys: map,
            allowed_requesters: allowed_requesters.into_iter().collect(),
        })
    }

    pub fn key_for(&self, address: &Address) -> Option<&ExportedKey> {
        self.keys.get(address)
    }

    /// Exact-match membership test.
    pub fn is_allowed(&self, peer: &PeerId) -> bool {
        self.allowed_requesters.contains(peer)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.keys.keys()
    }

    pub fn allowed_requesters(&self) -> impl Iterator<Item = &PeerId> {
        self.allowed_requesters.iter()
    }
}
