//! Key handling for the signer: exported-key parsing, signing and
//! verification.
//!
//! An exported key is the hex encoding of a JSON object
//! `{"Type":"ed25519","PrivateKey":"<base64 secret>"}`.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use dealsign_protocol::{Address, SigType, Signature};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_TYPE_ED25519: &str = "ed25519";

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid exported key: {0}")]
    InvalidKey(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Exported private key material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportedKey(String);

impl ExportedKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExportedKey(<redacted>)")
    }
}

impl FromStr for ExportedKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().to_owned()))
    }
}

/// Signing backend consulted by the server (sign) and the client (verify).
pub trait Wallet: Send + Sync + 'static {
    /// Resolve a private key to the address it signs for.
    fn public_address(&self, key: &ExportedKey) -> Result<Address, WalletError>;

    fn sign(&self, key: &ExportedKey, data: &[u8]) -> Result<Signature, WalletError>;

    /// Check marshalled `signature` bytes over `data` for `address`.
    /// `Ok(false)` means well-formed but not valid.
    fn verify(&self, address: &Address, data: &[u8], signature: &[u8])
        -> Result<bool, WalletError>;
}

#[derive(Serialize, Deserialize)]
struct KeyInfo {
    #[serde(rename = "Type")]
    key_type: String,
    #[serde(rename = "PrivateKey")]
    private_key: String,
}

/// Ed25519 wallet. Stateless: keys are passed in on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Wallet;

impl Ed25519Wallet {
    pub fn new() -> Self {
        Self
    }

    /// Export a signing key in the wallet's key string format.
    pub fn export_key(key: &SigningKey) -> Result<ExportedKey, WalletError> {
        let info = KeyInfo {
            key_type: KEY_TYPE_ED25519.to_owned(),
            private_key: B64.encode(key.to_bytes()),
        };
        let json = serde_json::to_vec(&info).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        Ok(ExportedKey(hex::encode(json)))
    }

    /// Generate a fresh key and export it.
    pub fn generate_key() -> Result<ExportedKey, WalletError> {
        Self::export_key(&SigningKey::generate(&mut OsRng))
    }

    fn signing_key(key: &ExportedKey) -> Result<SigningKey, WalletError> {
        let json = hex::decode(key.as_str())
            .map_err(|e| WalletError::InvalidKey(format!("hex: {e}")))?;
        let info: KeyInfo = serde_json::from_slice(&json)
            .map_err(|e| WalletError::InvalidKey(format!("json: {e}")))?;
        if !info.key_type.eq_ignore_ascii_case(KEY_TYPE_ED25519) {
            return Err(WalletError::UnsupportedKeyType(info.key_type));
        }
        let secret = B64
            .decode(info.private_key.as_bytes())
            .map_err(|e| WalletError::InvalidKey(format!("base64: {e}")))?;
        let arr: [u8; 32] = secret
            .try_into()
            .map_err(|_| WalletError::InvalidKey("expected 32-byte secret".into()))?;
        Ok(SigningKey::from_bytes(&arr))
    }
}

impl Wallet for Ed25519Wallet {
    fn public_address(&self, key: &ExportedKey) -> Result<Address, WalletError> {
        let sk = Self::signing_key(key)?;
        Ok(Address::from_bytes(sk.verifying_key().to_bytes()))
    }

    fn sign(&self, key: &ExportedKey, data: &[u8]) -> Result<Signature, WalletError> {
        let sk = Self::signing_key(key)?;
        let sig: DalekSignature = sk.sign(data);
        Ok(Signature::new(SigType::Ed25519, sig.to_bytes().to_vec()))
    }

    fn verify(
        &self,
        address: &Address,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, WalletError> {
        let sig = Signature::unmarshal_binary(signature)
            .map_err(|e| WalletError::InvalidSignature(e.to_string()))?;
        match sig.sig_type {
            SigType::Ed25519 => {
                let vk = VerifyingKey::from_bytes(address.as_bytes())
                    .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
                let sig = DalekSignature::from_slice(&sig.data)
                    .map_err(|e| WalletError::InvalidSignature(e.to_string()))?;
                Ok(vk.verify(data, &sig).is_ok())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_key_resolves_to_public_key() {
        let sk = SigningKey::generate(&mut OsRng);
        let key = Ed25519Wallet::export_key(&sk).unwrap();
        let addr = Ed25519Wallet.public_address(&key).unwrap();
        assert_eq!(addr.as_bytes(), &sk.verifying_key().to_bytes());
    }

    #[test]
    fn sign_then_verify() {
        let wallet = Ed25519Wallet::new();
        let key = Ed25519Wallet::generate_key().unwrap();
        let addr = wallet.public_address(&key).unwrap();

        let sig = wallet.sign(&key, b"proposal bytes").unwrap();
        let bytes = sig.marshal_binary().unwrap();
        assert!(wallet.verify(&addr, b"proposal bytes", &bytes).unwrap());
        assert!(!wallet.verify(&addr, b"other bytes", &bytes).unwrap());
    }

    #[test]
    fn verify_against_wrong_address_is_false() {
        let wallet = Ed25519Wallet::new();
        let key = Ed25519Wallet::generate_key().unwrap();
        let other = Ed25519Wallet::generate_key().unwrap();
        let other_addr = wallet.public_address(&other).unwrap();

        let bytes = wallet.sign(&key, b"data").unwrap().marshal_binary().unwrap();
        assert!(!wallet.verify(&other_addr, b"data", &bytes).unwrap());
    }

    #[test]
    fn malformed_signature_is_an_error() {
        let wallet = Ed25519Wallet::new();
        let addr = wallet
            .public_address(&Ed25519Wallet::generate_key().unwrap())
            .unwrap();
        assert!(matches!(
            wallet.verify(&addr, b"data", &[]),
            Err(WalletError::InvalidSignature(_))
        ));
        assert!(matches!(
            wallet.verify(&addr, b"data", &[0x01, 0xAA, 0xBB]),
            Err(WalletError::InvalidSignature(_))
        ));
    }

    #[test]
    fn malformed_keys_rejected() {
        let wallet = Ed25519Wallet::new();
        assert!(matches!(
            wallet.public_address(&ExportedKey::new("zz")),
            Err(WalletError::InvalidKey(_))
        ));

        let secp = hex::encode(br#"{"Type":"secp256k1","PrivateKey":"AAAA"}"#);
        assert!(matches!(
            wallet.public_address(&ExportedKey::new(secp)),
            Err(WalletError::UnsupportedKeyType(_))
        ));

        let short = hex::encode(br#"{"Type":"ed25519","PrivateKey":"AAAA"}"#);
        assert!(matches!(
            wallet.public_address(&ExportedKey::new(short)),
            Err(WalletError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = Ed25519Wallet::generate_key().unwrap();
        assert_eq!(format!("{key:?}"), "ExportedKey(<redacted>)");
    }
}
