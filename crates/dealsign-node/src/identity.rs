use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use libp2p::{identity, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity key is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("identity key is not a valid libp2p private key: {0}")]
    Decode(#[from] identity::DecodingError),
}

/// Decode a libp2p keypair from the base64 of its protobuf encoding.
pub fn decode_identity(encoded: &str) -> Result<identity::Keypair, IdentityError> {
    let bytes = B64.decode(encoded.trim())?;
    Ok(identity::Keypair::from_protobuf_encoding(&bytes)?)
}

/// A fresh Ed25519 network identity in the same encoding `decode_identity`
/// accepts.
pub struct GeneratedPeer {
    pub peer_id:     PeerId,
    /// base64 protobuf-encoded public key.
    pub public_key:  String,
    /// base64 protobuf-encoded private key.
    pub private_key: String,
}

pub fn generate_peer() -> Result<GeneratedPeer, IdentityError> {
    let keypair = identity::Keypair::generate_ed25519();
    let private = keypair.to_protobuf_encoding()?;
    let public = keypair.public().encode_protobuf();

    Ok(GeneratedPeer {
        peer_id:     keypair.public().to_peer_id(),
        public_key:  B64.encode(public),
        private_key: B64.encode(private),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_decodes_to_same_id() {
        let peer = generate_peer().unwrap();
        let keypair = decode_identity(&peer.private_key).unwrap();
        assert_eq!(keypair.public().to_peer_id(), peer.peer_id);

        let public = identity::PublicKey::try_decode_protobuf(&B64.decode(&peer.public_key).unwrap())
            .unwrap();
        assert_eq!(public.to_peer_id(), peer.peer_id);
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let peer = generate_peer().unwrap();
        let keypair = decode_identity(&format!("  {}\n", peer.private_key)).unwrap();
        assert_eq!(keypair.public().to_peer_id(), peer.peer_id);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(decode_identity("%%%"), Err(IdentityError::Base64(_))));
        assert!(matches!(
            decode_identity(&B64.encode(b"not a protobuf key")),
            Err(IdentityError::Decode(_))
        ));
    }
}
