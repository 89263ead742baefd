use ciborium::value::Value;

use crate::{
    address::Address,
    cbor::{
        array_from_value, bool_from_value, bytes_from_value, decode, encode, i64_from_value,
        text_from_value, u64_from_value,
    },
    error::ProtocolError,
};

/// A payload that can be sent to a remote signer.
///
/// The encoding must be canonical: equal values produce equal bytes, so a
/// signer can reject any byte string that is not the re-encoding of what it
/// decodes to.
pub trait SignablePayload: Sized {
    fn to_canonical_bytes(&self) -> Result<Vec<u8>, ProtocolError>;

    fn from_canonical_bytes(data: &[u8]) -> Result<Self, ProtocolError>;

    /// Address whose key must sign this payload.
    fn selector(&self) -> &Address;
}

// ============================================================================
// TokenAmount
// ============================================================================

/// Non-negative token quantity in the smallest unit.
///
/// Wire form is a byte string: empty for zero, otherwise a `0x00` sign byte
/// followed by the big-endian magnitude without leading zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub fn to_bytes(self) -> Vec<u8> {
        if self.0 == 0 {
            return Vec::new();
        }
        let be = self.0.to_be_bytes();
        let first = be.iter().position(|b| *b != 0).unwrap_or(be.len());
        let mut buf = Vec::with_capacity(1 + be.len() - first);
        buf.push(0x00);
        buf.extend_from_slice(&be[first..]);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (sign, magnitude) = match bytes.split_first() {
            None => return Ok(Self(0)),
            Some(parts) => parts,
        };
        if *sign != 0x00 {
            return Err(ProtocolError::InvalidTokenAmount(format!(
                "unsupported sign byte {sign:#04x}"
            )));
        }
        if magnitude.len() > 16 {
            return Err(ProtocolError::InvalidTokenAmount(format!(
                "magnitude of {} bytes exceeds 128 bits",
                magnitude.len()
            )));
        }
        let mut be = [0u8; 16];
        be[16 - magnitude.len()..].copy_from_slice(magnitude);
        Ok(Self(u128::from_be_bytes(be)))
    }
}

// ============================================================================
// DealProposal
// ============================================================================

/// Storage deal proposal presented to a signer.
///
/// Encoded as a CBOR array; field order below is the wire order.
/// `client` is the selector address: the signer signs with the client's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealProposal {
    /// Raw CID bytes of the piece being stored.
    pub piece_cid: Vec<u8>,
    pub piece_size: u64,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

const DEAL_PROPOSAL_FIELDS: usize = 11;

impl DealProposal {
    pub fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let value = Value::Array(vec![
            Value::Bytes(self.piece_cid.clone()),
            Value::Integer(self.piece_size.into()),
            Value::Bool(self.verified_deal),
            Value::Bytes(self.client.as_bytes().to_vec()),
            Value::Bytes(self.provider.as_bytes().to_vec()),
            Value::Text(self.label.clone()),
            Value::Integer(self.start_epoch.into()),
            Value::Integer(self.end_epoch.into()),
            Value::Bytes(self.storage_price_per_epoch.to_bytes()),
            Value::Bytes(self.provider_collateral.to_bytes()),
            Value::Bytes(self.client_collateral.to_bytes()),
        ]);
        encode(&value)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let arr = array_from_value(decode(data)?, DEAL_PROPOSAL_FIELDS)?;

        Ok(Self {
            piece_cid:               bytes_from_value(&arr[0])?,
            piece_size:              u64_from_value(&arr[1])?,
            verified_deal:           bool_from_value(&arr[2])?,
            client:                  Address::from_slice(&bytes_from_value(&arr[3])?)?,
            provider:                Address::from_slice(&bytes_from_value(&arr[4])?)?,
            label:                   text_from_value(&arr[5])?,
            start_epoch:             i64_from_value(&arr[6])?,
            end_epoch:               i64_from_value(&arr[7])?,
            storage_price_per_epoch: TokenAmount::from_bytes(&bytes_from_value(&arr[8])?)?,
            provider_collateral:     TokenAmount::from_bytes(&bytes_from_value(&arr[9])?)?,
            client_collateral:       TokenAmount::from_bytes(&bytes_from_value(&arr[10])?)?,
        })
    }
}

impl SignablePayload for DealProposal {
    fn to_canonical_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_cbor()
    }

    fn from_canonical_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_cbor(data)
    }

    fn selector(&self) -> &Address {
        &self.client
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
