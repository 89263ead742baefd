use crate::error::ProtocolError;

/// Signature scheme tag, the first byte of a marshalled signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SigType {
    Ed25519 = 0x01,
}

impl SigType {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0x01 => Ok(Self::Ed25519),
            other => Err(ProtocolError::UnknownSigType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A typed signature as returned by the wallet.
///
/// Binary form is `[sig_type] ++ data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub sig_type: SigType,
    pub data: Vec<u8>,
}

impl Signature {
    pub fn new(sig_type: SigType, data: Vec<u8>) -> Self {
        Self { sig_type, data }
    }

    pub fn marshal_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.data.is_empty() {
            return Err(ProtocolError::EmptySignature);
        }
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(self.sig_type.as_u8());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn unmarshal_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes.split_first() {
            None => Err(ProtocolError::EmptySignature),
            Some((_, [])) => Err(ProtocolError::EmptySignature),
            Some((tag, data)) => Ok(Self {
                sig_type: SigType::from_u8(*tag)?,
                data: data.to_vec(),
            }),
        }
    }
}
