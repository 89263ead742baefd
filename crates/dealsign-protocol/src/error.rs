use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    #[error("unknown status code: {0}")]
    UnknownStatusCode(u64),

    #[error("unknown signature type: {0:#04x}")]
    UnknownSigType(u8),

    #[error("signature is empty")]
    EmptySignature,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid token amount: {0}")]
    InvalidTokenAmount(String),
}
