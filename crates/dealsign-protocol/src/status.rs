use crate::error::ProtocolError;

/// Outcome of a signing request, carried in every `SignerResponse`.
///
/// Ordinals are part of the wire format and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum StatusCode {
    Success = 0,
    /// Remote peer is not in the allowed requester set.
    UnauthorizedRequester = 1,
    /// Request body could not be read (I/O error, timeout or oversize).
    ReadStreamError = 2,
    /// Request bytes are not a valid proposal.
    DecodeRequestError = 3,
    /// Decoded proposal could not be re-encoded.
    EncodeRequestError = 4,
    /// Request bytes are not the canonical encoding of the proposal.
    ProposalRemarshalMismatch = 5,
    /// No signing key is held for the proposal's selector address.
    WalletKeyNotFound = 6,
    WalletSignError = 7,
    MarshalSignatureError = 8,
    EncodeResponseError = 9,
}

impl StatusCode {
    pub fn from_u64(v: u64) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnauthorizedRequester),
            2 => Ok(Self::ReadStreamError),
            3 => Ok(Self::DecodeRequestError),
            4 => Ok(Self::EncodeRequestError),
            5 => Ok(Self::ProposalRemarshalMismatch),
            6 => Ok(Self::WalletKeyNotFound),
            7 => Ok(Self::WalletSignError),
            8 => Ok(Self::MarshalSignatureError),
            9 => Ok(Self::EncodeResponseError),
            other => Err(ProtocolError::UnknownStatusCode(other)),
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::UnauthorizedRequester => "UnauthorizedRequester",
            Self::ReadStreamError => "ReadStreamError",
            Self::DecodeRequestError => "DecodeRequestError",
            Self::EncodeRequestError => "EncodeRequestError",
            Self::ProposalRemarshalMismatch => "ProposalRemarshalMismatch",
            Self::WalletKeyNotFound => "WalletKeyNotFound",
            Self::WalletSignError => "WalletSignError",
            Self::MarshalSignatureError => "MarshalSignatureError",
            Self::EncodeResponseError => "EncodeResponseError",
        };
        write!(f, "{}", name)
    }
}
