pub mod address;
pub mod cbor;
pub mod constants;
pub mod error;
pub mod proposal;
pub mod response;
pub mod signature;
pub mod status;

pub use address::Address;
pub use constants::*;
pub use error::ProtocolError;
pub use proposal::{DealProposal, SignablePayload, TokenAmount};
pub use response::SignerResponse;
pub use signature::{SigType, Signature};
pub use status::StatusCode;
