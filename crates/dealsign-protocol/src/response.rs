use ciborium::value::Value;

use crate::{
    cbor::{bytes_from_value, decode, encode, text_from_value, u64_from_value},
    error::ProtocolError,
    status::StatusCode,
};

const KEY_CODE: &str = "Code";
const KEY_MESSAGE: &str = "Message";
const KEY_SIGNATURE: &str = "Signature";

/// Reply to one signing request.
///
/// Encoded as a CBOR map with text keys `Code`, `Message`, `Signature`,
/// always in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerResponse {
    pub code: StatusCode,
    pub message: String,
    /// Marshalled signature; empty unless `code` is `Success`.
    pub signature: Vec<u8>,
}

impl SignerResponse {
    pub fn success(signature: Vec<u8>) -> Self {
        Self {
            code: StatusCode::Success,
            message: String::new(),
            signature,
        }
    }

    pub fn failure(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            signature: Vec::new(),
        }
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let value = Value::Map(vec![
            (Value::Text(KEY_CODE.into()), Value::Integer(self.code.as_u64().into())),
            (Value::Text(KEY_MESSAGE.into()), Value::Text(self.message.clone())),
            (Value::Text(KEY_SIGNATURE.into()), Value::Bytes(self.signature.clone())),
        ]);
        encode(&value)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let entries = match decode(data)? {
            Value::Map(m) => m,
            _ => return Err(ProtocolError::CborDecode("expected map".into())),
        };

        let field = |name: &str| {
            entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Text(t) if t == name))
                .map(|(_, v)| v)
                .ok_or_else(|| ProtocolError::CborDecode(format!("missing field {name}")))
        };

        Ok(Self {
            code: StatusCode::from_u64(u64_from_value(field(KEY_CODE)?)?)?,
            message: text_from_value(field(KEY_MESSAGE)?)?,
            signature: bytes_from_value(field(KEY_SIGNATURE)?)?,
        })
    }
}
