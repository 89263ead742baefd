//! CBOR helpers shared by the wire types.
//!
//! Encoding always goes through `ciborium::value::Value`, which serializes
//! integers and lengths in their shortest form and never uses indefinite
//! lengths. Decoding is lenient about those details; callers that need
//! canonical input compare the re-encoding against the original bytes.

use ciborium::value::Value;

use crate::error::ProtocolError;

/// Serialize a CBOR value into bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Parse one CBOR value from the front of `data`.
pub fn decode(data: &[u8]) -> Result<Value, ProtocolError> {
    ciborium::from_reader(data).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

pub fn array_from_value(v: Value, len: usize) -> Result<Vec<Value>, ProtocolError> {
    match v {
        Value::Array(a) if a.len() == len => Ok(a),
        Value::Array(a) => Err(ProtocolError::CborDecode(format!(
            "expected {len} fields, got {}",
            a.len()
        ))),
        _ => Err(ProtocolError::CborDecode("expected array".into())),
    }
}

pub fn u64_from_value(v: &Value) -> Result<u64, ProtocolError> {
    match v {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            n.try_into().map_err(|_| ProtocolError::CborDecode("u64 overflow".into()))
        }
        _ => Err(ProtocolError::CborDecode("expected integer".into())),
    }
}

pub fn i64_from_value(v: &Value) -> Result<i64, ProtocolError> {
    match v {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            n.try_into().map_err(|_| ProtocolError::CborDecode("i64 overflow".into()))
        }
        _ => Err(ProtocolError::CborDecode("expected integer".into())),
    }
}

pub fn bool_from_value(v: &Value) -> Result<bool, ProtocolError> {
    match v {
        Value::Bool(b) => Ok(*b),
        _ => Err(ProtocolError::CborDecode("expected bool".into())),
    }
}

pub fn bytes_from_value(v: &Value) -> Result<Vec<u8>, ProtocolError> {
    match v {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(ProtocolError::CborDecode("expected bytes".into())),
    }
}

pub fn text_from_value(v: &Value) -> Result<String, ProtocolError> {
    match v {
        Value::Text(s) => Ok(s.clone()),
        _ => Err(ProtocolError::CborDecode("expected text".into())),
    }
}
