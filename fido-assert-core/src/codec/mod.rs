//! Wire encodings for the two authenticator protocols.
//!
//! - [`ctap2`] - CBOR command frames (modern protocol)
//! - [`u2f`] - ISO 7816 APDUs (legacy protocol)
//!
//! CTAP2 payloads are CBOR maps keyed by small integers; the helpers
//! below build and read those maps on top of `ciborium::Value`.

pub mod ctap2;
pub mod u2f;

use ciborium::Value;

use crate::error::{FidoError, Result};

/// Encode a CBOR value to bytes.
pub(crate) fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| FidoError::EncodingError(e.to_string()))?;
    Ok(buffer)
}

/// Build a CBOR map with integer keys, skipping absent entries.
pub(crate) fn int_map(entries: impl IntoIterator<Item = (i64, Option<Value>)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (Value::Integer(k.into()), v)))
            .collect(),
    )
}

/// Build a CBOR map with text keys.
pub(crate) fn text_map(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Text(k.to_string()), v))
            .collect(),
    )
}

/// Read-only view over a decoded CBOR map.
pub(crate) struct MapReader {
    entries: Vec<(Value, Value)>,
}

impl MapReader {
    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(data)
            .map_err(|e| FidoError::MalformedResponse(format!("invalid CBOR: {e}")))?;
        Self::from_value(value)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(entries) => Ok(Self { entries }),
            other => Err(FidoError::MalformedResponse(format!(
                "expected CBOR map, got {other:?}"
            ))),
        }
    }

    fn find(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub(crate) fn int(&self, key: i64) -> Option<&Value> {
        self.find(&Value::Integer(key.into()))
    }

    pub(crate) fn text(&self, key: &str) -> Option<&Value> {
        self.find(&Value::Text(key.to_string()))
    }

    pub(crate) fn required_int(&self, key: i64) -> Result<&Value> {
        self.int(key)
            .ok_or_else(|| FidoError::MalformedResponse(format!("missing map key {key}")))
    }
}

/// Extract a byte string.
pub(crate) fn as_bytes(value: &Value, field: &str) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        _ => Err(FidoError::MalformedResponse(format!(
            "{field}: expected byte string"
        ))),
    }
}

/// Extract a text string.
pub(crate) fn as_text(value: &Value, field: &str) -> Result<String> {
    match value {
        Value::Text(text) => Ok(text.clone()),
        _ => Err(FidoError::MalformedResponse(format!(
            "{field}: expected text string"
        ))),
    }
}
