//! Pluggable appendix codecs.
//!
//! A form's appendix is serialized by one of two codecs: a portable
//! textual codec (UTF-8 JSON) that any peer can read but which cannot
//! carry fault values, and a rich binary codec (bincode) that encodes the
//! whole [`Value`] space including faults. Both peers of a session must
//! agree on the codec; the choice is carried in session configuration.

use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

use crate::value::Value;

/// Errors produced by appendix encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value cannot be represented by the chosen codec.
    #[error("appendix encode failed: {0}")]
    Encode(String),
    /// The received bytes do not decode to a value.
    #[error("appendix decode failed: {0}")]
    Decode(String),
}

/// Serializer interface for form appendices.
pub trait AppendixCodec: Send + Sync {
    /// Encode a value into its byte representation.
    ///
    /// # Errors
    /// Returns [`CodecError::Encode`] when the value is outside the
    /// codec's support set.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes back into a value.
    ///
    /// Empty or whitespace-only input decodes to an empty list by
    /// convention, matching the zero-length appendix of a bodiless form.
    ///
    /// # Errors
    /// Returns [`CodecError::Decode`] when the bytes are not a valid
    /// encoding.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;

    /// Whether the codec can encode the given value.
    fn can_encode(&self, value: &Value) -> bool;
}

/// Codec selection carried in session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Portable textual codec (UTF-8 JSON).
    #[default]
    Json,
    /// Rich binary codec (bincode).
    Binary,
}

impl CodecKind {
    /// The codec implementation for this kind.
    #[must_use]
    pub fn codec(self) -> &'static dyn AppendixCodec {
        match self {
            Self::Json => &JsonCodec,
            Self::Binary => &BinaryCodec,
        }
    }

    /// Configuration name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Error for an unrecognized codec name in configuration.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown codec {0:?}; expected \"json\" or \"binary\"")]
pub struct UnknownCodec(pub String);

impl FromStr for CodecKind {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "binary" => Ok(Self::Binary),
            other => Err(UnknownCodec(other.to_owned())),
        }
    }
}

/// Portable textual codec over UTF-8 JSON.
///
/// Supports the universal scalar/sequence/mapping subset of [`Value`];
/// fault values are refused so that error forms fall back to their
/// `name`/`message` body lines.
pub struct JsonCodec;

impl AppendixCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let json = to_json(value)?;
        serde_json::to_vec(&json).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if is_blank(bytes) {
            return Ok(Value::List(Vec::new()));
        }
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(from_json(json))
    }

    fn can_encode(&self, value: &Value) -> bool { !value.contains_fault() }
}

/// Rich binary codec over bincode's serde integration.
pub struct BinaryCodec;

impl AppendixCodec for BinaryCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if is_blank(bytes) {
            return Ok(Value::List(Vec::new()));
        }
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(value)
    }

    fn can_encode(&self, _value: &Value) -> bool { true }
}

fn is_blank(bytes: &[u8]) -> bool { bytes.iter().all(u8::is_ascii_whitespace) }

fn to_json(value: &Value) -> Result<serde_json::Value, CodecError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => serde_json::Value::Bool(*v),
        Value::Int(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CodecError::Encode(format!("non-finite float {v}")))?,
        Value::Text(v) => serde_json::Value::String(v.clone()),
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(to_json).collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_json(v)?)))
                .collect::<Result<serde_json::Map<_, _>, CodecError>>()?,
        ),
        Value::Fault(fault) => {
            return Err(CodecError::Encode(format!(
                "fault values are not JSON-encodable: {fault}"
            )));
        }
    })
}

#[allow(clippy::cast_precision_loss)]
fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(v) => Value::Bool(v),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Value::Float(n.as_f64().unwrap_or(f64::NAN)), Value::Int),
        serde_json::Value::String(v) => Value::Text(v),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, from_json(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}
