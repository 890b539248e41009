//! JSON bridge.
//!
//! Documents travel to and from document stores as JSON. Byte strings have no
//! JSON form and are written as arrays of small integers; non-finite floats
//! become `null`.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::{Map, Number};

/// Convert a value into a `serde_json` value.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::Number(Number::from(*n)),
        Value::Float(f) => Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::Array(
            b.iter()
                .map(|byte| serde_json::Value::Number(Number::from(*byte)))
                .collect(),
        ),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Object(pairs) => {
            let mut map = Map::with_capacity(pairs.len());
            for (key, value) in pairs {
                map.insert(key.clone(), to_json(value));
            }
            serde_json::Value::Object(map)
        }
    }
}

/// Convert a `serde_json` value into a value.
///
/// Integers that fit `i64` stay integers; everything else numeric becomes a
/// float.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), from_json(value)))
                .collect(),
        ),
    }
}

/// Parse JSON text into a value.
///
/// # Errors
///
/// Returns [`CodecError::InvalidJson`] if the text is not valid JSON.
pub fn parse_json(text: &str) -> CodecResult<Value> {
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::InvalidJson {
            message: e.to_string(),
        })?;
    Ok(from_json(&json))
}

/// Render a value as compact JSON text.
///
/// # Errors
///
/// Returns an error if the value contains a non-finite float.
pub fn to_json_string(value: &Value) -> CodecResult<String> {
    serde_json::to_string(value).map_err(|e| CodecError::encoding_failed(e.to_string()))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(f) => {
                if f.is_finite() {
                    serializer.serialize_f64(*f)
                } else {
                    Err(serde::ser::Error::custom(format!(
                        "non-finite float {f} has no JSON form"
                    )))
                }
            }
            Value::Text(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (key, value) in pairs {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}
