//! Value converters between entity values and provider values.

use crate::error::{CoreError, CoreResult};
use crate::metadata::ValueKind;
use entiframe_codec::Value;
use std::fmt;
use uuid::Uuid;

/// Maps a property's entity-side value to the value the store persists.
///
/// `Null` is never passed to a converter; callers pass it through unchanged.
pub trait ValueConverter: Send + Sync + fmt::Debug {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Kind of the provider-side value.
    fn provider_kind(&self) -> ValueKind;

    /// Converts an entity value to its provider form.
    fn to_provider(&self, value: &Value) -> CoreResult<Value>;

    /// Converts a provider value back to its entity form.
    fn from_provider(&self, value: &Value) -> CoreResult<Value>;
}

/// Applies a converter to a non-null value.
pub fn convert_to_provider(
    converter: Option<&dyn ValueConverter>,
    value: &Value,
) -> CoreResult<Value> {
    match converter {
        Some(converter) if !value.is_null() => converter.to_provider(value),
        _ => Ok(value.clone()),
    }
}

/// Applies a converter's inverse to a non-null value.
pub fn convert_from_provider(
    converter: Option<&dyn ValueConverter>,
    value: &Value,
) -> CoreResult<Value> {
    match converter {
        Some(converter) if !value.is_null() => converter.from_provider(value),
        _ => Ok(value.clone()),
    }
}

fn unexpected(converter: &dyn ValueConverter, value: &Value) -> CoreError {
    CoreError::invalid_operation(format!(
        "{} cannot convert {} value {value}",
        converter.name(),
        value.type_name()
    ))
}

/// Stores booleans as `0`/`1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolToIntConverter;

impl ValueConverter for BoolToIntConverter {
    fn name(&self) -> &'static str {
        "BoolToIntConverter"
    }

    fn provider_kind(&self) -> ValueKind {
        ValueKind::Integer
    }

    fn to_provider(&self, value: &Value) -> CoreResult<Value> {
        match value {
            Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            other => Err(unexpected(self, other)),
        }
    }

    fn from_provider(&self, value: &Value) -> CoreResult<Value> {
        match value {
            Value::Integer(n) => Ok(Value::Bool(*n != 0)),
            other => Err(unexpected(self, other)),
        }
    }
}

/// Stores enum ordinals as their member names.
#[derive(Debug, Clone)]
pub struct EnumToStringConverter {
    names: Vec<String>,
}

impl EnumToStringConverter {
    /// Creates a converter for an enum whose members, in ordinal order, are `names`.
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ValueConverter for EnumToStringConverter {
    fn name(&self) -> &'static str {
        "EnumToStringConverter"
    }

    fn provider_kind(&self) -> ValueKind {
        ValueKind::Text
    }

    fn to_provider(&self, value: &Value) -> CoreResult<Value> {
        value
            .as_integer()
            .and_then(|n| usize::try_from(n).ok())
            .and_then(|n| self.names.get(n))
            .map(|name| Value::Text(name.clone()))
            .ok_or_else(|| unexpected(self, value))
    }

    fn from_provider(&self, value: &Value) -> CoreResult<Value> {
        value
            .as_text()
            .and_then(|text| self.names.iter().position(|name| name == text))
            .and_then(|n| i64::try_from(n).ok())
            .map(Value::Integer)
            .ok_or_else(|| unexpected(self, value))
    }
}

/// Stores 16-byte GUIDs as hyphenated lowercase text.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidToStringConverter;

impl ValueConverter for GuidToStringConverter {
    fn name(&self) -> &'static str {
        "GuidToStringConverter"
    }

    fn provider_kind(&self) -> ValueKind {
        ValueKind::Text
    }

    fn to_provider(&self, value: &Value) -> CoreResult<Value> {
        value
            .as_bytes()
            .and_then(|bytes| Uuid::from_slice(bytes).ok())
            .map(|uuid| Value::Text(uuid.hyphenated().to_string()))
            .ok_or_else(|| unexpected(self, value))
    }

    fn from_provider(&self, value: &Value) -> CoreResult<Value> {
        value
            .as_text()
            .and_then(|text| Uuid::parse_str(text).ok())
            .map(|uuid| Value::Bytes(uuid.as_bytes().to_vec()))
            .ok_or_else(|| unexpected(self, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_to_int() {
        let c = BoolToIntConverter;
        assert_eq!(c.to_provider(&Value::Bool(true)).unwrap(), Value::Integer(1));
        assert_eq!(c.from_provider(&Value::Integer(0)).unwrap(), Value::Bool(false));
        assert!(c.to_provider(&Value::from("yes")).is_err());
    }

    #[test]
    fn enum_to_string() {
        let c = EnumToStringConverter::new(["Pending", "Shipped", "Delivered"]);
        assert_eq!(c.to_provider(&Value::Integer(1)).unwrap(), Value::from("Shipped"));
        assert_eq!(
            c.from_provider(&Value::from("Delivered")).unwrap(),
            Value::Integer(2)
        );
        assert!(c.to_provider(&Value::Integer(9)).is_err());
        assert!(c.from_provider(&Value::from("Lost")).is_err());
    }

    #[test]
    fn guid_to_string() {
        let uuid = Uuid::new_v4();
        let c = GuidToStringConverter;
        let text = c.to_provider(&Value::Bytes(uuid.as_bytes().to_vec())).unwrap();
        assert_eq!(text, Value::Text(uuid.hyphenated().to_string()));
        assert_eq!(
            c.from_provider(&text).unwrap(),
            Value::Bytes(uuid.as_bytes().to_vec())
        );
    }

    #[test]
    fn null_passes_through() {
        let c = BoolToIntConverter;
        assert_eq!(convert_to_provider(Some(&c), &Value::Null).unwrap(), Value::Null);
        assert_eq!(
            convert_from_provider(None, &Value::Integer(3)).unwrap(),
            Value::Integer(3)
        );
    }
}
