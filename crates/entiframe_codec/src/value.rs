//! Dynamic value token.

use std::cmp::Ordering;
use std::fmt;

/// A dynamic value.
///
/// `Value` is the single token type used for entity property values, the
/// provider-side values produced by value converters, relational rows and
/// document-store documents. A document is simply a `Value::Object` whose
/// embedded entities are nested objects and whose embedded collections are
/// arrays of objects.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Double-precision float. NaN is rejected by the encoder.
    Float(f64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Array of values.
    Array(Vec<Value>),
    /// Property bag with text keys, in insertion order.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Creates an object value from key/value pairs.
    ///
    /// Later duplicates of a key replace earlier ones.
    pub fn object<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut object = Value::Object(Vec::new());
        for (key, value) in pairs {
            object.set(key, value);
        }
        object
    }

    /// Creates an empty object.
    #[must_use]
    pub fn empty_object() -> Self {
        Value::Object(Vec::new())
    }

    /// Creates an array value from anything convertible to values.
    pub fn array<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// Returns the name of this value's kind, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float. Integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a mutable array, if it is one.
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get the entries of this object, if it is one.
    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Returns `true` for `Value::Object`.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Look up a key in this object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Look up a key in this object for mutation.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Value::Object(pairs) => pairs.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Follows a chain of object keys, e.g. `["Address", "City"]`.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        path.iter()
            .try_fold(self, |current, segment| current.get(segment.as_ref()))
    }

    /// Sets a key on this object, returning the previous value.
    ///
    /// Has no effect on non-object values.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let Value::Object(pairs) = self else {
            return None;
        };
        let key = key.into();
        let value = value.into();
        match pairs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                pairs.push((key, value));
                None
            }
        }
    }

    /// Removes a key from this object.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let Value::Object(pairs) = self else {
            return None;
        };
        let position = pairs.iter().position(|(k, _)| k == key)?;
        Some(pairs.remove(position).1)
    }

    /// Compares two scalar values.
    ///
    /// Integers and floats compare numerically with each other. Values of
    /// unrelated kinds, nulls, arrays and objects are unordered (`None`).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                self.as_float()?.partial_cmp(&other.as_float()?)
            }
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality used by query evaluation: numeric kinds compare by value,
    /// everything else structurally.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match crate::json::to_json_string(self) {
            Ok(text) => f.write_str(&text),
            // non-finite floats render as null
            Err(_) => write!(f, "{}", crate::json::to_json(self)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_set_replaces_existing_key() {
        let mut doc = Value::object([("id", Value::from("1")), ("Name", Value::from("Rex"))]);
        let previous = doc.set("Name", "Fido");
        assert_eq!(previous, Some(Value::from("Rex")));
        assert_eq!(doc.get("Name"), Some(&Value::from("Fido")));
        assert_eq!(doc.as_object().map(<[_]>::len), Some(2));
    }

    #[test]
    fn object_preserves_insertion_order() {
        let doc = Value::object([("z", 1), ("a", 2), ("m", 3)]);
        let keys: Vec<&str> = doc
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn nested_path_lookup() {
        let doc = Value::object([(
            "Address",
            Value::object([("City", "Oslo"), ("Zip", "0150")]),
        )]);
        assert_eq!(doc.get_path(&["Address", "City"]), Some(&Value::from("Oslo")));
        assert_eq!(doc.get_path(&["Address", "Street"]), None);
        assert_eq!(doc.get_path(&["Missing", "City"]), None);
    }

    #[test]
    fn remove_key() {
        let mut doc = Value::object([("a", 1), ("b", 2)]);
        assert_eq!(doc.remove("a"), Some(Value::Integer(1)));
        assert_eq!(doc.remove("a"), None);
        assert_eq!(doc.get("b"), Some(&Value::Integer(2)));
    }

    #[test]
    fn set_on_non_object_is_ignored() {
        let mut value = Value::Integer(3);
        assert_eq!(value.set("a", 1), None);
        assert_eq!(value, Value::Integer(3));
    }

    #[test]
    fn numeric_comparison_crosses_kinds() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert!(Value::Integer(3).loose_eq(&Value::Float(3.0)));
        assert!(!Value::Integer(3).loose_eq(&Value::Text("3".into())));
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn value_accessors() {
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(true).is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::Integer(42).as_float(), Some(42.0));
        assert_eq!(Value::Text("hello".into()).as_text(), Some("hello"));
        assert_eq!(Value::Bytes(vec![1, 2, 3]).as_bytes(), Some(&[1, 2, 3][..]));
        assert_eq!(Value::Integer(1).type_name(), "integer");
    }

    #[test]
    fn from_impls() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Integer(42));
        assert_eq!(Value::from(1.5), Value::Float(1.5));
        assert_eq!(Value::from("hello"), Value::Text("hello".to_string()));
        assert_eq!(Value::from(vec![1u8, 2, 3]), Value::Bytes(vec![1, 2, 3]));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(7i64)), Value::Integer(7));
        assert_eq!(Value::from(()), Value::Null);
    }
}
