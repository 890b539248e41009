//! Key shapes and the key factory registry.
//!
//! Every entity type's primary key is classified at model build time into a
//! closed set of shapes, and each shape is paired with a factory function that
//! turns key values into an [`EntityKey`]. Identity resolution then works on
//! opaque keys without inspecting the model.

use crate::error::CoreResult;
use entiframe_codec::{to_canonical_cbor, Value};
use std::fmt;

/// The shape of a primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShape {
    /// One key property, by property index.
    Single(usize),
    /// Several key properties, in key order.
    Composite(Vec<usize>),
}

impl KeyShape {
    /// Classifies a list of key property indices.
    #[must_use]
    pub fn from_properties(properties: &[usize]) -> Self {
        match properties {
            [single] => Self::Single(*single),
            many => Self::Composite(many.to_vec()),
        }
    }

    /// Property indices covered by the key.
    #[must_use]
    pub fn properties(&self) -> &[usize] {
        match self {
            Self::Single(index) => std::slice::from_ref(index),
            Self::Composite(indices) => indices,
        }
    }
}

/// Opaque identity of an entity within its hierarchy: canonical CBOR of its
/// key values.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(Vec<u8>);

impl EntityKey {
    /// The encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Builds a key from an entity's full value vector.
///
/// Returns `None` when any key value is null.
pub type KeyFactory = fn(&KeyShape, &[Value]) -> CoreResult<Option<EntityKey>>;

fn single_key(shape: &KeyShape, values: &[Value]) -> CoreResult<Option<EntityKey>> {
    let [index] = shape.properties() else {
        return Ok(None);
    };
    match values.get(*index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(EntityKey(to_canonical_cbor(value)?))),
    }
}

fn composite_key(shape: &KeyShape, values: &[Value]) -> CoreResult<Option<EntityKey>> {
    let mut parts = Vec::with_capacity(shape.properties().len());
    for index in shape.properties() {
        match values.get(*index) {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => parts.push(value.clone()),
        }
    }
    Ok(Some(EntityKey(to_canonical_cbor(&Value::Array(parts))?)))
}

/// Returns the factory registered for a key shape.
#[must_use]
pub fn key_factory(shape: &KeyShape) -> KeyFactory {
    match shape {
        KeyShape::Single(_) => single_key,
        KeyShape::Composite(_) => composite_key,
    }
}
