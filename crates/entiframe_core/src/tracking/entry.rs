//! Tracked entries.

use crate::types::{EntityTypeId, EntryId, ForeignKeyId};
use entiframe_codec::Value;
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Tracked, matches the store.
    Unchanged,
    /// Tracked, will be inserted.
    Added,
    /// Tracked, has modified properties.
    Modified,
    /// Tracked, will be deleted.
    Deleted,
}

impl EntityState {
    /// Whether a save has work to do for this state.
    #[must_use]
    pub fn needs_save(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }
}

/// One tracked entity instance.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) id: EntryId,
    pub(crate) entity_type: EntityTypeId,
    pub(crate) state: EntityState,
    pub(crate) current: Vec<Value>,
    pub(crate) original: Vec<Value>,
    pub(crate) modified: Vec<bool>,
    pub(crate) temporary: Vec<bool>,
    /// Owned dependents by navigation index. A missing key is a null navigation.
    pub(crate) owned: BTreeMap<usize, Vec<EntryId>>,
    /// Owning entry and the owner's navigation index.
    pub(crate) owner: Option<(EntryId, usize)>,
    pub(crate) principals: BTreeMap<ForeignKeyId, EntryId>,
    pub(crate) shared_identity: Option<EntryId>,
    /// Last document read from or written to the store.
    pub(crate) document: Option<Value>,
}

impl Entry {
    pub(crate) fn new(
        id: EntryId,
        entity_type: EntityTypeId,
        state: EntityState,
        current: Vec<Value>,
    ) -> Self {
        let width = current.len();
        Self {
            id,
            entity_type,
            state,
            original: current.clone(),
            current,
            modified: vec![false; width],
            temporary: vec![false; width],
            owned: BTreeMap::new(),
            owner: None,
            principals: BTreeMap::new(),
            shared_identity: None,
            document: None,
        }
    }

    /// Entry id.
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Concrete entity type.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Current value of a property.
    #[must_use]
    pub fn current_value(&self, property: usize) -> &Value {
        self.current.get(property).unwrap_or(&NULL)
    }

    /// All current values, indexed like the entity type's properties.
    #[must_use]
    pub fn current_values(&self) -> &[Value] {
        &self.current
    }

    /// Value of a property when the entry was last accepted.
    #[must_use]
    pub fn original_value(&self, property: usize) -> &Value {
        self.original.get(property).unwrap_or(&NULL)
    }

    /// Whether a property was modified since the entry was last accepted.
    #[must_use]
    pub fn is_modified(&self, property: usize) -> bool {
        self.modified.get(property).copied().unwrap_or(false)
    }

    /// Whether a property holds a temporary value awaiting generation.
    #[must_use]
    pub fn is_temporary(&self, property: usize) -> bool {
        self.temporary.get(property).copied().unwrap_or(false)
    }

    /// Whether any property holds a temporary value.
    #[must_use]
    pub fn has_temporary_values(&self) -> bool {
        self.temporary.iter().any(|t| *t)
    }

    /// Owned dependents through a navigation; `None` when the navigation is null.
    #[must_use]
    pub fn owned_entries(&self, navigation: usize) -> Option<&[EntryId]> {
        self.owned.get(&navigation).map(Vec::as_slice)
    }

    /// Owning entry and the owner's navigation index.
    #[must_use]
    pub fn owner(&self) -> Option<(EntryId, usize)> {
        self.owner
    }

    /// Principal entry through a foreign key.
    #[must_use]
    pub fn principal(&self, foreign_key: ForeignKeyId) -> Option<EntryId> {
        self.principals.get(&foreign_key).copied()
    }

    /// All principal links.
    pub fn principals(&self) -> impl Iterator<Item = (ForeignKeyId, EntryId)> + '_ {
        self.principals.iter().map(|(fk, entry)| (*fk, *entry))
    }

    /// Another entry mapped to the same store object.
    #[must_use]
    pub fn shared_identity(&self) -> Option<EntryId> {
        self.shared_identity
    }

    /// The raw document snapshot.
    #[must_use]
    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }
}
