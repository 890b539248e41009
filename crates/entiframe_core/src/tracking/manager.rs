//! The state manager.

use crate::error::{CoreError, CoreResult};
use crate::metadata::{EntityKey, EntityType, Model, ValueGenerated, ValueKind};
use crate::query::{EntityInstance, OwnedValue};
use crate::tracking::entry::{EntityState, Entry};
use crate::types::{EntityTypeId, EntryId};
use entiframe_codec::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Tracks entity instances for one session.
///
/// The state manager owns every tracked [`Entry`], resolves identities
/// through an identity map keyed by hierarchy root and [`EntityKey`], and
/// keeps foreign key values of dependents in step with their principals'
/// keys. It is not synchronized; a session serializes access to it.
#[derive(Debug)]
pub struct StateManager {
    model: Arc<Model>,
    entries: BTreeMap<EntryId, Entry>,
    identity: HashMap<(EntityTypeId, EntityKey), EntryId>,
    next_entry: u64,
    next_temporary: i64,
}

impl StateManager {
    /// Creates an empty state manager.
    #[must_use]
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            entries: BTreeMap::new(),
            identity: HashMap::new(),
            next_entry: 1,
            next_temporary: -1,
        }
    }

    /// The model entries are tracked against.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All tracked entries in tracking order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// A tracked entry.
    pub fn entry(&self, id: EntryId) -> CoreResult<&Entry> {
        self.entries
            .get(&id)
            .ok_or_else(|| CoreError::invalid_operation(format!("{id} is not tracked")))
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> CoreResult<&mut Entry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::invalid_operation(format!("{id} is not tracked")))
    }

    /// The entity type of a tracked entry.
    pub fn entity_type_of(&self, id: EntryId) -> CoreResult<&EntityType> {
        let entity_type = self.entry(id)?.entity_type;
        Ok(self.model.entity_type(entity_type))
    }

    /// Entries with pending changes, in tracking order.
    #[must_use]
    pub fn entries_to_save(&self) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| e.state.needs_save())
            .map(|e| e.id)
            .collect()
    }

    /// Whether any entry has pending changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries.values().any(|e| e.state.needs_save())
    }

    /// Starts tracking a new entity to be inserted.
    ///
    /// Key properties generated on add receive temporary values.
    pub fn add<S, V>(
        &mut self,
        entity_type: EntityTypeId,
        values: impl IntoIterator<Item = (S, V)>,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        self.track_root(entity_type, values, EntityState::Added)
    }

    /// Starts tracking an existing entity as unchanged.
    pub fn attach<S, V>(
        &mut self,
        entity_type: EntityTypeId,
        values: impl IntoIterator<Item = (S, V)>,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        self.track_root(entity_type, values, EntityState::Unchanged)
    }

    fn track_root<S, V>(
        &mut self,
        entity_type: EntityTypeId,
        values: impl IntoIterator<Item = (S, V)>,
        state: EntityState,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(entity_type);
        if ty.is_owned() {
            return Err(CoreError::invalid_operation(format!(
                "owned type '{}' must be tracked through its owner",
                ty.name()
            )));
        }
        let current = initial_values(ty, values)?;
        let id = self.insert_entry(ty, current, state);
        self.register_identity(id)?;
        debug!(entry = %id, entity_type = %ty.name(), state = ?state, "entity tracked");
        Ok(id)
    }

    /// Adds an owned dependent through an ownership navigation of `owner`.
    ///
    /// Replacing the dependent of a reference navigation deletes the previous
    /// one; when both map to the same key they become a shared identity pair.
    pub fn add_owned<S, V>(
        &mut self,
        owner: EntryId,
        navigation: &str,
        values: impl IntoIterator<Item = (S, V)>,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        self.track_owned(owner, navigation, values, EntityState::Added)
    }

    /// Attaches an existing owned dependent as unchanged.
    pub fn attach_owned<S, V>(
        &mut self,
        owner: EntryId,
        navigation: &str,
        values: impl IntoIterator<Item = (S, V)>,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        self.track_owned(owner, navigation, values, EntityState::Unchanged)
    }

    fn track_owned<S, V>(
        &mut self,
        owner: EntryId,
        navigation: &str,
        values: impl IntoIterator<Item = (S, V)>,
        state: EntityState,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let model = Arc::clone(&self.model);
        let owner_entry = self.entry(owner)?;
        if owner_entry.state == EntityState::Deleted {
            return Err(CoreError::invalid_operation(format!(
                "{owner} is deleted and cannot own new entities"
            )));
        }
        let owner_type = model.entity_type(owner_entry.entity_type);
        let nav_index = owner_type.find_navigation(navigation).ok_or_else(|| {
            CoreError::mapping(owner_type.name(), format!("no navigation named '{navigation}'"))
        })?;
        let nav = &owner_type.navigations()[nav_index];
        let fk = model.foreign_key(nav.foreign_key());
        if !fk.is_ownership() || nav.is_on_dependent() {
            return Err(CoreError::invalid_operation(format!(
                "'{}.{navigation}' is not an ownership navigation",
                owner_type.name()
            )));
        }
        let ty = model.entity_type(nav.target());
        let mut current = initial_values(ty, values)?;
        let mut inherited_temporary = Vec::new();
        for (&dependent_property, &principal_property) in
            fk.properties().iter().zip(fk.principal_properties())
        {
            current[dependent_property] = owner_entry.current_value(principal_property).clone();
            if owner_entry.is_temporary(principal_property) {
                inherited_temporary.push(dependent_property);
            }
        }
        let siblings = owner_entry.owned_entries(nav_index).map_or(0, <[_]>::len);

        if let Some(ordinal) = ty.ordinal_key_property() {
            if state == EntityState::Unchanged && current[ordinal].is_null() {
                current[ordinal] = Value::Integer(i64::try_from(siblings + 1).unwrap_or(i64::MAX));
            }
        }

        if !nav.is_collection() {
            let previous: Vec<EntryId> = self
                .entry(owner)?
                .owned_entries(nav_index)
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            for dependent in previous {
                self.orphan(dependent)?;
            }
        }

        let id = self.insert_entry(ty, current, state);
        {
            let entry = self.entry_mut(id)?;
            entry.owner = Some((owner, nav_index));
            entry.principals.insert(fk.id(), owner);
            for property in inherited_temporary {
                entry.temporary[property] = true;
            }
        }
        self.entry_mut(owner)?
            .owned
            .entry(nav_index)
            .or_default()
            .push(id);
        self.register_identity(id)?;
        trace!(entry = %id, owner = %owner, navigation, state = ?state, "owned entity tracked");
        Ok(id)
    }

    /// Detaches or deletes an owned dependent that was replaced.
    fn orphan(&mut self, dependent: EntryId) -> CoreResult<()> {
        self.unlink_from_owner(dependent)?;
        self.remove(dependent)
    }

    fn unlink_from_owner(&mut self, id: EntryId) -> CoreResult<()> {
        let Some((owner, nav_index)) = self.entry(id)?.owner else {
            return Ok(());
        };
        if let Some(owner_entry) = self.entries.get_mut(&owner) {
            if let Some(list) = owner_entry.owned.get_mut(&nav_index) {
                list.retain(|e| *e != id);
                let is_collection = self
                    .model
                    .entity_type(owner_entry.entity_type)
                    .navigations()
                    .get(nav_index)
                    .is_some_and(|n| n.is_collection());
                if !is_collection && list.is_empty() {
                    owner_entry.owned.remove(&nav_index);
                }
            }
        }
        Ok(())
    }

    /// Marks an entity for deletion, cascading to owned dependents.
    ///
    /// Entities that were only added are detached instead.
    pub fn remove(&mut self, id: EntryId) -> CoreResult<()> {
        let state = self.entry(id)?.state;
        if self.entry(id)?.owner.is_some() {
            self.unlink_from_owner(id)?;
        }
        let dependents: Vec<EntryId> = self
            .entry(id)?
            .owned
            .values()
            .flatten()
            .copied()
            .collect();
        match state {
            EntityState::Added => {
                for dependent in dependents {
                    self.remove(dependent)?;
                }
                self.detach(id);
            }
            EntityState::Unchanged | EntityState::Modified => {
                for dependent in dependents {
                    self.remove(dependent)?;
                }
                // dependents keep their owner link so a save can find the deleted subtree
                self.entry_mut(id)?.state = EntityState::Deleted;
                trace!(entry = %id, "entity marked deleted");
            }
            EntityState::Deleted | EntityState::Detached => {}
        }
        Ok(())
    }

    fn detach(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.identity.retain(|_, mapped| *mapped != id);
        if let Some(partner) = entry.shared_identity {
            if let Some(partner_entry) = self.entries.get_mut(&partner) {
                partner_entry.shared_identity = None;
                if partner_entry.state == EntityState::Deleted {
                    if let Ok(Some(key)) = self
                        .model
                        .entity_type(partner_entry.entity_type)
                        .create_key(&partner_entry.current)
                    {
                        let root = self.model.entity_type(partner_entry.entity_type).root_type();
                        self.identity.insert((root, key), partner);
                    }
                }
            }
        }
        trace!(entry = %id, "entity detached");
    }

    /// Sets a property's current value.
    pub fn set_value(&mut self, id: EntryId, property: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        let model = Arc::clone(&self.model);
        let entry = self.entry(id)?;
        let ty = model.entity_type(entry.entity_type);
        let index = ty.property_index(property)?;
        let definition = &ty.properties()[index];
        if entry.state == EntityState::Deleted {
            return Err(CoreError::invalid_operation(format!("{id} is deleted")));
        }
        if definition.is_key() && entry.state != EntityState::Added && entry.current[index] != value {
            return Err(CoreError::invalid_operation(format!(
                "key property '{}.{property}' of a persisted entity cannot change",
                ty.name()
            )));
        }
        if value.is_null() && !definition.is_nullable() && !definition.is_key() {
            return Err(CoreError::invalid_operation(format!(
                "'{}.{property}' does not accept null",
                ty.name()
            )));
        }

        let old_key = ty.create_key(&entry.current)?;
        let entry = self.entry_mut(id)?;
        let changed = entry.current[index] != value;
        entry.current[index] = value;
        entry.temporary[index] = false;
        if changed && matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
            entry.modified[index] = true;
            entry.state = EntityState::Modified;
        }
        if definition.is_key() {
            self.rekey(id, old_key)?;
        }
        self.fix_up_dependents(id, index)
    }

    /// Points a dependent's reference navigation at a principal, or clears it.
    pub fn set_reference(
        &mut self,
        dependent: EntryId,
        navigation: &str,
        principal: Option<EntryId>,
    ) -> CoreResult<()> {
        let model = Arc::clone(&self.model);
        let entry = self.entry(dependent)?;
        let ty = model.entity_type(entry.entity_type);
        let nav_index = ty.find_navigation(navigation).ok_or_else(|| {
            CoreError::mapping(ty.name(), format!("no navigation named '{navigation}'"))
        })?;
        let nav = &ty.navigations()[nav_index];
        if !nav.is_on_dependent() {
            return Err(CoreError::invalid_operation(format!(
                "'{}.{navigation}' is not a reference to a principal",
                ty.name()
            )));
        }
        let fk = model.foreign_key(nav.foreign_key());

        let assignments: Vec<(usize, Value, bool)> = match principal {
            Some(principal) => {
                let principal_entry = self.entry(principal)?;
                let principal_type = model.entity_type(fk.principal());
                if !principal_type.is_assignable_from(principal_entry.entity_type) {
                    return Err(CoreError::invalid_operation(format!(
                        "{principal} is not a '{}'",
                        principal_type.name()
                    )));
                }
                fk.properties()
                    .iter()
                    .zip(fk.principal_properties())
                    .map(|(&d, &p)| {
                        (
                            d,
                            principal_entry.current_value(p).clone(),
                            principal_entry.is_temporary(p),
                        )
                    })
                    .collect()
            }
            None => {
                if fk.is_required() {
                    return Err(CoreError::invalid_operation(format!(
                        "'{}.{navigation}' is required",
                        ty.name()
                    )));
                }
                fk.properties().iter().map(|&d| (d, Value::Null, false)).collect()
            }
        };

        let entry = self.entry_mut(dependent)?;
        for (property, value, temporary) in assignments {
            if entry.current[property] != value
                && matches!(entry.state, EntityState::Unchanged | EntityState::Modified)
            {
                entry.modified[property] = true;
                entry.state = EntityState::Modified;
            }
            entry.current[property] = value;
            entry.temporary[property] = temporary;
        }
        match principal {
            Some(principal) => entry.principals.insert(fk.id(), principal),
            None => entry.principals.remove(&fk.id()),
        };
        Ok(())
    }

    /// Writes back a value generated by the store and propagates it into
    /// dependents' foreign keys.
    pub fn set_store_generated(&mut self, id: EntryId, property: usize, value: Value) -> CoreResult<()> {
        self.write_value(id, property, value, false)
    }

    /// Assigns a temporary value that a later save replaces.
    pub fn set_temporary_value(&mut self, id: EntryId, property: usize, value: Value) -> CoreResult<()> {
        self.write_value(id, property, value, true)
    }

    fn write_value(&mut self, id: EntryId, property: usize, value: Value, temporary: bool) -> CoreResult<()> {
        let model = Arc::clone(&self.model);
        let entry = self.entry(id)?;
        let ty = model.entity_type(entry.entity_type);
        let is_key = ty.property(property).is_some_and(|p| p.is_key());
        let old_key = if is_key { ty.create_key(&entry.current)? } else { None };

        let entry = self.entry_mut(id)?;
        if property >= entry.current.len() {
            return Err(CoreError::invalid_operation(format!(
                "property {property} out of range for {id}"
            )));
        }
        entry.current[property] = value;
        entry.temporary[property] = temporary;
        if is_key {
            self.rekey(id, old_key)?;
        }
        self.fix_up_dependents(id, property)
    }

    /// Copies a principal key value into every dependent's foreign key.
    fn fix_up_dependents(&mut self, principal: EntryId, property: usize) -> CoreResult<()> {
        let model = Arc::clone(&self.model);
        let source = self.entry(principal)?;
        let value = source.current_value(property).clone();
        let temporary = source.is_temporary(property);

        let mut targets: Vec<(EntryId, usize)> = Vec::new();
        for entry in self.entries.values() {
            for (fk_id, linked) in &entry.principals {
                if *linked != principal {
                    continue;
                }
                let fk = model.foreign_key(*fk_id);
                for (&dependent_property, &principal_property) in
                    fk.properties().iter().zip(fk.principal_properties())
                {
                    if principal_property == property {
                        targets.push((entry.id, dependent_property));
                    }
                }
            }
        }

        for (dependent, dependent_property) in targets {
            let entry = self.entry(dependent)?;
            if entry.current_value(dependent_property) == &value
                && entry.is_temporary(dependent_property) == temporary
            {
                continue;
            }
            let ty = model.entity_type(entry.entity_type);
            let is_key = ty.property(dependent_property).is_some_and(|p| p.is_key());
            let old_key = if is_key { ty.create_key(&entry.current)? } else { None };
            let entry = self.entry_mut(dependent)?;
            entry.current[dependent_property] = value.clone();
            entry.temporary[dependent_property] = temporary;
            if matches!(entry.state, EntityState::Unchanged | EntityState::Modified)
                && entry.original[dependent_property] != value
            {
                entry.modified[dependent_property] = true;
                entry.state = EntityState::Modified;
            }
            if is_key {
                self.rekey(dependent, old_key)?;
            }
            self.fix_up_dependents(dependent, dependent_property)?;
        }
        Ok(())
    }

    fn insert_entry(&mut self, ty: &EntityType, mut current: Vec<Value>, state: EntityState) -> EntryId {
        let id = EntryId::new(self.next_entry);
        self.next_entry += 1;

        let mut temporary = vec![false; current.len()];
        if state == EntityState::Added {
            for (index, property) in ty.properties().iter().enumerate() {
                if property.value_generated() != ValueGenerated::OnAdd || !current[index].is_null() {
                    continue;
                }
                match property.kind() {
                    ValueKind::Integer => {
                        current[index] = Value::Integer(self.next_temporary);
                        self.next_temporary -= 1;
                        temporary[index] = true;
                    }
                    ValueKind::Guid => {
                        current[index] = Value::Bytes(uuid::Uuid::new_v4().as_bytes().to_vec());
                    }
                    _ => {}
                }
            }
        }

        let mut entry = Entry::new(id, ty.id(), state, current);
        entry.temporary = temporary;
        self.entries.insert(id, entry);
        id
    }

    fn register_identity(&mut self, id: EntryId) -> CoreResult<()> {
        let entry = self.entry(id)?;
        let ty = self.model.entity_type(entry.entity_type);
        let Some(key) = ty.create_key(&entry.current)? else {
            if entry.state == EntityState::Added {
                return Ok(());
            }
            let name = ty.name().to_string();
            self.entries.remove(&id);
            return Err(CoreError::invalid_operation(format!(
                "cannot track '{name}' with a null key"
            )));
        };
        let slot = (ty.root_type(), key);
        let state = entry.state;

        match self.identity.get(&slot).copied() {
            None => {
                self.identity.insert(slot, id);
                Ok(())
            }
            Some(existing) => {
                let existing_state = self.entry(existing)?.state;
                if existing_state == EntityState::Deleted && state == EntityState::Added {
                    self.entry_mut(existing)?.shared_identity = Some(id);
                    self.entry_mut(id)?.shared_identity = Some(existing);
                    self.identity.insert(slot, id);
                    debug!(added = %id, deleted = %existing, "shared identity detected");
                    Ok(())
                } else {
                    let name = self.model.entity_type(self.entry(id)?.entity_type).name().to_string();
                    self.entries.remove(&id);
                    if let Some((owner, nav)) = self.entries.values().find_map(|e| {
                        e.owned
                            .iter()
                            .find(|(_, list)| list.contains(&id))
                            .map(|(nav, _)| (e.id, *nav))
                    }) {
                        if let Some(list) = self.entries.get_mut(&owner).and_then(|o| o.owned.get_mut(&nav)) {
                            list.retain(|e| *e != id);
                        }
                    }
                    Err(CoreError::invalid_operation(format!(
                        "another '{name}' with the same key is already tracked as {existing}"
                    )))
                }
            }
        }
    }

    fn rekey(&mut self, id: EntryId, old_key: Option<EntityKey>) -> CoreResult<()> {
        let entry = self.entry(id)?;
        let ty = self.model.entity_type(entry.entity_type);
        let root = ty.root_type();
        let new_key = ty.create_key(&entry.current)?;
        if let Some(old_key) = old_key {
            let slot = (root, old_key);
            if self.identity.get(&slot) == Some(&id) {
                self.identity.remove(&slot);
            }
        }
        if let Some(new_key) = new_key {
            // a deleted or not yet renumbered sibling may still hold the slot
            self.identity.insert((root, new_key), id);
        }
        Ok(())
    }

    /// Finds a tracked entity by key values.
    pub fn find(&self, entity_type: EntityTypeId, key_values: &[Value]) -> CoreResult<Option<EntryId>> {
        let ty = self.model.entity_type(entity_type);
        let mut values = vec![Value::Null; ty.properties().len()];
        for (&index, value) in ty.primary_key().iter().zip(key_values) {
            values[index] = value.clone();
        }
        self.lookup(ty, &values)
    }

    fn lookup(&self, ty: &EntityType, values: &[Value]) -> CoreResult<Option<EntryId>> {
        Ok(ty
            .create_key(values)?
            .and_then(|key| self.identity.get(&(ty.root_type(), key)).copied()))
    }

    /// Tracks an entity read from the store, resolving it against the
    /// identity map.
    ///
    /// Returns the entry and whether it was newly tracked. An already tracked
    /// instance keeps its current values.
    pub fn track_queried(
        &mut self,
        entity_type: EntityTypeId,
        values: Vec<Value>,
        document: Option<Value>,
    ) -> CoreResult<(EntryId, bool)> {
        let model = Arc::clone(&self.model);
        let ty = model.entity_type(entity_type);
        if let Some(existing) = self.lookup(ty, &values)? {
            return Ok((existing, false));
        }
        let id = self.insert_entry(ty, values, EntityState::Unchanged);
        self.entry_mut(id)?.document = document;
        self.register_identity(id)?;
        Ok((id, true))
    }

    /// Links a freshly queried owned entry to its owner.
    pub(crate) fn link_owned(&mut self, owner: EntryId, navigation: usize, dependent: EntryId) -> CoreResult<()> {
        let owner_type = self.entity_type_of(owner)?;
        let fk = owner_type
            .navigations()
            .get(navigation)
            .map(|n| n.foreign_key())
            .ok_or_else(|| CoreError::invalid_operation("navigation index out of range"))?;
        {
            let entry = self.entry_mut(dependent)?;
            entry.owner = Some((owner, navigation));
            entry.principals.insert(fk, owner);
        }
        let list = self.entry_mut(owner)?.owned.entry(navigation).or_default();
        if !list.contains(&dependent) {
            list.push(dependent);
        }
        Ok(())
    }

    /// Marks an owned navigation as present but empty.
    pub(crate) fn touch_navigation(&mut self, owner: EntryId, navigation: usize) -> CoreResult<()> {
        self.entry_mut(owner)?.owned.entry(navigation).or_default();
        Ok(())
    }

    /// Replaces an entry's document snapshot.
    pub fn set_document(&mut self, id: EntryId, document: Option<Value>) -> CoreResult<()> {
        self.entry_mut(id)?.document = document;
        Ok(())
    }

    /// Compares current and original values of unchanged and modified entries.
    pub fn detect_changes(&mut self) {
        for entry in self.entries.values_mut() {
            if !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
                continue;
            }
            let mut any = false;
            for index in 0..entry.current.len() {
                let modified = entry.current[index] != entry.original[index];
                entry.modified[index] = modified;
                any |= modified;
            }
            entry.state = if any {
                EntityState::Modified
            } else {
                EntityState::Unchanged
            };
        }
    }

    /// Marks an entry as persisted.
    ///
    /// Added and modified entries become unchanged; deleted entries are
    /// detached.
    pub fn accept_changes(&mut self, id: EntryId) -> CoreResult<()> {
        if self.entry(id)?.state == EntityState::Deleted {
            self.unlink_from_owner(id)?;
            self.detach(id);
        } else {
            let entry = self.entry_mut(id)?;
            entry.state = EntityState::Unchanged;
            entry.original = entry.current.clone();
            entry.modified.iter_mut().for_each(|m| *m = false);
            entry.temporary.iter_mut().for_each(|t| *t = false);
            entry.shared_identity = None;
        }
        Ok(())
    }

    /// Accepts every listed entry; untracked ids are skipped.
    pub fn accept_all(&mut self, ids: &[EntryId]) -> CoreResult<()> {
        for id in ids {
            if self.entries.contains_key(id) {
                self.accept_changes(*id)?;
            }
        }
        Ok(())
    }

    /// Walks owner links up to the entry that owns a store object.
    pub fn document_root_of(&self, id: EntryId) -> CoreResult<EntryId> {
        let mut current = self.entry(id)?;
        while !self.model.entity_type(current.entity_type).is_document_root() {
            match current.owner {
                Some((owner, _)) => current = self.entry(owner)?,
                None => break,
            }
        }
        Ok(current.id)
    }

    /// Snapshot of an entity and its owned dependents.
    pub fn instance(&self, id: EntryId) -> CoreResult<EntityInstance> {
        let entry = self.entry(id)?;
        let ty = self.model.entity_type(entry.entity_type);
        let values = ty
            .properties()
            .iter()
            .zip(&entry.current)
            .map(|(p, v)| (p.name().to_string(), v.clone()))
            .collect();
        let mut owned = Vec::new();
        for (index, navigation) in ty.navigations().iter().enumerate() {
            if navigation.is_on_dependent()
                || !self.model.foreign_key(navigation.foreign_key()).is_ownership()
            {
                continue;
            }
            let dependents = entry.owned_entries(index).unwrap_or_default();
            let value = if navigation.is_collection() {
                OwnedValue::Many(
                    dependents
                        .iter()
                        .map(|d| self.instance(*d))
                        .collect::<CoreResult<_>>()?,
                )
            } else {
                OwnedValue::One(match dependents.first() {
                    Some(d) => Some(Box::new(self.instance(*d)?)),
                    None => None,
                })
            };
            owned.push((navigation.name().to_string(), value));
        }
        Ok(EntityInstance {
            entity_type: ty.name().to_string(),
            entry: Some(id),
            values,
            owned,
        })
    }
}

/// Builds the initial value vector for a new entry.
fn initial_values<S, V>(
    ty: &EntityType,
    values: impl IntoIterator<Item = (S, V)>,
) -> CoreResult<Vec<Value>>
where
    S: AsRef<str>,
    V: Into<Value>,
{
    if ty.is_abstract() {
        return Err(CoreError::mapping(ty.name(), "abstract types cannot be instantiated"));
    }
    let mut current = vec![Value::Null; ty.properties().len()];
    for (name, value) in values {
        let index = ty.property_index(name.as_ref())?;
        current[index] = value.into();
    }
    if let (Some(index), Some(value)) = (ty.discriminator_property(), ty.discriminator_value()) {
        if current[index].is_null() {
            current[index] = value.clone();
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, ForeignKeyBuilder, ModelBuilder, PropertyBuilder};

    fn model() -> Arc<Model> {
        ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Customer")
                    .property_with(
                        PropertyBuilder::new("Id", ValueKind::Integer).generated(ValueGenerated::OnAdd),
                    )
                    .property("Name", ValueKind::Text)
                    .key(["Id"]),
            )
            .owns_one(
                "Customer",
                "Address",
                EntityTypeBuilder::new("Address").property("City", ValueKind::Text),
            )
            .owns_many(
                "Customer",
                "Tags",
                EntityTypeBuilder::new("Tag").property("Label", ValueKind::Text),
            )
            .entity(
                EntityTypeBuilder::new("Order")
                    .property_with(
                        PropertyBuilder::new("Id", ValueKind::Integer).generated(ValueGenerated::OnAdd),
                    )
                    .property_with(PropertyBuilder::new("CustomerId", ValueKind::Integer).nullable())
                    .key(["Id"]),
            )
            .foreign_key(
                ForeignKeyBuilder::new("Order", "Customer", ["CustomerId"])
                    .dependent_navigation("Customer"),
            )
            .build()
            .unwrap()
    }

    fn type_id(model: &Model, name: &str) -> EntityTypeId {
        model.find_entity_type(name).unwrap().id()
    }

    #[test]
    fn added_entities_get_temporary_keys() {
        let model = model();
        let mut state = StateManager::new(Arc::clone(&model));
        let a = state.add(type_id(&model, "Customer"), [("Name", "Ann")]).unwrap();
        let b = state.add(type_id(&model, "Customer"), [("Name", "Bob")]).unwrap();
        let a_entry = state.entry(a).unwrap();
        assert_eq!(a_entry.current_value(0), &Value::Integer(-1));
        assert!(a_entry.is_temporary(0));
        assert_eq!(state.entry(b).unwrap().current_value(0), &Value::Integer(-2));
        assert_eq!(state.entries_to_save(), vec![a, b]);
    }

    #[test]
    fn identity_resolution() {
        let model = model();
        let customer = type_id(&model, "Customer");
        let mut state = StateManager::new(Arc::clone(&model));
        let attached = state
            .attach(customer, [("Id", Value::from(5)), ("Name", Value::from("Ann"))])
            .unwrap();
        let (resolved, is_new) = state
            .track_queried(
                customer,
                vec![Value::Integer(5), Value::from("Changed"), Value::from("Customer")],
                None,
            )
            .unwrap();
        assert_eq!(resolved, attached);
        assert!(!is_new);
        assert_eq!(state.find(customer, &[Value::Integer(5)]).unwrap(), Some(attached));

        let duplicate = state.attach(customer, [("Id", 5)]);
        assert!(matches!(duplicate, Err(CoreError::InvalidOperation { .. })));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn store_generated_key_propagates_to_dependents() {
        let model = model();
        let mut state = StateManager::new(Arc::clone(&model));
        let customer = state.add(type_id(&model, "Customer"), [("Name", "Ann")]).unwrap();
        let address = state.add_owned(customer, "Address", [("City", "Oslo")]).unwrap();
        let order = state.add(type_id(&model, "Order"), Vec::<(&str, Value)>::new()).unwrap();
        state.set_reference(order, "Customer", Some(customer)).unwrap();

        assert!(state.entry(address).unwrap().is_temporary(0));
        assert!(state.entry(order).unwrap().is_temporary(1));

        state.set_store_generated(customer, 0, Value::Integer(42)).unwrap();
        assert_eq!(state.entry(address).unwrap().current_value(0), &Value::Integer(42));
        assert!(!state.entry(address).unwrap().is_temporary(0));
        assert_eq!(state.entry(order).unwrap().current_value(1), &Value::Integer(42));
        assert_eq!(
            state.find(type_id(&model, "Address"), &[Value::Integer(42)]).unwrap(),
            Some(address)
        );
    }

    #[test]
    fn modification_tracking_and_detect_changes() {
        let model = model();
        let customer_type = type_id(&model, "Customer");
        let mut state = StateManager::new(Arc::clone(&model));
        let customer = state
            .attach(customer_type, [("Id", Value::from(1)), ("Name", Value::from("Ann"))])
            .unwrap();

        state.set_value(customer, "Name", "Anna").unwrap();
        assert_eq!(state.entry(customer).unwrap().state(), EntityState::Modified);
        assert!(state.entry(customer).unwrap().is_modified(1));

        state.set_value(customer, "Name", "Ann").unwrap();
        state.detect_changes();
        assert_eq!(state.entry(customer).unwrap().state(), EntityState::Unchanged);

        let err = state.set_value(customer, "Id", 2);
        assert!(matches!(err, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn replacing_owned_reference_creates_shared_identity() {
        let model = model();
        let customer_type = type_id(&model, "Customer");
        let mut state = StateManager::new(Arc::clone(&model));
        let customer = state.attach(customer_type, [("Id", 1)]).unwrap();
        let old = state.attach_owned(customer, "Address", [("City", "Oslo")]).unwrap();
        let new = state.add_owned(customer, "Address", [("City", "Bergen")]).unwrap();

        assert_eq!(state.entry(old).unwrap().state(), EntityState::Deleted);
        assert_eq!(state.entry(old).unwrap().shared_identity(), Some(new));
        assert_eq!(state.entry(new).unwrap().shared_identity(), Some(old));
        let nav = model.entity_type(customer_type).find_navigation("Address").unwrap();
        assert_eq!(state.entry(customer).unwrap().owned_entries(nav), Some(&[new][..]));
    }

    #[test]
    fn remove_cascades_to_owned_and_accept_detaches() {
        let model = model();
        let customer_type = type_id(&model, "Customer");
        let mut state = StateManager::new(Arc::clone(&model));
        let customer = state.attach(customer_type, [("Id", 1)]).unwrap();
        let tag = state.attach_owned(customer, "Tags", [("Label", "vip")]).unwrap();
        // attached collection elements are numbered by position
        assert_eq!(state.entry(tag).unwrap().current_value(2), &Value::Integer(1));

        state.remove(customer).unwrap();
        assert_eq!(state.entry(tag).unwrap().state(), EntityState::Deleted);
        assert_eq!(state.document_root_of(tag).unwrap(), customer);

        let to_save = state.entries_to_save();
        state.accept_all(&to_save).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn removing_added_entity_detaches_it() {
        let model = model();
        let mut state = StateManager::new(Arc::clone(&model));
        let customer = state.add(type_id(&model, "Customer"), [("Name", "Ann")]).unwrap();
        state.add_owned(customer, "Tags", [("Label", "new")]).unwrap();
        state.remove(customer).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn instance_snapshot_includes_owned() {
        let model = model();
        let customer_type = type_id(&model, "Customer");
        let mut state = StateManager::new(Arc::clone(&model));
        let customer = state.attach(customer_type, [("Id", Value::from(1)), ("Name", Value::from("Ann"))]).unwrap();
        state.attach_owned(customer, "Address", [("City", "Oslo")]).unwrap();
        let instance = state.instance(customer).unwrap();
        assert_eq!(instance.get("Name"), Some(&Value::from("Ann")));
        assert_eq!(
            instance.owned_one("Address").and_then(|a| a.get("City")),
            Some(&Value::from("Oslo"))
        );
        assert!(instance.owned_many("Tags").is_empty());
    }
}
