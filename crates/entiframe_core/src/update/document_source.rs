//! Builds and patches whole documents from tracked entries.

use crate::error::{CoreError, CoreResult};
use crate::metadata::{convert_to_provider, Model, ETAG_PROPERTY};
use crate::tracking::{EntityState, StateManager};
use crate::types::{EntityTypeId, EntryId};
use entiframe_codec::Value;
use std::sync::Arc;
use tracing::trace;

/// Writes tracked entries of one document root type as documents.
///
/// Owned dependents whose type is not a document root are embedded: a
/// reference as a nested object, a collection as an array whose element
/// positions stand in for the ordinal key.
#[derive(Debug, Clone)]
pub struct DocumentSource {
    entity_type: EntityTypeId,
    name: String,
    container: String,
    id_property: usize,
}

impl DocumentSource {
    /// Creates a source for a document root type.
    pub fn new(model: &Model, entity_type: EntityTypeId) -> CoreResult<Self> {
        let ty = model.entity_type(entity_type);
        if !ty.is_document_root() {
            return Err(CoreError::mapping(ty.name(), "embedded types have no document of their own"));
        }
        let container = ty
            .mapping()
            .container
            .clone()
            .ok_or_else(|| CoreError::mapping(ty.name(), "not mapped to a container"))?;
        let id_property = ty
            .id_property()
            .ok_or_else(|| CoreError::missing_id_property(ty.name()))?;
        Ok(Self {
            entity_type,
            name: ty.name().to_string(),
            container,
            id_property,
        })
    }

    /// The root type.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Container the documents live in.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The document id of `entry`.
    pub fn id(&self, state: &StateManager, entry: EntryId) -> CoreResult<String> {
        let entry = state.entry(entry)?;
        let ty = state.model().entity_type(entry.entity_type());
        let property = ty
            .property(self.id_property)
            .ok_or_else(|| CoreError::missing_id_property(&self.name))?;
        match convert_to_provider(property.converter(), entry.current_value(self.id_property))? {
            Value::Text(id) => Ok(id),
            Value::Integer(id) => Ok(id.to_string()),
            other => Err(CoreError::mapping(
                &self.name,
                format!("id value of kind {} cannot address a document", other.type_name()),
            )),
        }
    }

    /// Builds the full document for `entry` and its embedded dependents.
    ///
    /// Temporary ordinal keys of embedded collection elements receive their
    /// final 1-based positions.
    pub fn create_document(&self, state: &mut StateManager, entry: EntryId) -> CoreResult<Value> {
        create(state, entry, None)
    }

    /// Applies pending changes of `entry` to `document`.
    ///
    /// Returns `None` when nothing changed, so the write can be skipped.
    pub fn update_document(
        &self,
        state: &mut StateManager,
        document: &Value,
        entry: EntryId,
    ) -> CoreResult<Option<Value>> {
        update(state, document, entry, None)
    }
}

fn create(state: &mut StateManager, id: EntryId, ordinal: Option<usize>) -> CoreResult<Value> {
    let model = Arc::clone(state.model());
    let entry = state.entry(id)?;
    let ty = model.entity_type(entry.entity_type());
    let mut document = Value::empty_object();
    for (index, property) in ty.properties().iter().enumerate() {
        if let Some(name) = property.store_name() {
            if name != ETAG_PROPERTY {
                document.set(name, convert_to_provider(property.converter(), entry.current_value(index))?);
            }
        }
    }
    assign_ordinal(state, id, ordinal)?;
    write_navigations(state, &model, &mut document, id, None)?;
    Ok(document)
}

fn update(state: &mut StateManager, document: &Value, id: EntryId, ordinal: Option<usize>) -> CoreResult<Option<Value>> {
    let model = Arc::clone(state.model());
    let entry = state.entry(id)?;
    let ty = model.entity_type(entry.entity_type());
    let full = entry.state() == EntityState::Added || entry.shared_identity().is_some();
    let mut patched = document.clone();
    let mut changed = false;
    for (index, property) in ty.properties().iter().enumerate() {
        let Some(name) = property.store_name() else {
            continue;
        };
        if name != ETAG_PROPERTY && (full || entry.is_modified(index)) {
            patched.set(name, convert_to_provider(property.converter(), entry.current_value(index))?);
            changed = true;
        }
    }
    assign_ordinal(state, id, ordinal)?;
    changed |= write_navigations(state, &model, &mut patched, id, Some(document))?;
    Ok(changed.then_some(patched))
}

fn assign_ordinal(state: &mut StateManager, id: EntryId, ordinal: Option<usize>) -> CoreResult<()> {
    let Some(ordinal) = ordinal else {
        return Ok(());
    };
    let entry = state.entry(id)?;
    let Some(index) = state.model().entity_type(entry.entity_type()).ordinal_key_property() else {
        return Ok(());
    };
    if entry.is_temporary(index) {
        let value = Value::Integer(i64::try_from(ordinal).unwrap_or(i64::MAX));
        state.set_store_generated(id, index, value)?;
    }
    Ok(())
}

/// Writes embedded navigations. With a `previous` document only changed
/// navigations are rewritten; returns whether anything was.
fn write_navigations(
    state: &mut StateManager,
    model: &Model,
    document: &mut Value,
    id: EntryId,
    previous: Option<&Value>,
) -> CoreResult<bool> {
    let ty = model.entity_type(state.entry(id)?.entity_type());
    let mut changed = false;
    for (index, navigation) in ty.navigations().iter().enumerate() {
        if !navigation.is_embedded(model) {
            continue;
        }
        let name = navigation.name();
        let dependents: Option<Vec<EntryId>> = state.entry(id)?.owned_entries(index).map(<[_]>::to_vec);

        if navigation.is_collection() {
            let value = match dependents {
                None => Value::Null,
                Some(dependents) => {
                    set_temporary_ordinals(state, &dependents)?;
                    let mut elements = Vec::with_capacity(dependents.len());
                    for (position, dependent) in dependents.iter().enumerate() {
                        elements.push(create(state, *dependent, Some(position + 1))?);
                    }
                    Value::Array(elements)
                }
            };
            // arrays are always rebuilt whole
            if previous.map_or(true, |p| p.get(name).unwrap_or(&Value::Null) != &value) {
                document.set(name, value);
                changed = true;
            }
            continue;
        }

        match dependents.as_deref().and_then(<[_]>::first).copied() {
            None => {
                if previous.map_or(true, |p| p.get(name).is_some_and(|v| !v.is_null())) {
                    document.set(name, Value::Null);
                    changed = true;
                }
            }
            Some(dependent) => {
                let nested = match (previous, state.entry(dependent)?.document().cloned()) {
                    (None, _) | (Some(_), None) => Some(create(state, dependent, None)?),
                    (Some(_), Some(snapshot)) => update(state, &snapshot, dependent, None)?,
                };
                if let Some(nested) = nested {
                    document.set(name, nested);
                    changed = true;
                }
            }
        }
    }
    Ok(changed)
}

/// Gives the elements of an owned collection temporary ordinal keys -1, -2,
/// ... unless every element already holds its 1-based position.
///
/// Returns whether values were reassigned.
pub fn set_temporary_ordinals(state: &mut StateManager, elements: &[EntryId]) -> CoreResult<bool> {
    let Some(first) = elements.first() else {
        return Ok(false);
    };
    let Some(ordinal) = state.entity_type_of(*first)?.ordinal_key_property() else {
        return Ok(false);
    };
    let mut in_place = true;
    for (position, element) in elements.iter().enumerate() {
        let entry = state.entry(*element)?;
        let expected = Value::Integer(i64::try_from(position + 1).unwrap_or(i64::MAX));
        if entry.is_temporary(ordinal) || *entry.current_value(ordinal) != expected {
            in_place = false;
            break;
        }
    }
    if in_place {
        return Ok(false);
    }
    for (position, element) in elements.iter().enumerate() {
        let value = -i64::try_from(position + 1).unwrap_or(i64::MAX);
        state.set_temporary_value(*element, ordinal, Value::Integer(value))?;
    }
    trace!(elements = elements.len(), "temporary ordinals assigned");
    Ok(true)
}

/// Stores the written document as the snapshot of `root` and of every
/// embedded dependent.
pub fn refresh_snapshots(state: &mut StateManager, root: EntryId, document: &Value) -> CoreResult<()> {
    let model = Arc::clone(state.model());
    state.set_document(root, Some(document.clone()))?;
    let ty = model.entity_type(state.entry(root)?.entity_type());
    for (index, navigation) in ty.navigations().iter().enumerate() {
        if !navigation.is_embedded(&model) {
            continue;
        }
        let dependents = state
            .entry(root)?
            .owned_entries(index)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        match document.get(navigation.name()) {
            Some(Value::Array(elements)) => {
                for (dependent, element) in dependents.iter().zip(elements) {
                    refresh_snapshots(state, *dependent, element)?;
                }
            }
            Some(nested @ Value::Object(_)) => {
                if let Some(dependent) = dependents.first() {
                    refresh_snapshots(state, *dependent, nested)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, ModelBuilder, PropertyBuilder, ValueKind};

    fn model() -> Arc<Model> {
        ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Order")
                    .container("Orders")
                    .property("Id", ValueKind::Text)
                    .property_with(PropertyBuilder::new("Total", ValueKind::Integer).store_name("total"))
                    .key(["Id"])
                    .without_discriminator(),
            )
            .owns_one(
                "Order",
                "ShipTo",
                EntityTypeBuilder::new("Address")
                    .property("Street", ValueKind::Text)
                    .property("City", ValueKind::Text),
            )
            .owns_many(
                "Order",
                "Lines",
                EntityTypeBuilder::new("Line").property("Sku", ValueKind::Text),
            )
            .build()
            .unwrap()
    }

    fn order(state: &mut StateManager, add: bool) -> EntryId {
        let ty = state.model().find_entity_type("Order").unwrap().id();
        let values = [("Id", Value::from("o1")), ("Total", Value::Integer(30))];
        if add {
            state.add(ty, values).unwrap()
        } else {
            state.attach(ty, values).unwrap()
        }
    }

    fn source(state: &StateManager) -> DocumentSource {
        let model = state.model();
        DocumentSource::new(model, model.find_entity_type("Order").unwrap().id()).unwrap()
    }

    fn ordinals(state: &StateManager, elements: &[EntryId]) -> Vec<(Value, bool)> {
        elements
            .iter()
            .map(|e| {
                let entry = state.entry(*e).unwrap();
                let ordinal = state.entity_type_of(*e).unwrap().ordinal_key_property().unwrap();
                (entry.current_value(ordinal).clone(), entry.is_temporary(ordinal))
            })
            .collect()
    }

    #[test]
    fn created_document_round_trips_as_no_op_update() {
        let mut state = StateManager::new(model());
        let root = order(&mut state, true);
        state
            .add_owned(root, "ShipTo", [("Street", "Main 1"), ("City", "Oslo")])
            .unwrap();
        let source = source(&state);

        let document = source.create_document(&mut state, root).unwrap();
        let keys: Vec<&str> = document.as_object().unwrap().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["id", "total", "ShipTo", "Lines"]);
        assert_eq!(
            document.get("ShipTo").unwrap(),
            &Value::object([("Street", "Main 1"), ("City", "Oslo")])
        );
        assert_eq!(document.get("Lines"), Some(&Value::Null));

        refresh_snapshots(&mut state, root, &document).unwrap();
        let all: Vec<EntryId> = state.entries().map(|e| e.id()).collect();
        state.accept_all(&all).unwrap();
        assert_eq!(source.update_document(&mut state, &document, root).unwrap(), None);
    }

    #[test]
    fn update_touches_only_modified_values() {
        let mut state = StateManager::new(model());
        let root = order(&mut state, false);
        let address = state
            .attach_owned(root, "ShipTo", [("Street", "Main 1"), ("City", "Oslo")])
            .unwrap();
        let source = source(&state);
        let stored = Value::object([
            ("id", Value::from("o1")),
            ("total", Value::Integer(30)),
            ("extra", Value::from("kept")),
            ("ShipTo", Value::object([("Street", "Main 1"), ("City", "Oslo")])),
        ]);
        refresh_snapshots(&mut state, root, &stored).unwrap();
        state.set_value(address, "City", "Bergen").unwrap();

        let patched = source.update_document(&mut state, &stored, root).unwrap().unwrap();
        assert_eq!(patched.get("extra"), Some(&Value::from("kept")));
        assert_eq!(patched.get_path(&["ShipTo", "City"]), Some(&Value::from("Bergen")));
        assert_eq!(patched.get("total"), Some(&Value::Integer(30)));
    }

    #[test]
    fn removed_reference_is_written_as_null() {
        let mut state = StateManager::new(model());
        let root = order(&mut state, false);
        let address = state
            .attach_owned(root, "ShipTo", [("Street", "Main 1"), ("City", "Oslo")])
            .unwrap();
        let stored = Value::object([
            ("id", Value::from("o1")),
            ("ShipTo", Value::object([("Street", "Main 1"), ("City", "Oslo")])),
        ]);
        refresh_snapshots(&mut state, root, &stored).unwrap();
        state.remove(address).unwrap();
        let patched = source(&state).update_document(&mut state, &stored, root).unwrap().unwrap();
        assert_eq!(patched.get("ShipTo"), Some(&Value::Null));
    }

    #[test]
    fn ordinals_in_place_are_left_alone() {
        let mut state = StateManager::new(model());
        let root = order(&mut state, false);
        let lines: Vec<EntryId> = ["a", "b", "c"]
            .into_iter()
            .map(|sku| state.attach_owned(root, "Lines", [("Sku", sku)]).unwrap())
            .collect();
        let before = ordinals(&state, &lines);
        assert!(!set_temporary_ordinals(&mut state, &lines).unwrap());
        assert!(!set_temporary_ordinals(&mut state, &lines).unwrap());
        assert_eq!(ordinals(&state, &lines), before);
        assert_eq!(before[2], (Value::Integer(3), false));
    }

    #[test]
    fn fresh_collection_gets_temporary_then_final_ordinals() {
        let mut state = StateManager::new(model());
        let root = order(&mut state, true);
        let lines: Vec<EntryId> = ["a", "b", "c"]
            .into_iter()
            .map(|sku| state.add_owned(root, "Lines", [("Sku", sku)]).unwrap())
            .collect();

        assert!(set_temporary_ordinals(&mut state, &lines).unwrap());
        let temporary = ordinals(&state, &lines);
        assert_eq!(
            temporary,
            vec![
                (Value::Integer(-1), true),
                (Value::Integer(-2), true),
                (Value::Integer(-3), true),
            ]
        );

        let document = source(&state).create_document(&mut state, root).unwrap();
        let finals: Vec<Value> = ordinals(&state, &lines).into_iter().map(|(v, _)| v).collect();
        assert_eq!(finals, [Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        let skus: Vec<&Value> = document
            .get("Lines")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .map(|line| line.get("Sku").unwrap())
            .collect();
        assert_eq!(skus, [&Value::from("a"), &Value::from("b"), &Value::from("c")]);
    }

    #[test]
    fn composite_key_root_has_no_id() {
        let model = ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Pair")
                    .property("Left", ValueKind::Integer)
                    .property("Right", ValueKind::Integer)
                    .key(["Left", "Right"]),
            )
            .build()
            .unwrap();
        let err = DocumentSource::new(&model, model.find_entity_type("Pair").unwrap().id()).unwrap_err();
        assert!(matches!(err, CoreError::MissingIdProperty { ref entity_type } if entity_type == "Pair"));
    }

    #[test]
    fn integer_ids_address_documents_as_text() {
        let model = ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Counter")
                    .property("Id", ValueKind::Integer)
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let ty = model.find_entity_type("Counter").unwrap().id();
        let mut state = StateManager::new(Arc::clone(&model));
        let entry = state.attach(ty, [("Id", 42)]).unwrap();
        let source = DocumentSource::new(&model, ty).unwrap();
        assert_eq!(source.id(&state, entry).unwrap(), "42");
        assert_eq!(source.container(), "Counter");
    }
}
