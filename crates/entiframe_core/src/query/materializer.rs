//! Shaping documents and rows into entity instances.

use crate::error::{CoreError, CoreResult};
use crate::metadata::{convert_from_provider, EntityType, Model};
use crate::query::context::QueryContext;
use crate::query::shaper::RowKind;
use crate::tracking::StateManager;
use crate::types::{EntityTypeId, EntryId};
use entiframe_codec::Value;

static NULL: Value = Value::Null;

/// A materialized entity: property values by name plus owned dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInstance {
    /// Concrete entity type name.
    pub entity_type: String,
    /// Tracking entry, when the instance is tracked.
    pub entry: Option<EntryId>,
    /// Property values in model order.
    pub values: Vec<(String, Value)>,
    /// Owned navigations in model order.
    pub owned: Vec<(String, OwnedValue)>,
}

/// Value of an owned navigation.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedValue {
    /// A reference navigation.
    One(Option<Box<EntityInstance>>),
    /// A collection navigation.
    Many(Vec<EntityInstance>),
}

impl EntityInstance {
    /// Value of a property.
    #[must_use]
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == property).map(|(_, v)| v)
    }

    /// Dependent of an owned reference navigation.
    #[must_use]
    pub fn owned_one(&self, navigation: &str) -> Option<&EntityInstance> {
        match self.navigation(navigation)? {
            OwnedValue::One(dependent) => dependent.as_deref(),
            OwnedValue::Many(_) => None,
        }
    }

    /// Dependents of an owned collection navigation.
    #[must_use]
    pub fn owned_many(&self, navigation: &str) -> &[EntityInstance] {
        match self.navigation(navigation) {
            Some(OwnedValue::Many(dependents)) => dependents,
            _ => &[],
        }
    }

    fn navigation(&self, name: &str) -> Option<&OwnedValue> {
        self.owned.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Turns each raw result into an [`EntityInstance`].
#[derive(Debug, Clone)]
pub struct EntityShaper {
    entity_type: EntityTypeId,
    tracking: bool,
    row_kind: RowKind,
}

impl EntityShaper {
    /// Creates a shaper for results of `entity_type`.
    #[must_use]
    pub fn new(entity_type: EntityTypeId, tracking: bool, row_kind: RowKind) -> Self {
        Self {
            entity_type,
            tracking,
            row_kind,
        }
    }

    /// Entity type shaped.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Whether results are attached to the state manager.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Element type the shaper reads.
    #[must_use]
    pub fn row_kind(&self) -> RowKind {
        self.row_kind
    }

    /// Shapes one document or row.
    ///
    /// When tracking, an entity already tracked under the same key is
    /// returned as tracked instead of being overwritten by the store values.
    pub fn shape(&self, context: &QueryContext, row: Value) -> CoreResult<EntityInstance> {
        let model = context.model();
        let ty = model.entity_type(self.entity_type);
        let mut materialized = read_entity(model, ty, &row, self.row_kind)?;
        if self.row_kind == RowKind::Document {
            materialized.document = Some(row);
        }
        match (self.tracking, context.state()) {
            (true, Some(state)) => {
                let mut state = state.lock();
                let entry = attach(&mut state, materialized, None)?;
                state.instance(entry)
            }
            _ => Ok(to_instance(model, materialized)),
        }
    }
}

struct Materialized {
    entity_type: EntityTypeId,
    values: Vec<Value>,
    owned: Vec<(usize, Owned)>,
    document: Option<Value>,
}

enum Owned {
    One(Option<Box<Materialized>>),
    Many(Vec<Materialized>),
}

fn read_entity(
    model: &Model,
    ty: &EntityType,
    row: &Value,
    row_kind: RowKind,
) -> CoreResult<Materialized> {
    let concrete = resolve_concrete(model, ty, row)?;
    let mut materialized = Materialized {
        entity_type: concrete.id(),
        values: read_values(concrete, row)?,
        owned: Vec::new(),
        document: None,
    };
    read_owned(model, concrete, &mut materialized, row, row_kind)?;
    Ok(materialized)
}

fn resolve_concrete<'m>(model: &'m Model, ty: &'m EntityType, row: &Value) -> CoreResult<&'m EntityType> {
    let Some(column) = ty
        .discriminator_property()
        .and_then(|index| ty.property(index))
        .and_then(|p| p.store_name())
    else {
        if ty.is_abstract() {
            return Err(CoreError::materialization(
                ty.name(),
                "abstract type has no discriminator",
            ));
        }
        return Ok(ty);
    };
    let value = row.get(column).unwrap_or(&NULL);
    ty.concrete_types_in_hierarchy()
        .iter()
        .map(|id| model.entity_type(*id))
        .find(|candidate| candidate.discriminator_value().is_some_and(|d| d.loose_eq(value)))
        .ok_or_else(|| {
            CoreError::materialization(ty.name(), format!("unknown discriminator value {value}"))
        })
}

fn read_values(ty: &EntityType, row: &Value) -> CoreResult<Vec<Value>> {
    ty.properties()
        .iter()
        .map(|property| match property.store_name() {
            Some(name) => convert_from_provider(property.converter(), row.get(name).unwrap_or(&NULL))
                .map_err(|err| CoreError::materialization(ty.name(), err.to_string())),
            None => Ok(Value::Null),
        })
        .collect()
}

fn owned_child(
    model: &Model,
    target: &EntityType,
    owner: &Materialized,
    foreign_key: &crate::metadata::ForeignKey,
    source: &Value,
    row_kind: RowKind,
) -> CoreResult<Materialized> {
    let mut values = read_values(target, source)?;
    for (&dependent, &principal) in foreign_key.properties().iter().zip(foreign_key.principal_properties()) {
        values[dependent] = owner.values.get(principal).cloned().unwrap_or(Value::Null);
    }
    let mut child = Materialized {
        entity_type: target.id(),
        values,
        owned: Vec::new(),
        document: (row_kind == RowKind::Document).then(|| source.clone()),
    };
    read_owned(model, target, &mut child, source, row_kind)?;
    Ok(child)
}

fn read_owned(
    model: &Model,
    ty: &EntityType,
    owner: &mut Materialized,
    row: &Value,
    row_kind: RowKind,
) -> CoreResult<()> {
    for (index, navigation) in ty.navigations().iter().enumerate() {
        let foreign_key = model.foreign_key(navigation.foreign_key());
        if navigation.is_on_dependent() || !foreign_key.is_ownership() {
            continue;
        }
        let target = model.entity_type(navigation.target());
        if target.is_document_root() {
            // separately stored owned collections are not loaded with the owner
            continue;
        }
        let owned = match row_kind {
            RowKind::Document => match (row.get(navigation.name()), navigation.is_collection()) {
                (None | Some(Value::Null), false) => Owned::One(None),
                (None | Some(Value::Null), true) => continue,
                (Some(Value::Array(elements)), true) => {
                    let mut children = Vec::with_capacity(elements.len());
                    for (position, element) in elements.iter().enumerate() {
                        let mut child = owned_child(model, target, owner, foreign_key, element, row_kind)?;
                        if let Some(ordinal) = target.ordinal_key_property() {
                            child.values[ordinal] = Value::Integer(position as i64 + 1);
                        }
                        children.push(child);
                    }
                    Owned::Many(children)
                }
                (Some(object @ Value::Object(_)), false) => Owned::One(Some(Box::new(owned_child(
                    model,
                    target,
                    owner,
                    foreign_key,
                    object,
                    row_kind,
                )?))),
                (Some(other), _) => {
                    return Err(CoreError::materialization(
                        ty.name(),
                        format!(
                            "'{}' holds {} where an embedded {} was expected",
                            navigation.name(),
                            other.type_name(),
                            target.name()
                        ),
                    ))
                }
            },
            RowKind::Row => {
                if navigation.is_collection() {
                    continue;
                }
                let present = target
                    .properties()
                    .iter()
                    .filter(|p| !p.is_key() && p.is_persisted())
                    .filter_map(|p| p.store_name())
                    .any(|column| row.get(column).is_some_and(|v| !v.is_null()));
                if present {
                    Owned::One(Some(Box::new(owned_child(
                        model,
                        target,
                        owner,
                        foreign_key,
                        row,
                        row_kind,
                    )?)))
                } else {
                    Owned::One(None)
                }
            }
        };
        owner.owned.push((index, owned));
    }
    Ok(())
}

fn attach(
    state: &mut StateManager,
    materialized: Materialized,
    owner: Option<(EntryId, usize)>,
) -> CoreResult<EntryId> {
    let Materialized {
        entity_type,
        values,
        owned,
        document,
    } = materialized;
    let (entry, is_new) = state.track_queried(entity_type, values, document)?;
    if !is_new {
        return Ok(entry);
    }
    if let Some((owner, navigation)) = owner {
        state.link_owned(owner, navigation, entry)?;
    }
    for (navigation, dependents) in owned {
        match dependents {
            Owned::One(None) => {}
            Owned::One(Some(child)) => {
                attach(state, *child, Some((entry, navigation)))?;
            }
            Owned::Many(children) => {
                state.touch_navigation(entry, navigation)?;
                for child in children {
                    attach(state, child, Some((entry, navigation)))?;
                }
            }
        }
    }
    Ok(entry)
}

fn to_instance(model: &Model, materialized: Materialized) -> EntityInstance {
    let ty = model.entity_type(materialized.entity_type);
    let values = ty
        .properties()
        .iter()
        .zip(materialized.values)
        .map(|(p, v)| (p.name().to_string(), v))
        .collect();
    let mut owned: Vec<(String, OwnedValue)> = Vec::new();
    for (index, navigation) in ty.navigations().iter().enumerate() {
        let foreign_key = model.foreign_key(navigation.foreign_key());
        if navigation.is_on_dependent() || !foreign_key.is_ownership() {
            continue;
        }
        let value = match materialized.owned.iter().position(|(i, _)| *i == index) {
            None if navigation.is_collection() => OwnedValue::Many(Vec::new()),
            None => OwnedValue::One(None),
            Some(_) => continue,
        };
        owned.push((navigation.name().to_string(), value));
    }
    for (index, dependents) in materialized.owned {
        let name = ty.navigations()[index].name().to_string();
        let value = match dependents {
            Owned::One(child) => OwnedValue::One(child.map(|c| Box::new(to_instance(model, *c)))),
            Owned::Many(children) => {
                OwnedValue::Many(children.into_iter().map(|c| to_instance(model, c)).collect())
            }
        };
        owned.push((name, value));
    }
    owned.sort_by_key(|(name, _)| ty.find_navigation(name));
    EntityInstance {
        entity_type: ty.name().to_string(),
        entry: None,
        values,
        owned,
    }
}
