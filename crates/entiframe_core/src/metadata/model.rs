//! The immutable metadata model.

use crate::error::{CoreError, CoreResult};
use crate::metadata::converter::ValueConverter;
use crate::metadata::key::{EntityKey, KeyFactory, KeyShape};
use crate::types::{EntityTypeId, ForeignKeyId};
use entiframe_codec::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The kind of store a model maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Document store; owned types are embedded in their owner's document.
    Document,
    /// Relational store; owned references share their owner's row.
    Relational,
}

/// Entity-side kind of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `Value::Bool`.
    Bool,
    /// `Value::Integer`.
    Integer,
    /// `Value::Float`.
    Float,
    /// `Value::Text`.
    Text,
    /// `Value::Bytes`.
    Bytes,
    /// 16-byte `Value::Bytes` holding a UUID.
    Guid,
}

/// When the store generates a property's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueGenerated {
    /// Never; the application supplies it.
    #[default]
    Never,
    /// On insert, e.g. identity columns.
    OnAdd,
    /// On insert and update, e.g. row versions and etags.
    OnAddOrUpdate,
}

/// A scalar property.
#[derive(Debug, Clone)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) kind: ValueKind,
    pub(crate) nullable: bool,
    pub(crate) store_name: Option<String>,
    pub(crate) value_generated: ValueGenerated,
    pub(crate) concurrency_token: bool,
    pub(crate) ordinal_key: bool,
    pub(crate) key: bool,
    pub(crate) converter: Option<Arc<dyn ValueConverter>>,
    pub(crate) declaring_type: EntityTypeId,
}

impl Property {
    /// Property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity-side value kind.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Kind of the value as stored.
    #[must_use]
    pub fn provider_kind(&self) -> ValueKind {
        self.converter
            .as_ref()
            .map_or(self.kind, |converter| converter.provider_kind())
    }

    /// Whether the property accepts null.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Column or JSON property name; `None` when the property is not persisted.
    #[must_use]
    pub fn store_name(&self) -> Option<&str> {
        self.store_name.as_deref().filter(|name| !name.is_empty())
    }

    /// Whether the property has a store name.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.store_name().is_some()
    }

    /// Value generation strategy.
    #[must_use]
    pub fn value_generated(&self) -> ValueGenerated {
        self.value_generated
    }

    /// Whether the property takes part in optimistic concurrency checks.
    #[must_use]
    pub fn is_concurrency_token(&self) -> bool {
        self.concurrency_token
    }

    /// Whether this is the position key of an owned collection element.
    #[must_use]
    pub fn is_ordinal_key(&self) -> bool {
        self.ordinal_key
    }

    /// Whether the property is part of the primary key.
    #[must_use]
    pub fn is_key(&self) -> bool {
        self.key
    }

    /// The configured value converter.
    #[must_use]
    pub fn converter(&self) -> Option<&dyn ValueConverter> {
        self.converter.as_deref()
    }

    /// Type that declares the property.
    #[must_use]
    pub fn declaring_type(&self) -> EntityTypeId {
        self.declaring_type
    }
}

/// A navigation between two entity types.
#[derive(Debug, Clone)]
pub struct Navigation {
    pub(crate) name: String,
    pub(crate) target: EntityTypeId,
    pub(crate) foreign_key: ForeignKeyId,
    pub(crate) on_dependent: bool,
    pub(crate) collection: bool,
    pub(crate) declaring_type: EntityTypeId,
}

impl Navigation {
    /// Navigation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type at the other end.
    #[must_use]
    pub fn target(&self) -> EntityTypeId {
        self.target
    }

    /// Foreign key the navigation is defined over.
    #[must_use]
    pub fn foreign_key(&self) -> ForeignKeyId {
        self.foreign_key
    }

    /// Whether the navigation is declared on the dependent side.
    #[must_use]
    pub fn is_on_dependent(&self) -> bool {
        self.on_dependent
    }

    /// Whether the navigation holds many entities.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.collection
    }

    /// Type that declares the navigation.
    #[must_use]
    pub fn declaring_type(&self) -> EntityTypeId {
        self.declaring_type
    }

    /// Whether the target is stored inside the declaring type's store object.
    #[must_use]
    pub fn is_embedded(&self, model: &Model) -> bool {
        !self.on_dependent
            && model.foreign_key(self.foreign_key).is_ownership()
            && !model.entity_type(self.target).is_document_root()
    }
}

/// A foreign key relating a dependent type to a principal type.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub(crate) id: ForeignKeyId,
    pub(crate) dependent: EntityTypeId,
    pub(crate) principal: EntityTypeId,
    pub(crate) properties: Vec<usize>,
    pub(crate) principal_properties: Vec<usize>,
    pub(crate) ownership: bool,
    pub(crate) unique: bool,
    pub(crate) required: bool,
    pub(crate) principal_navigation: Option<String>,
    pub(crate) dependent_navigation: Option<String>,
}

impl ForeignKey {
    /// Foreign key id.
    #[must_use]
    pub fn id(&self) -> ForeignKeyId {
        self.id
    }

    /// Dependent type.
    #[must_use]
    pub fn dependent(&self) -> EntityTypeId {
        self.dependent
    }

    /// Principal type.
    #[must_use]
    pub fn principal(&self) -> EntityTypeId {
        self.principal
    }

    /// Foreign key property indices on the dependent.
    #[must_use]
    pub fn properties(&self) -> &[usize] {
        &self.properties
    }

    /// Principal key property indices, paired with [`Self::properties`].
    #[must_use]
    pub fn principal_properties(&self) -> &[usize] {
        &self.principal_properties
    }

    /// Whether this is an ownership relationship.
    #[must_use]
    pub fn is_ownership(&self) -> bool {
        self.ownership
    }

    /// Whether at most one dependent exists per principal.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Whether the dependent must reference a principal.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Navigation name on the principal.
    #[must_use]
    pub fn principal_navigation(&self) -> Option<&str> {
        self.principal_navigation.as_deref()
    }

    /// Navigation name on the dependent.
    #[must_use]
    pub fn dependent_navigation(&self) -> Option<&str> {
        self.dependent_navigation.as_deref()
    }
}

/// Where an entity type is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreMapping {
    /// Document container.
    pub container: Option<String>,
    /// Relational table.
    pub table: Option<String>,
    /// Relational schema.
    pub schema: Option<String>,
    /// Property of the owner's document holding this embedded type.
    pub containing_property: Option<String>,
}

/// An entity type.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub(crate) id: EntityTypeId,
    pub(crate) name: String,
    pub(crate) base: Option<EntityTypeId>,
    pub(crate) root: EntityTypeId,
    pub(crate) is_abstract: bool,
    pub(crate) properties: Vec<Property>,
    pub(crate) navigations: Vec<Navigation>,
    pub(crate) key_shape: KeyShape,
    pub(crate) key_factory: KeyFactory,
    pub(crate) discriminator: Option<usize>,
    pub(crate) discriminator_value: Option<Value>,
    pub(crate) derived: Vec<EntityTypeId>,
    pub(crate) concrete_types: Vec<EntityTypeId>,
    pub(crate) mapping: StoreMapping,
    pub(crate) ownership: Option<ForeignKeyId>,
    pub(crate) document_root: bool,
    pub(crate) foreign_keys: Vec<ForeignKeyId>,
    pub(crate) referencing_foreign_keys: Vec<ForeignKeyId>,
}

impl EntityType {
    /// Entity type id.
    #[must_use]
    pub fn id(&self) -> EntityTypeId {
        self.id
    }

    /// Entity type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct base type.
    #[must_use]
    pub fn base_type(&self) -> Option<EntityTypeId> {
        self.base
    }

    /// Root of the inheritance hierarchy (itself when it has no base).
    #[must_use]
    pub fn root_type(&self) -> EntityTypeId {
        self.root
    }

    /// Whether instances of exactly this type can exist.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// All properties, inherited first.
    #[must_use]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Property by index.
    #[must_use]
    pub fn property(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }

    /// Index of the property with the given name.
    #[must_use]
    pub fn find_property(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Index of the property with the given name, or a mapping error.
    pub fn property_index(&self, name: &str) -> CoreResult<usize> {
        self.find_property(name).ok_or_else(|| {
            CoreError::mapping(&self.name, format!("no property named '{name}'"))
        })
    }

    /// All navigations, inherited first.
    #[must_use]
    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    /// Index of the navigation with the given name.
    #[must_use]
    pub fn find_navigation(&self, name: &str) -> Option<usize> {
        self.navigations.iter().position(|n| n.name == name)
    }

    /// Primary key property indices.
    #[must_use]
    pub fn primary_key(&self) -> &[usize] {
        self.key_shape.properties()
    }

    /// Shape of the primary key.
    #[must_use]
    pub fn key_shape(&self) -> &KeyShape {
        &self.key_shape
    }

    /// Builds the identity key from a full value vector.
    pub fn create_key(&self, values: &[Value]) -> CoreResult<Option<EntityKey>> {
        (self.key_factory)(&self.key_shape, values)
    }

    /// Discriminator property index.
    #[must_use]
    pub fn discriminator_property(&self) -> Option<usize> {
        self.discriminator
    }

    /// Discriminator value assigned to this type.
    #[must_use]
    pub fn discriminator_value(&self) -> Option<&Value> {
        self.discriminator_value.as_ref()
    }

    /// Whether `other` is this type or derives from it.
    #[must_use]
    pub fn is_assignable_from(&self, other: EntityTypeId) -> bool {
        self.id == other || self.derived.contains(&other)
    }

    /// All types deriving from this one, directly or not.
    #[must_use]
    pub fn derived_types(&self) -> &[EntityTypeId] {
        &self.derived
    }

    /// Non-abstract types at or below this one, this type first.
    #[must_use]
    pub fn concrete_types_in_hierarchy(&self) -> &[EntityTypeId] {
        &self.concrete_types
    }

    /// Store mapping.
    #[must_use]
    pub fn mapping(&self) -> &StoreMapping {
        &self.mapping
    }

    /// Ownership foreign key, for owned types.
    #[must_use]
    pub fn ownership(&self) -> Option<ForeignKeyId> {
        self.ownership
    }

    /// Whether the type is owned by another.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.ownership.is_some()
    }

    /// Whether instances occupy their own top-level document or row.
    #[must_use]
    pub fn is_document_root(&self) -> bool {
        self.document_root
    }

    /// Foreign keys where this type is the dependent.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKeyId] {
        &self.foreign_keys
    }

    /// Foreign keys where this type is the principal.
    #[must_use]
    pub fn referencing_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.referencing_foreign_keys
    }

    /// The ordinal key property of an owned collection element type.
    #[must_use]
    pub fn ordinal_key_property(&self) -> Option<usize> {
        self.primary_key()
            .iter()
            .copied()
            .find(|&i| self.properties[i].ordinal_key && !self.properties[i].is_persisted())
    }

    /// The property whose store name is `id`.
    #[must_use]
    pub fn id_property(&self) -> Option<usize> {
        self.properties
            .iter()
            .position(|p| p.store_name() == Some("id"))
    }

    /// Container or table the type is stored in.
    #[must_use]
    pub fn store_object_name(&self) -> Option<&str> {
        self.mapping
            .container
            .as_deref()
            .or(self.mapping.table.as_deref())
    }
}

/// An immutable, built model.
#[derive(Debug)]
pub struct Model {
    pub(crate) store_kind: StoreKind,
    pub(crate) entity_types: Vec<EntityType>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    pub(crate) names: HashMap<String, EntityTypeId>,
}

impl Model {
    /// Store kind this model maps to.
    #[must_use]
    pub fn store_kind(&self) -> StoreKind {
        self.store_kind
    }

    /// All entity types, in declaration order.
    #[must_use]
    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    /// Entity type by id.
    ///
    /// Ids are only minted by the builder of this model.
    #[must_use]
    pub fn entity_type(&self, id: EntityTypeId) -> &EntityType {
        &self.entity_types[id.index()]
    }

    /// Entity type by name.
    #[must_use]
    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.names.get(name).map(|id| self.entity_type(*id))
    }

    /// Entity type by name, or a mapping error.
    pub fn entity_type_named(&self, name: &str) -> CoreResult<&EntityType> {
        self.find_entity_type(name)
            .ok_or_else(|| CoreError::mapping(name, "entity type is not part of the model"))
    }

    /// Foreign key by id.
    #[must_use]
    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.foreign_keys[id.index()]
    }

    /// All foreign keys.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Walks ownership up to the type that owns a store object.
    #[must_use]
    pub fn document_root_of(&self, id: EntityTypeId) -> EntityTypeId {
        let mut current = self.entity_type(id);
        while !current.is_document_root() {
            match current.ownership() {
                Some(fk) => current = self.entity_type(self.foreign_key(fk).principal()),
                None => break,
            }
        }
        current.id()
    }
}
