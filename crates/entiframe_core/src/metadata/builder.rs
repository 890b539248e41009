//! Model builder.
//!
//! Produces an immutable [`Model`] from entity, ownership and relationship
//! declarations. Inherited members are flattened onto derived types with the
//! base's members first, so a property index means the same thing for every
//! type of a hierarchy.

use crate::error::{CoreError, CoreResult};
use crate::metadata::converter::ValueConverter;
use crate::metadata::key::{key_factory, KeyShape};
use crate::metadata::model::{
    EntityType, ForeignKey, Model, Navigation, Property, StoreKind, StoreMapping, ValueGenerated,
    ValueKind,
};
use crate::types::{EntityTypeId, ForeignKeyId};
use entiframe_codec::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the discriminator property added to hierarchies.
pub const DISCRIMINATOR_PROPERTY: &str = "Discriminator";

/// Name of the etag property added by [`EntityTypeBuilder::etag`].
pub const ETAG_PROPERTY: &str = "_etag";

/// Declares a scalar property.
#[derive(Debug, Clone)]
pub struct PropertyBuilder {
    name: String,
    kind: ValueKind,
    nullable: bool,
    store_name: Option<String>,
    persisted: bool,
    value_generated: ValueGenerated,
    concurrency_token: bool,
    converter: Option<Arc<dyn ValueConverter>>,
}

impl PropertyBuilder {
    /// Creates a non-nullable property stored under its own name.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            store_name: None,
            persisted: true,
            value_generated: ValueGenerated::Never,
            concurrency_token: false,
            converter: None,
        }
    }

    /// Allows null values.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the column or JSON property name.
    #[must_use]
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = Some(name.into());
        self
    }

    /// Keeps the property out of the store.
    #[must_use]
    pub fn not_persisted(mut self) -> Self {
        self.persisted = false;
        self
    }

    /// Sets the value generation strategy.
    #[must_use]
    pub fn generated(mut self, value_generated: ValueGenerated) -> Self {
        self.value_generated = value_generated;
        self
    }

    /// Marks the property as a concurrency token.
    #[must_use]
    pub fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }

    /// Sets a value converter.
    #[must_use]
    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = Some(converter);
        self
    }
}

/// Declares an entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    base: Option<String>,
    is_abstract: bool,
    properties: Vec<PropertyBuilder>,
    key: Vec<String>,
    discriminator_value: Option<Value>,
    discriminator: bool,
    container: Option<String>,
    table: Option<String>,
    schema: Option<String>,
}

impl EntityTypeBuilder {
    /// Starts declaring a type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            is_abstract: false,
            properties: Vec::new(),
            key: Vec::new(),
            discriminator_value: None,
            discriminator: true,
            container: None,
            table: None,
            schema: None,
        }
    }

    /// Derives from another type.
    #[must_use]
    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.base = Some(name.into());
        self
    }

    /// Marks the type abstract.
    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Adds a non-nullable property stored under its own name.
    #[must_use]
    pub fn property(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.property_with(PropertyBuilder::new(name, kind))
    }

    /// Adds a configured property.
    #[must_use]
    pub fn property_with(mut self, property: PropertyBuilder) -> Self {
        self.properties.push(property);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn key<S: Into<String>>(mut self, properties: impl IntoIterator<Item = S>) -> Self {
        self.key = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the discriminator value; defaults to the type name.
    #[must_use]
    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    /// Omits the discriminator a document root gets by default.
    #[must_use]
    pub fn without_discriminator(mut self) -> Self {
        self.discriminator = false;
        self
    }

    /// Sets the document container.
    #[must_use]
    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    /// Sets the relational table.
    #[must_use]
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = Some(name.into());
        self
    }

    /// Sets the relational schema.
    #[must_use]
    pub fn schema(mut self, name: impl Into<String>) -> Self {
        self.schema = Some(name.into());
        self
    }

    /// Adds the `_etag` concurrency token a document store maintains.
    #[must_use]
    pub fn etag(self) -> Self {
        self.property_with(
            PropertyBuilder::new(ETAG_PROPERTY, ValueKind::Text)
                .nullable()
                .concurrency_token()
                .generated(ValueGenerated::OnAddOrUpdate),
        )
    }
}

/// Declares a non-ownership relationship.
#[derive(Debug, Clone)]
pub struct ForeignKeyBuilder {
    dependent: String,
    principal: String,
    properties: Vec<String>,
    principal_navigation: Option<String>,
    dependent_navigation: Option<String>,
    unique: bool,
}

impl ForeignKeyBuilder {
    /// Relates `dependent.properties` to `principal`'s primary key.
    pub fn new<S: Into<String>>(
        dependent: impl Into<String>,
        principal: impl Into<String>,
        properties: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            dependent: dependent.into(),
            principal: principal.into(),
            properties: properties.into_iter().map(Into::into).collect(),
            principal_navigation: None,
            dependent_navigation: None,
            unique: false,
        }
    }

    /// Names the navigation on the principal.
    #[must_use]
    pub fn principal_navigation(mut self, name: impl Into<String>) -> Self {
        self.principal_navigation = Some(name.into());
        self
    }

    /// Names the navigation on the dependent.
    #[must_use]
    pub fn dependent_navigation(mut self, name: impl Into<String>) -> Self {
        self.dependent_navigation = Some(name.into());
        self
    }

    /// Makes the relationship one-to-one.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone)]
struct Ownership {
    owner: String,
    navigation: String,
    collection: bool,
}

#[derive(Debug, Clone)]
struct Definition {
    builder: EntityTypeBuilder,
    ownership: Option<Ownership>,
}

/// Builds a [`Model`].
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    store_kind: StoreKind,
    definitions: Vec<Definition>,
    foreign_keys: Vec<ForeignKeyBuilder>,
}

impl ModelBuilder {
    /// Creates a builder for the given store kind.
    #[must_use]
    pub fn new(store_kind: StoreKind) -> Self {
        Self {
            store_kind,
            definitions: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Creates a builder for a document store.
    #[must_use]
    pub fn document() -> Self {
        Self::new(StoreKind::Document)
    }

    /// Creates a builder for a relational store.
    #[must_use]
    pub fn relational() -> Self {
        Self::new(StoreKind::Relational)
    }

    /// Adds an entity type.
    #[must_use]
    pub fn entity(mut self, builder: EntityTypeBuilder) -> Self {
        self.definitions.push(Definition {
            builder,
            ownership: None,
        });
        self
    }

    /// Adds a type owned by `owner` through a reference navigation.
    #[must_use]
    pub fn owns_one(
        self,
        owner: impl Into<String>,
        navigation: impl Into<String>,
        builder: EntityTypeBuilder,
    ) -> Self {
        self.owns(owner.into(), navigation.into(), builder, false)
    }

    /// Adds a type owned by `owner` through a collection navigation.
    #[must_use]
    pub fn owns_many(
        self,
        owner: impl Into<String>,
        navigation: impl Into<String>,
        builder: EntityTypeBuilder,
    ) -> Self {
        self.owns(owner.into(), navigation.into(), builder, true)
    }

    fn owns(
        mut self,
        owner: String,
        navigation: String,
        builder: EntityTypeBuilder,
        collection: bool,
    ) -> Self {
        self.definitions.push(Definition {
            builder,
            ownership: Some(Ownership {
                owner,
                navigation,
                collection,
            }),
        });
        self
    }

    /// Adds a relationship between two declared types.
    #[must_use]
    pub fn foreign_key(mut self, foreign_key: ForeignKeyBuilder) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Validates the declarations and finalizes the model.
    pub fn build(self) -> CoreResult<Arc<Model>> {
        let store_kind = self.store_kind;
        let mut build = Build::new(store_kind, &self.definitions)?;
        build.resolve_bases()?;
        build.build_types()?;
        build.add_foreign_keys(&self.foreign_keys)?;
        build.flatten_navigations();
        build.link_hierarchies();
        let model = build.finish();
        tracing::debug!(
            types = model.entity_types.len(),
            foreign_keys = model.foreign_keys.len(),
            store = ?store_kind,
            "model built"
        );
        Ok(Arc::new(model))
    }
}

/// Working state of [`ModelBuilder::build`].
struct Build<'a> {
    store_kind: StoreKind,
    definitions: &'a [Definition],
    names: HashMap<String, EntityTypeId>,
    bases: Vec<Option<EntityTypeId>>,
    types: Vec<Option<EntityType>>,
    foreign_keys: Vec<ForeignKey>,
    own_navigations: Vec<Vec<Navigation>>,
    column_prefixes: Vec<Option<String>>,
}

impl<'a> Build<'a> {
    fn new(store_kind: StoreKind, definitions: &'a [Definition]) -> CoreResult<Self> {
        let mut names = HashMap::new();
        for (index, definition) in definitions.iter().enumerate() {
            let id = EntityTypeId::new(u32::try_from(index).map_err(|_| {
                CoreError::mapping(&definition.builder.name, "too many entity types")
            })?);
            if names.insert(definition.builder.name.clone(), id).is_some() {
                return Err(CoreError::mapping(
                    &definition.builder.name,
                    "declared more than once",
                ));
            }
        }
        let count = definitions.len();
        Ok(Self {
            store_kind,
            definitions,
            names,
            bases: vec![None; count],
            types: vec![None; count],
            foreign_keys: Vec::new(),
            own_navigations: vec![Vec::new(); count],
            column_prefixes: vec![None; count],
        })
    }

    fn id_of(&self, name: &str, referenced_from: &str) -> CoreResult<EntityTypeId> {
        self.names.get(name).copied().ok_or_else(|| {
            CoreError::mapping(referenced_from, format!("unknown entity type '{name}'"))
        })
    }

    fn resolve_bases(&mut self) -> CoreResult<()> {
        for (index, definition) in self.definitions.iter().enumerate() {
            let Some(base) = &definition.builder.base else {
                continue;
            };
            if definition.ownership.is_some() {
                return Err(CoreError::mapping(
                    &definition.builder.name,
                    "owned types cannot derive from another type",
                ));
            }
            let base_id = self.id_of(base, &definition.builder.name)?;
            if self.definitions[base_id.index()].ownership.is_some() {
                return Err(CoreError::mapping(
                    &definition.builder.name,
                    format!("cannot derive from owned type '{base}'"),
                ));
            }
            if !definition.builder.key.is_empty() {
                return Err(CoreError::mapping(
                    &definition.builder.name,
                    "derived types inherit the key of their base",
                ));
            }
            self.bases[index] = Some(base_id);
        }

        for index in 0..self.definitions.len() {
            if self.depth(index).is_none() {
                return Err(CoreError::mapping(
                    &self.definitions[index].builder.name,
                    "inheritance cycle",
                ));
            }
        }
        Ok(())
    }

    fn depth(&self, index: usize) -> Option<usize> {
        let mut depth = 0;
        let mut current = index;
        while let Some(base) = self.bases[current] {
            depth += 1;
            if depth > self.definitions.len() {
                return None;
            }
            current = base.index();
        }
        Some(depth)
    }

    fn root_of(&self, index: usize) -> usize {
        let mut current = index;
        while let Some(base) = self.bases[current] {
            current = base.index();
        }
        current
    }

    fn has_derived(&self, index: usize) -> bool {
        self.bases
            .iter()
            .any(|base| base.is_some_and(|b| b.index() == index))
    }

    /// Non-owned types by increasing hierarchy depth, then owned types in
    /// declaration order.
    fn build_order(&self) -> Vec<usize> {
        let mut unowned: Vec<(usize, usize)> = (0..self.definitions.len())
            .filter(|&i| self.definitions[i].ownership.is_none())
            .map(|i| (self.depth(i).unwrap_or(0), i))
            .collect();
        unowned.sort_unstable();
        let mut order: Vec<usize> = unowned.into_iter().map(|(_, i)| i).collect();
        order.extend(
            (0..self.definitions.len()).filter(|&i| self.definitions[i].ownership.is_some()),
        );
        order
    }

    fn build_types(&mut self) -> CoreResult<()> {
        let definitions = self.definitions;
        for index in self.build_order() {
            let entity_type = match &definitions[index].ownership {
                None => self.build_unowned(index)?,
                Some(ownership) => self.build_owned(index, ownership)?,
            };
            self.types[index] = Some(entity_type);
        }
        Ok(())
    }

    fn declared_properties(&self, index: usize, prefix: Option<&str>) -> Vec<Property> {
        let id = EntityTypeId::new(index as u32);
        self.definitions[index]
            .builder
            .properties
            .iter()
            .map(|p| {
                let store_name = if !p.persisted {
                    Some(String::new())
                } else {
                    let name = p.store_name.clone().unwrap_or_else(|| p.name.clone());
                    Some(match prefix {
                        Some(prefix) if p.store_name.is_none() => format!("{prefix}_{name}"),
                        _ => name,
                    })
                };
                Property {
                    name: p.name.clone(),
                    kind: p.kind,
                    nullable: p.nullable,
                    store_name,
                    value_generated: p.value_generated,
                    concurrency_token: p.concurrency_token,
                    ordinal_key: false,
                    key: false,
                    converter: p.converter.clone(),
                    declaring_type: id,
                }
            })
            .collect()
    }

    fn built(&self, id: EntityTypeId) -> CoreResult<&EntityType> {
        self.types[id.index()].as_ref().ok_or_else(|| {
            CoreError::mapping(
                &self.definitions[id.index()].builder.name,
                "must be declared before the types it owns",
            )
        })
    }

    fn build_unowned(&self, index: usize) -> CoreResult<EntityType> {
        let definitions = self.definitions;
        let builder = &definitions[index].builder;
        let id = EntityTypeId::new(index as u32);
        let root_index = self.root_of(index);
        let root_builder = &definitions[root_index].builder;

        let (mut properties, mapping) = match self.bases[index] {
            Some(base) => {
                let base_type = self.built(base)?;
                (base_type.properties.clone(), base_type.mapping.clone())
            }
            None => {
                let mapping = match self.store_kind {
                    StoreKind::Document => StoreMapping {
                        container: Some(
                            builder.container.clone().unwrap_or_else(|| builder.name.clone()),
                        ),
                        ..StoreMapping::default()
                    },
                    StoreKind::Relational => StoreMapping {
                        table: Some(builder.table.clone().unwrap_or_else(|| builder.name.clone())),
                        schema: builder.schema.clone(),
                        ..StoreMapping::default()
                    },
                };
                (Vec::new(), mapping)
            }
        };

        properties.extend(self.declared_properties(index, None));

        let is_root = self.bases[index].is_none();
        if is_root {
            let wants_discriminator = match self.store_kind {
                StoreKind::Document => builder.discriminator,
                StoreKind::Relational => self.has_derived(index),
            };
            if wants_discriminator && !properties.iter().any(|p| p.name == DISCRIMINATOR_PROPERTY)
            {
                properties.push(Property {
                    name: DISCRIMINATOR_PROPERTY.to_string(),
                    kind: ValueKind::Text,
                    nullable: false,
                    store_name: Some(DISCRIMINATOR_PROPERTY.to_string()),
                    value_generated: ValueGenerated::Never,
                    concurrency_token: false,
                    ordinal_key: false,
                    key: false,
                    converter: None,
                    declaring_type: id,
                });
            }

            if builder.key.is_empty() {
                return Err(CoreError::mapping(&builder.name, "no primary key declared"));
            }
            let mut key = Vec::with_capacity(builder.key.len());
            for name in &builder.key {
                let position = properties.iter().position(|p| &p.name == name).ok_or_else(|| {
                    CoreError::mapping(&builder.name, format!("key property '{name}' not declared"))
                })?;
                properties[position].key = true;
                key.push(position);
            }

            if self.store_kind == StoreKind::Document
                && key.len() == 1
                && !properties.iter().any(|p| p.store_name() == Some("id"))
            {
                let key_property = &mut properties[key[0]];
                if key_property.store_name().is_some() {
                    key_property.store_name = Some("id".to_string());
                }
            }
        }

        let key: Vec<usize> = properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.key)
            .map(|(i, _)| i)
            .collect();
        // key order follows the declaration on the root
        let key = order_key(&properties, &key, &root_builder.key);
        let discriminator = properties
            .iter()
            .position(|p| p.name == DISCRIMINATOR_PROPERTY);
        let discriminator_value = discriminator.map(|_| {
            builder
                .discriminator_value
                .clone()
                .unwrap_or_else(|| Value::Text(builder.name.clone()))
        });
        let key_shape = KeyShape::from_properties(&key);

        Ok(EntityType {
            id,
            name: builder.name.clone(),
            base: self.bases[index],
            root: EntityTypeId::new(root_index as u32),
            is_abstract: builder.is_abstract,
            properties,
            navigations: Vec::new(),
            key_factory: key_factory(&key_shape),
            key_shape,
            discriminator,
            discriminator_value,
            derived: Vec::new(),
            concrete_types: Vec::new(),
            mapping,
            ownership: None,
            document_root: true,
            foreign_keys: Vec::new(),
            referencing_foreign_keys: Vec::new(),
        })
    }

    fn build_owned(&mut self, index: usize, ownership: &Ownership) -> CoreResult<EntityType> {
        let definitions = self.definitions;
        let builder = &definitions[index].builder;
        let id = EntityTypeId::new(index as u32);
        let owner_id = self.id_of(&ownership.owner, &builder.name)?;
        let owner = self.built(owner_id)?;
        let owner_prefix = self.column_prefixes[owner_id.index()].clone();

        let embedded = match self.store_kind {
            StoreKind::Document => true,
            StoreKind::Relational => !ownership.collection,
        };
        let prefix = if self.store_kind == StoreKind::Relational && embedded {
            Some(match &owner_prefix {
                Some(p) => format!("{p}_{}", ownership.navigation),
                None => ownership.navigation.clone(),
            })
        } else {
            None
        };

        let mut properties = Vec::new();
        let mut key = Vec::new();
        let mut principal_properties = Vec::new();
        for &owner_key in owner.primary_key() {
            let owner_property = &owner.properties[owner_key];
            let store_name = match (self.store_kind, embedded) {
                (StoreKind::Document, _) => String::new(),
                // shares the owner's key column
                (StoreKind::Relational, true) => owner_property.store_name.clone().unwrap_or_default(),
                (StoreKind::Relational, false) => format!("{}{}", owner.name, owner_property.name),
            };
            key.push(properties.len());
            principal_properties.push(owner_key);
            properties.push(Property {
                name: format!("{}{}", owner.name, owner_property.name),
                kind: owner_property.kind,
                nullable: false,
                store_name: Some(store_name),
                value_generated: ValueGenerated::Never,
                concurrency_token: false,
                ordinal_key: false,
                key: true,
                converter: owner_property.converter.clone(),
                declaring_type: id,
            });
        }
        let foreign_key_properties = key.clone();
        let owner_mapping = owner.mapping.clone();
        let owner_name = owner.name.clone();

        let declared = self.declared_properties(index, prefix.as_deref());
        for property in &declared {
            if properties.iter().any(|p: &Property| p.name == property.name) {
                return Err(CoreError::mapping(
                    &builder.name,
                    format!("property '{}' collides with the owner key", property.name),
                ));
            }
        }
        let declared_start = properties.len();
        properties.extend(declared);

        if ownership.collection {
            if builder.key.is_empty() {
                let name = if properties.iter().any(|p| p.name == "Id") {
                    "__id".to_string()
                } else {
                    "Id".to_string()
                };
                let document = self.store_kind == StoreKind::Document;
                key.push(properties.len());
                properties.push(Property {
                    store_name: Some(if document { String::new() } else { name.clone() }),
                    name,
                    kind: ValueKind::Integer,
                    nullable: false,
                    value_generated: ValueGenerated::OnAdd,
                    concurrency_token: false,
                    ordinal_key: document,
                    key: true,
                    converter: None,
                    declaring_type: id,
                });
            } else {
                for name in &builder.key {
                    let position = properties[declared_start..]
                        .iter()
                        .position(|p| &p.name == name)
                        .map(|p| p + declared_start)
                        .ok_or_else(|| {
                            CoreError::mapping(
                                &builder.name,
                                format!("key property '{name}' not declared"),
                            )
                        })?;
                    properties[position].key = true;
                    key.push(position);
                }
            }
        }

        let mapping = match (self.store_kind, embedded) {
            (StoreKind::Document, _) => StoreMapping {
                container: owner_mapping.container,
                containing_property: Some(ownership.navigation.clone()),
                ..StoreMapping::default()
            },
            (StoreKind::Relational, true) => owner_mapping,
            (StoreKind::Relational, false) => StoreMapping {
                table: Some(builder.table.clone().unwrap_or_else(|| builder.name.clone())),
                schema: builder.schema.clone().or(owner_mapping.schema),
                ..StoreMapping::default()
            },
        };

        let fk_id = ForeignKeyId::new(self.foreign_keys.len() as u32);
        self.foreign_keys.push(ForeignKey {
            id: fk_id,
            dependent: id,
            principal: owner_id,
            properties: foreign_key_properties,
            principal_properties,
            ownership: true,
            unique: !ownership.collection,
            required: true,
            principal_navigation: Some(ownership.navigation.clone()),
            dependent_navigation: None,
        });
        self.own_navigations[owner_id.index()].push(Navigation {
            name: ownership.navigation.clone(),
            target: id,
            foreign_key: fk_id,
            on_dependent: false,
            collection: ownership.collection,
            declaring_type: owner_id,
        });
        self.column_prefixes[index] = prefix;

        tracing::trace!(
            owned = %builder.name,
            owner = %owner_name,
            navigation = %ownership.navigation,
            embedded,
            "owned type configured"
        );

        let key_shape = KeyShape::from_properties(&key);
        Ok(EntityType {
            id,
            name: builder.name.clone(),
            base: None,
            root: id,
            is_abstract: false,
            properties,
            navigations: Vec::new(),
            key_factory: key_factory(&key_shape),
            key_shape,
            discriminator: None,
            discriminator_value: None,
            derived: Vec::new(),
            concrete_types: Vec::new(),
            mapping,
            ownership: Some(fk_id),
            document_root: !embedded,
            foreign_keys: Vec::new(),
            referencing_foreign_keys: Vec::new(),
        })
    }

    fn add_foreign_keys(&mut self, declarations: &[ForeignKeyBuilder]) -> CoreResult<()> {
        for declaration in declarations {
            let dependent_id = self.id_of(&declaration.dependent, &declaration.dependent)?;
            let principal_id = self.id_of(&declaration.principal, &declaration.dependent)?;
            let dependent = self.built(dependent_id)?;
            let principal = self.built(principal_id)?;

            let mut properties = Vec::with_capacity(declaration.properties.len());
            for name in &declaration.properties {
                properties.push(dependent.property_index(name)?);
            }
            let principal_properties = principal.primary_key().to_vec();
            if properties.len() != principal_properties.len() {
                return Err(CoreError::mapping(
                    &declaration.dependent,
                    format!(
                        "foreign key to '{}' has {} properties, principal key has {}",
                        declaration.principal,
                        properties.len(),
                        principal_properties.len()
                    ),
                ));
            }
            let required = properties
                .iter()
                .all(|&i| !dependent.properties[i].nullable);

            let fk_id = ForeignKeyId::new(self.foreign_keys.len() as u32);
            if let Some(name) = &declaration.principal_navigation {
                self.own_navigations[principal_id.index()].push(Navigation {
                    name: name.clone(),
                    target: dependent_id,
                    foreign_key: fk_id,
                    on_dependent: false,
                    collection: !declaration.unique,
                    declaring_type: principal_id,
                });
            }
            if let Some(name) = &declaration.dependent_navigation {
                self.own_navigations[dependent_id.index()].push(Navigation {
                    name: name.clone(),
                    target: principal_id,
                    foreign_key: fk_id,
                    on_dependent: true,
                    collection: false,
                    declaring_type: dependent_id,
                });
            }
            self.foreign_keys.push(ForeignKey {
                id: fk_id,
                dependent: dependent_id,
                principal: principal_id,
                properties,
                principal_properties,
                ownership: false,
                unique: declaration.unique,
                required,
                principal_navigation: declaration.principal_navigation.clone(),
                dependent_navigation: declaration.dependent_navigation.clone(),
            });
        }
        Ok(())
    }

    fn ancestors(&self, index: usize) -> Vec<usize> {
        let mut chain = vec![index];
        let mut current = index;
        while let Some(base) = self.bases[current] {
            current = base.index();
            chain.push(current);
        }
        chain.reverse();
        chain
    }

    fn flatten_navigations(&mut self) {
        for index in 0..self.definitions.len() {
            let navigations: Vec<Navigation> = self
                .ancestors(index)
                .into_iter()
                .flat_map(|i| self.own_navigations[i].iter().cloned())
                .collect();
            if let Some(entity_type) = self.types[index].as_mut() {
                entity_type.navigations = navigations;
            }
        }
    }

    fn link_hierarchies(&mut self) {
        let count = self.definitions.len();
        for index in 0..count {
            let ancestors = self.ancestors(index);
            let id = EntityTypeId::new(index as u32);
            for &ancestor in ancestors.iter().filter(|&&a| a != index) {
                if let Some(entity_type) = self.types[ancestor].as_mut() {
                    entity_type.derived.push(id);
                }
            }
            let foreign_keys: Vec<ForeignKeyId> = self
                .foreign_keys
                .iter()
                .filter(|fk| ancestors.contains(&fk.dependent.index()))
                .map(|fk| fk.id)
                .collect();
            let referencing: Vec<ForeignKeyId> = self
                .foreign_keys
                .iter()
                .filter(|fk| ancestors.contains(&fk.principal.index()))
                .map(|fk| fk.id)
                .collect();
            if let Some(entity_type) = self.types[index].as_mut() {
                entity_type.foreign_keys = foreign_keys;
                entity_type.referencing_foreign_keys = referencing;
            }
        }

        let abstract_flags: Vec<bool> = (0..count)
            .map(|i| self.definitions[i].builder.is_abstract)
            .collect();
        for entity_type in self.types.iter_mut().flatten() {
            let mut concrete = Vec::new();
            if !entity_type.is_abstract {
                concrete.push(entity_type.id);
            }
            concrete.extend(
                entity_type
                    .derived
                    .iter()
                    .copied()
                    .filter(|d| !abstract_flags[d.index()]),
            );
            entity_type.concrete_types = concrete;
        }
    }

    fn finish(self) -> Model {
        Model {
            store_kind: self.store_kind,
            entity_types: self.types.into_iter().flatten().collect(),
            foreign_keys: self.foreign_keys,
            names: self.names,
        }
    }
}

fn order_key(properties: &[Property], found: &[usize], declared: &[String]) -> Vec<usize> {
    let mut ordered: Vec<usize> = declared
        .iter()
        .filter_map(|name| properties.iter().position(|p| &p.name == name))
        .collect();
    if ordered.len() != found.len() {
        ordered = found.to_vec();
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animals() -> Arc<Model> {
        ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Animal")
                    .abstract_type()
                    .property("Id", ValueKind::Integer)
                    .property("Name", ValueKind::Text)
                    .key(["Id"])
                    .container("Zoo"),
            )
            .entity(
                EntityTypeBuilder::new("Dog")
                    .base("Animal")
                    .property("GoodBoy", ValueKind::Bool),
            )
            .entity(
                EntityTypeBuilder::new("Cat")
                    .base("Animal")
                    .property("Lives", ValueKind::Integer),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn hierarchy_is_flattened_base_first() {
        let model = animals();
        let dog = model.find_entity_type("Dog").unwrap();
        let names: Vec<&str> = dog.properties().iter().map(Property::name).collect();
        assert_eq!(names, vec!["Id", "Name", DISCRIMINATOR_PROPERTY, "GoodBoy"]);
        assert_eq!(dog.mapping().container.as_deref(), Some("Zoo"));
        assert_eq!(dog.discriminator_value(), Some(&Value::from("Dog")));
        assert_eq!(dog.primary_key(), &[0]);
    }

    #[test]
    fn concrete_types_skip_abstract() {
        let model = animals();
        let animal = model.find_entity_type("Animal").unwrap();
        let concrete: Vec<&str> = animal
            .concrete_types_in_hierarchy()
            .iter()
            .map(|id| model.entity_type(*id).name())
            .collect();
        assert_eq!(concrete, vec!["Dog", "Cat"]);
        assert!(animal.is_assignable_from(model.find_entity_type("Cat").unwrap().id()));
    }

    #[test]
    fn single_key_maps_to_id() {
        let model = animals();
        let animal = model.find_entity_type("Animal").unwrap();
        assert_eq!(animal.property(0).unwrap().store_name(), Some("id"));
        assert_eq!(animal.id_property(), Some(0));
    }

    #[test]
    fn document_owned_types_are_embedded() {
        let model = ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Order")
                    .property("Id", ValueKind::Integer)
                    .key(["Id"]),
            )
            .owns_one(
                "Order",
                "ShippingAddress",
                EntityTypeBuilder::new("Address").property("City", ValueKind::Text),
            )
            .owns_many(
                "Order",
                "Lines",
                EntityTypeBuilder::new("OrderLine").property("Qty", ValueKind::Integer),
            )
            .build()
            .unwrap();

        let address = model.find_entity_type("Address").unwrap();
        assert!(!address.is_document_root());
        assert_eq!(
            address.mapping().containing_property.as_deref(),
            Some("ShippingAddress")
        );
        let owner_key = address.property(0).unwrap();
        assert_eq!(owner_key.name(), "OrderId");
        assert!(!owner_key.is_persisted());

        let line = model.find_entity_type("OrderLine").unwrap();
        let ordinal = line.ordinal_key_property().unwrap();
        assert_eq!(line.property(ordinal).unwrap().name(), "Id");
        assert_eq!(line.primary_key().len(), 2);

        let order = model.find_entity_type("Order").unwrap();
        let lines = &order.navigations()[order.find_navigation("Lines").unwrap()];
        assert!(lines.is_collection());
        assert!(lines.is_embedded(&model));
        assert_eq!(model.document_root_of(line.id()), order.id());
    }

    #[test]
    fn relational_owned_reference_is_table_split() {
        let model = ModelBuilder::relational()
            .entity(
                EntityTypeBuilder::new("Customer")
                    .property("Id", ValueKind::Integer)
                    .key(["Id"])
                    .table("Customers"),
            )
            .owns_one(
                "Customer",
                "Address",
                EntityTypeBuilder::new("Address").property("City", ValueKind::Text),
            )
            .build()
            .unwrap();
        let address = model.find_entity_type("Address").unwrap();
        assert_eq!(address.mapping().table.as_deref(), Some("Customers"));
        assert_eq!(address.property(0).unwrap().store_name(), Some("Id"));
        assert_eq!(address.property(1).unwrap().store_name(), Some("Address_City"));
        // no hierarchy, no discriminator
        let customer = model.find_entity_type("Customer").unwrap();
        assert_eq!(customer.discriminator_property(), None);
    }

    #[test]
    fn foreign_key_requiredness_follows_nullability() {
        let model = ModelBuilder::relational()
            .entity(
                EntityTypeBuilder::new("Blog")
                    .property("Id", ValueKind::Integer)
                    .key(["Id"]),
            )
            .entity(
                EntityTypeBuilder::new("Post")
                    .property("Id", ValueKind::Integer)
                    .property_with(PropertyBuilder::new("BlogId", ValueKind::Integer).nullable())
                    .key(["Id"]),
            )
            .foreign_key(
                ForeignKeyBuilder::new("Post", "Blog", ["BlogId"])
                    .principal_navigation("Posts")
                    .dependent_navigation("Blog"),
            )
            .build()
            .unwrap();
        let fk = &model.foreign_keys()[0];
        assert!(!fk.is_required());
        assert!(!fk.is_ownership());
        let blog = model.find_entity_type("Blog").unwrap();
        assert_eq!(blog.referencing_foreign_keys(), &[fk.id()]);
    }

    #[test]
    fn invalid_declarations_are_mapping_errors() {
        let missing_key = ModelBuilder::document()
            .entity(EntityTypeBuilder::new("Thing").property("Name", ValueKind::Text))
            .build();
        assert!(matches!(missing_key, Err(CoreError::Mapping { .. })));

        let unknown_base = ModelBuilder::document()
            .entity(EntityTypeBuilder::new("Dog").base("Animal"))
            .build();
        assert!(matches!(unknown_base, Err(CoreError::Mapping { .. })));

        let duplicate = ModelBuilder::document()
            .entity(EntityTypeBuilder::new("A").property("Id", ValueKind::Integer).key(["Id"]))
            .entity(EntityTypeBuilder::new("A").property("Id", ValueKind::Integer).key(["Id"]))
            .build();
        assert!(matches!(duplicate, Err(CoreError::Mapping { .. })));
    }
}
