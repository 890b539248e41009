//! The store-level select.

use crate::error::CoreResult;
use crate::metadata::{EntityType, Model, StoreKind};
use crate::query::expression::{BinaryOp, Expression, QuerySourceRef};
use crate::query::sql::{DocumentSqlGenerator, QuerySqlGenerator, SqlQuery};
use crate::types::{EntityTypeId, QuerySourceId};
use entiframe_codec::Value;
use std::fmt;
use std::sync::Arc;

/// One `ORDER BY` term.
#[derive(Debug, Clone)]
pub struct Ordering {
    /// Bound expression to sort by.
    pub expression: Expression,
    /// Sort direction.
    pub ascending: bool,
}

/// A query against one container or table.
///
/// Built by the translator and mutated only while translation runs; once
/// handed to a generator or executor it is shared behind an `Arc` and never
/// changed again.
#[derive(Clone)]
pub struct SelectExpression {
    model: Arc<Model>,
    entity_type: EntityTypeId,
    result_type: EntityTypeId,
    query_source: QuerySourceId,
    alias: String,
    store_object: String,
    schema: Option<String>,
    columns: Vec<String>,
    projection: Expression,
    from: Expression,
    predicate: Option<Expression>,
    orderings: Vec<Ordering>,
    offset: Option<Expression>,
    limit: Option<Expression>,
}

impl SelectExpression {
    /// Creates a select over the store object of `entity_type`, filtered to the
    /// concrete types of its hierarchy.
    #[must_use]
    pub fn new(model: Arc<Model>, entity_type: EntityTypeId, query_source: QuerySourceId) -> Self {
        let ty = model.entity_type(entity_type);
        let alias = ty
            .name()
            .chars()
            .next()
            .map_or_else(|| "t".to_string(), |c| c.to_lowercase().collect());
        let from = Expression::RootReference {
            alias: alias.clone(),
            entity_type,
        };
        let projection = Expression::EntityProjection {
            entity_type,
            access: Box::new(from.clone()),
        };
        let store_object = ty.store_object_name().unwrap_or(ty.name()).to_string();
        let schema = ty.mapping().schema.clone();
        let mut columns = Vec::new();
        if model.store_kind() == StoreKind::Relational {
            let root = model.entity_type(ty.root_type());
            collect_columns(&model, root, &mut columns);
            for derived in root.derived_types() {
                collect_columns(&model, model.entity_type(*derived), &mut columns);
            }
        }

        let mut select = Self {
            model,
            entity_type,
            result_type: entity_type,
            query_source,
            alias,
            store_object,
            schema,
            columns,
            projection,
            from,
            predicate: None,
            orderings: Vec::new(),
            offset: None,
            limit: None,
        };
        select.predicate = select.discriminator_predicate(entity_type);
        select
    }

    /// The model the select was built against.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Entity type the select was built for.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Entity type of the projected results; narrower than
    /// [`Self::entity_type`] after a type filter.
    #[must_use]
    pub fn result_type(&self) -> EntityTypeId {
        self.result_type
    }

    /// Query source the select answers.
    #[must_use]
    pub fn query_source(&self) -> QuerySourceId {
        self.query_source
    }

    /// Alias of the root reference.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Container or table name.
    #[must_use]
    pub fn store_object(&self) -> &str {
        &self.store_object
    }

    /// Table schema, for relational stores.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Columns projected by a relational select.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Kind of store the select targets.
    #[must_use]
    pub fn store_kind(&self) -> StoreKind {
        self.model.store_kind()
    }

    /// The projection.
    #[must_use]
    pub fn projection(&self) -> &Expression {
        &self.projection
    }

    /// The from clause.
    #[must_use]
    pub fn from(&self) -> &Expression {
        &self.from
    }

    /// The filter, if any.
    #[must_use]
    pub fn predicate(&self) -> Option<&Expression> {
        self.predicate.as_ref()
    }

    /// Sort terms in priority order.
    #[must_use]
    pub fn orderings(&self) -> &[Ordering] {
        &self.orderings
    }

    /// Number of results to skip.
    #[must_use]
    pub fn offset(&self) -> Option<&Expression> {
        self.offset.as_ref()
    }

    /// Maximum number of results.
    #[must_use]
    pub fn limit(&self) -> Option<&Expression> {
        self.limit.as_ref()
    }

    /// Predicate matching the discriminator values of every concrete type at
    /// or below `entity_type`.
    ///
    /// Returns `None` when `entity_type` is not part of this select's
    /// hierarchy, when the hierarchy has no discriminator, or when no concrete
    /// type exists below it.
    #[must_use]
    pub fn discriminator_predicate(&self, entity_type: EntityTypeId) -> Option<Expression> {
        if !self.model.entity_type(self.entity_type).is_assignable_from(entity_type) {
            return None;
        }
        let ty = self.model.entity_type(entity_type);
        let column = ty.property(ty.discriminator_property()?)?.store_name()?;
        let access = Expression::key_access(self.from.clone(), column);

        let mut predicate: Option<Expression> = None;
        for concrete in ty.concrete_types_in_hierarchy() {
            let value = self.model.entity_type(*concrete).discriminator_value()?;
            let clause = access.clone().equal(value.clone());
            predicate = Some(match predicate {
                None => clause,
                Some(existing) => existing.or_else(clause),
            });
        }
        predicate
    }

    /// Binds a property path on `source` to a store access on this select.
    ///
    /// Returns `None` when `source` is a different query source or the path
    /// does not end at a persisted property reachable through embedded
    /// reference navigations.
    #[must_use]
    pub fn bind_property_path<S: AsRef<str>>(
        &self,
        source: &QuerySourceRef,
        path: &[S],
    ) -> Option<Expression> {
        if source.id != self.query_source {
            return None;
        }
        let model = &self.model;
        let mut ty = model.entity_type(self.result_type);
        let mut access = self.from.clone();
        let (last, navigations) = path.split_last()?;

        for name in navigations {
            let navigation = &ty.navigations()[ty.find_navigation(name.as_ref())?];
            let foreign_key = model.foreign_key(navigation.foreign_key());
            if !foreign_key.is_ownership() || navigation.is_on_dependent() || navigation.is_collection() {
                return None;
            }
            let target = model.entity_type(navigation.target());
            if target.is_document_root() {
                return None;
            }
            if model.store_kind() == StoreKind::Document {
                access = Expression::key_access(access, navigation.name());
            }
            ty = target;
        }

        let property = ty.property(ty.find_property(last.as_ref())?)?;
        Some(Expression::key_access(access, property.store_name()?))
    }

    /// Conjoins a predicate onto the filter.
    pub fn add_to_predicate(&mut self, predicate: Expression) {
        self.predicate = Some(match self.predicate.take() {
            None => predicate,
            Some(existing) => Expression::binary(BinaryOp::AndAlso, existing, predicate),
        });
    }

    pub(crate) fn set_result_type(&mut self, entity_type: EntityTypeId) {
        self.result_type = entity_type;
        self.projection = Expression::EntityProjection {
            entity_type,
            access: Box::new(self.from.clone()),
        };
    }

    pub(crate) fn add_ordering(&mut self, expression: Expression, ascending: bool) {
        self.orderings.push(Ordering {
            expression,
            ascending,
        });
    }

    pub(crate) fn set_offset(&mut self, offset: Expression) {
        self.offset = Some(offset);
    }

    pub(crate) fn set_limit(&mut self, limit: Expression) {
        self.limit = Some(limit);
    }

    /// Generates the store query text and collects its parameters.
    pub fn to_sql_query(
        &self,
        generator: &dyn QuerySqlGenerator,
        parameters: &[(String, Value)],
    ) -> CoreResult<SqlQuery> {
        generator.generate(self, parameters)
    }
}

fn collect_columns(model: &Model, ty: &EntityType, columns: &mut Vec<String>) {
    for property in ty.properties() {
        if let Some(name) = property.store_name() {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.to_string());
            }
        }
    }
    for navigation in ty.navigations() {
        if navigation.declaring_type() != ty.id() && ty.base_type().is_some() {
            continue;
        }
        if navigation.is_on_dependent() || !model.foreign_key(navigation.foreign_key()).is_ownership() {
            continue;
        }
        let target = model.entity_type(navigation.target());
        if !target.is_document_root() {
            collect_columns(model, target, columns);
        }
    }
}

impl fmt::Debug for SelectExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectExpression")
            .field("entity_type", &self.entity_type)
            .field("result_type", &self.result_type)
            .field("store_object", &self.store_object)
            .field("predicate", &self.predicate)
            .field("orderings", &self.orderings)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for SelectExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DocumentSqlGenerator.render(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "SELECT {} FROM {}", self.projection, self.store_object),
        }
    }
}
