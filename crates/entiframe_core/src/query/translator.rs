//! Query building and translation.
//!
//! A [`Queryable`] records the operators applied to an entity set; the
//! [`QueryTranslator`] binds them against the model into a
//! [`SelectExpression`] wrapped in the terminal nodes that execute and shape
//! it. Translation never performs store I/O.

use crate::config::QueryTrackingBehavior;
use crate::error::{CoreError, CoreResult};
use crate::metadata::{Model, StoreKind};
use crate::query::context::{execute_query, execute_query_async};
use crate::query::expression::{member_chain, Expression, ExpressionRewriter, QuerySourceRef};
use crate::query::materializer::EntityShaper;
use crate::query::select::SelectExpression;
use crate::query::shaper::{DocumentQueryExpression, QueryCall, QueryShaperExpression, RowKind};
use crate::types::QuerySourceId;
use entiframe_codec::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

static NEXT_QUERY_SOURCE: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone)]
enum QueryOperator {
    Filter(Expression),
    OfType(String),
    OrderBy { expression: Expression, ascending: bool },
    Skip(Expression),
    Take(Expression),
}

/// A query over one entity set, built operator by operator.
#[derive(Debug, Clone)]
pub struct Queryable {
    model: Arc<Model>,
    source: QuerySourceRef,
    operators: Vec<QueryOperator>,
    tracking: Option<QueryTrackingBehavior>,
    parameters: Vec<(String, Value)>,
}

impl Queryable {
    /// Starts a query over the entity set of `entity_type`.
    pub fn new(model: Arc<Model>, entity_type: &str) -> CoreResult<Self> {
        let ty = model
            .find_entity_type(entity_type)
            .ok_or_else(|| CoreError::translation_failed(entity_type, "not part of the model"))?;
        if !ty.is_document_root() {
            return Err(CoreError::translation_failed(
                entity_type,
                "owned types can only be queried through their owner",
            ));
        }
        let source = QuerySourceRef {
            id: QuerySourceId(NEXT_QUERY_SOURCE.fetch_add(1, Ordering::Relaxed)),
            entity_type: ty.id(),
        };
        Ok(Self {
            model,
            source,
            operators: Vec::new(),
            tracking: None,
            parameters: Vec::new(),
        })
    }

    /// The query source, for building member expressions.
    #[must_use]
    pub fn source(&self) -> Expression {
        Expression::QuerySource(self.source)
    }

    /// A dotted property path on the query source, e.g. `"Address.City"`.
    #[must_use]
    pub fn property(&self, path: &str) -> Expression {
        path.split('.')
            .fold(self.source(), |expression, member| expression.member(member))
    }

    /// Keeps only results matching `predicate`.
    #[must_use]
    pub fn filter(mut self, predicate: Expression) -> Self {
        self.operators.push(QueryOperator::Filter(predicate));
        self
    }

    /// Keeps only results of `entity_type` or its derived types.
    #[must_use]
    pub fn of_type(mut self, entity_type: impl Into<String>) -> Self {
        self.operators.push(QueryOperator::OfType(entity_type.into()));
        self
    }

    /// Sorts ascending by `key`.
    #[must_use]
    pub fn order_by(mut self, key: Expression) -> Self {
        self.operators.push(QueryOperator::OrderBy {
            expression: key,
            ascending: true,
        });
        self
    }

    /// Sorts descending by `key`.
    #[must_use]
    pub fn order_by_descending(mut self, key: Expression) -> Self {
        self.operators.push(QueryOperator::OrderBy {
            expression: key,
            ascending: false,
        });
        self
    }

    /// Skips the first `count` results.
    #[must_use]
    pub fn skip(mut self, count: impl Into<Expression>) -> Self {
        self.operators.push(QueryOperator::Skip(count.into()));
        self
    }

    /// Returns at most `count` results.
    #[must_use]
    pub fn take(mut self, count: impl Into<Expression>) -> Self {
        self.operators.push(QueryOperator::Take(count.into()));
        self
    }

    /// Returns untracked snapshots regardless of the session default.
    #[must_use]
    pub fn as_no_tracking(mut self) -> Self {
        self.tracking = Some(QueryTrackingBehavior::NoTracking);
        self
    }

    /// Returns tracked results regardless of the session default.
    #[must_use]
    pub fn as_tracking(mut self) -> Self {
        self.tracking = Some(QueryTrackingBehavior::TrackAll);
        self
    }

    /// Supplies the value of parameter `@name`.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.parameters.push((name, value)),
        }
        self
    }

    /// The model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Parameter values supplied so far.
    #[must_use]
    pub fn parameters(&self) -> &[(String, Value)] {
        &self.parameters
    }

    /// Tracking override, if any.
    #[must_use]
    pub fn tracking(&self) -> Option<QueryTrackingBehavior> {
        self.tracking
    }
}

/// Rewrites member chains over the query source into store accesses.
struct PropertyPathBinder<'a> {
    select: &'a SelectExpression,
}

impl PropertyPathBinder<'_> {
    fn entity_name(&self) -> &str {
        self.select.model().entity_type(self.select.result_type()).name()
    }
}

impl ExpressionRewriter for PropertyPathBinder<'_> {
    fn rewrite(&mut self, expression: Expression) -> CoreResult<Expression> {
        match &expression {
            Expression::Member { .. } => {
                let Some((source, path)) = member_chain(&expression) else {
                    return Err(CoreError::translation_failed(
                        self.entity_name(),
                        format!("'{expression}' is not rooted at the query source"),
                    ));
                };
                let bound = self
                    .select
                    .bind_property_path(&source, &path)
                    .ok_or_else(|| CoreError::unbound_property_path(path.join(".")))?;
                trace!(path = %path.join("."), bound = %bound, "property path bound");
                Ok(bound)
            }
            Expression::QuerySource(_) => Err(CoreError::translation_failed(
                self.entity_name(),
                "whole entities cannot be compared; compare a key property instead",
            )),
            Expression::Select(_) | Expression::DocumentQuery(_) | Expression::QueryShaper(_) => {
                Err(CoreError::translation_failed(
                    self.entity_name(),
                    "subqueries are not supported",
                ))
            }
            _ => self.rewrite_children(expression),
        }
    }
}

/// Translates [`Queryable`]s into executable shaper expressions.
#[derive(Debug, Clone)]
pub struct QueryTranslator {
    model: Arc<Model>,
}

impl QueryTranslator {
    /// Creates a translator for `model`.
    #[must_use]
    pub fn new(model: Arc<Model>) -> Self {
        Self { model }
    }

    /// Translates `query`.
    ///
    /// `is_async` selects which execution function is captured; the resulting
    /// expression can only be enumerated on that path.
    pub fn translate(
        &self,
        query: &Queryable,
        is_async: bool,
        default_tracking: QueryTrackingBehavior,
    ) -> CoreResult<QueryShaperExpression> {
        if !Arc::ptr_eq(&self.model, &query.model) {
            return Err(CoreError::invalid_operation(
                "query was built against a different model",
            ));
        }
        let model = &self.model;
        let mut select = SelectExpression::new(
            Arc::clone(model),
            query.source.entity_type,
            query.source.id,
        );

        for operator in &query.operators {
            self.apply(&mut select, operator)?;
        }

        let row_kind = match model.store_kind() {
            StoreKind::Document => RowKind::Document,
            StoreKind::Relational => RowKind::Row,
        };
        let call = if is_async {
            QueryCall::Async(execute_query_async)
        } else {
            QueryCall::Sync(execute_query)
        };
        let tracking =
            query.tracking.unwrap_or(default_tracking) == QueryTrackingBehavior::TrackAll;
        debug!(
            entity_type = %model.entity_type(select.result_type()).name(),
            store_object = %select.store_object(),
            is_async,
            tracking,
            "query translated"
        );
        let shaper = EntityShaper::new(select.result_type(), tracking, row_kind);
        QueryShaperExpression::new(
            DocumentQueryExpression::new(Arc::new(select), call, row_kind),
            shaper,
        )
    }

    fn apply(&self, select: &mut SelectExpression, operator: &QueryOperator) -> CoreResult<()> {
        let entity_name = self.model.entity_type(select.result_type()).name().to_string();
        let paged = select.offset().is_some() || select.limit().is_some();
        match operator {
            QueryOperator::Filter(predicate) => {
                if paged {
                    return Err(CoreError::translation_failed(
                        entity_name,
                        "filters after skip or take are not supported",
                    ));
                }
                let bound = PropertyPathBinder { select }.rewrite(predicate.clone())?;
                select.add_to_predicate(bound);
            }
            QueryOperator::OfType(name) => {
                if paged {
                    return Err(CoreError::translation_failed(
                        entity_name,
                        "type filters after skip or take are not supported",
                    ));
                }
                let target = self
                    .model
                    .find_entity_type(name)
                    .ok_or_else(|| CoreError::translation_failed(name, "not part of the model"))?;
                let current = self.model.entity_type(select.result_type());
                if !current.is_assignable_from(target.id()) {
                    return Err(CoreError::translation_failed(
                        name,
                        format!("not derived from '{}'", current.name()),
                    ));
                }
                if target.id() != select.result_type() {
                    let predicate = select.discriminator_predicate(target.id()).ok_or_else(|| {
                        CoreError::translation_failed(
                            name,
                            "no discriminator distinguishes it from its base type",
                        )
                    })?;
                    select.add_to_predicate(predicate);
                    select.set_result_type(target.id());
                }
            }
            QueryOperator::OrderBy {
                expression,
                ascending,
            } => {
                if paged {
                    return Err(CoreError::translation_failed(
                        entity_name,
                        "ordering after skip or take is not supported",
                    ));
                }
                let bound = PropertyPathBinder { select }.rewrite(expression.clone())?;
                if bound.is_value() {
                    return Err(CoreError::translation_failed(
                        entity_name,
                        "ordering by a constant",
                    ));
                }
                select.add_ordering(bound, *ascending);
            }
            QueryOperator::Skip(count) => {
                check_count(&entity_name, "skip", count)?;
                if paged {
                    return Err(CoreError::translation_failed(
                        entity_name,
                        "skip after skip or take is not supported",
                    ));
                }
                select.set_offset(count.clone());
            }
            QueryOperator::Take(count) => {
                check_count(&entity_name, "take", count)?;
                if select.limit().is_some() {
                    return Err(CoreError::translation_failed(
                        entity_name,
                        "take after take is not supported",
                    ));
                }
                select.set_limit(count.clone());
            }
        }
        Ok(())
    }
}

fn check_count(entity_name: &str, operator: &str, count: &Expression) -> CoreResult<()> {
    match count {
        Expression::Constant(Value::Integer(n)) if *n >= 0 => Ok(()),
        Expression::Parameter(_) => Ok(()),
        other => Err(CoreError::translation_failed(
            entity_name,
            format!("{operator} expects a non-negative integer, got '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, ModelBuilder, ValueKind};
    use crate::query::sql::{DocumentSqlGenerator, QuerySqlGenerator, RelationalSqlGenerator, SqlDialect};

    fn animals() -> Arc<Model> {
        ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Animal")
                    .abstract_type()
                    .property("Id", ValueKind::Integer)
                    .property("Name", ValueKind::Text)
                    .key(["Id"]),
            )
            .entity(EntityTypeBuilder::new("Dog").base("Animal").property("GoodBoy", ValueKind::Bool))
            .entity(EntityTypeBuilder::new("Cat").base("Animal"))
            .entity(
                EntityTypeBuilder::new("Owner")
                    .property("Id", ValueKind::Integer)
                    .key(["Id"]),
            )
            .owns_one(
                "Owner",
                "Address",
                EntityTypeBuilder::new("Address").property("City", ValueKind::Text),
            )
            .build()
            .unwrap()
    }

    fn text(shaper: &QueryShaperExpression, generator: &dyn QuerySqlGenerator) -> String {
        shaper.query().select().to_sql_query(generator, &[]).unwrap().text
    }

    #[test]
    fn filter_binds_nested_property_paths() {
        let model = animals();
        let query = Queryable::new(Arc::clone(&model), "Owner").unwrap();
        let query = query.clone().filter(query.property("Address.City").equal("Oslo"));
        let shaper = QueryTranslator::new(model)
            .translate(&query, false, QueryTrackingBehavior::TrackAll)
            .unwrap();
        assert!(!shaper.query().is_async());
        assert!(shaper.shaper().is_tracking());
        assert_eq!(
            text(&shaper, &DocumentSqlGenerator),
            "SELECT o\nFROM root o\nWHERE ((o[\"Discriminator\"] = \"Owner\") AND (o[\"Address\"][\"City\"] = \"Oslo\"))"
        );
    }

    #[test]
    fn of_type_narrows_the_discriminator() {
        let model = animals();
        let query = Queryable::new(Arc::clone(&model), "Animal").unwrap().of_type("Dog");
        let query = query.clone().filter(query.property("GoodBoy").equal(true));
        let shaper = QueryTranslator::new(Arc::clone(&model))
            .translate(&query, true, QueryTrackingBehavior::TrackAll)
            .unwrap();
        assert!(shaper.query().is_async());
        assert_eq!(
            shaper.shaper().entity_type(),
            model.find_entity_type("Dog").unwrap().id()
        );
        let predicate = shaper.query().select().predicate().unwrap().to_string();
        assert!(predicate.contains(r#"(a["Discriminator"] = "Dog")"#), "{predicate}");
        assert!(predicate.ends_with(r#"(a["GoodBoy"] = true))"#), "{predicate}");
    }

    #[test]
    fn unrelated_of_type_fails_translation() {
        let model = animals();
        let query = Queryable::new(Arc::clone(&model), "Animal").unwrap().of_type("Owner");
        let err = QueryTranslator::new(model)
            .translate(&query, false, QueryTrackingBehavior::TrackAll)
            .unwrap_err();
        assert!(matches!(err, CoreError::TranslationFailed { .. }));
    }

    #[test]
    fn foreign_source_is_unbound() {
        let model = animals();
        let dogs = Queryable::new(Arc::clone(&model), "Animal").unwrap();
        let owners = Queryable::new(Arc::clone(&model), "Owner").unwrap();
        let query = owners.filter(dogs.property("Name").equal("Rex"));
        let err = QueryTranslator::new(model)
            .translate(&query, false, QueryTrackingBehavior::TrackAll)
            .unwrap_err();
        assert!(matches!(err, CoreError::UnboundPropertyPath { ref path } if path == "Name"));
    }

    #[test]
    fn paging_and_ordering_rules() {
        let model = ModelBuilder::relational()
            .entity(
                EntityTypeBuilder::new("Customer")
                    .property("Id", ValueKind::Integer)
                    .property("Name", ValueKind::Text)
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let query = Queryable::new(Arc::clone(&model), "Customer").unwrap();
        let paged = query
            .clone()
            .order_by_descending(query.property("Name"))
            .skip(10)
            .take(5)
            .as_no_tracking();
        let shaper = QueryTranslator::new(Arc::clone(&model))
            .translate(&paged, false, QueryTrackingBehavior::TrackAll)
            .unwrap();
        assert!(!shaper.shaper().is_tracking());
        assert_eq!(shaper.shaper().row_kind(), RowKind::Row);
        assert_eq!(
            text(&shaper, &RelationalSqlGenerator::new(SqlDialect::Sqlite)),
            "SELECT \"c\".\"Id\", \"c\".\"Name\"\nFROM \"Customer\" AS \"c\"\nORDER BY \"c\".\"Name\" DESC\nLIMIT 5 OFFSET 10"
        );

        let late_filter = query.clone().take(1).filter(query.property("Id").equal(1));
        assert!(QueryTranslator::new(Arc::clone(&model))
            .translate(&late_filter, false, QueryTrackingBehavior::TrackAll)
            .is_err());

        let negative = query.clone().take(-1);
        assert!(QueryTranslator::new(model)
            .translate(&negative, false, QueryTrackingBehavior::TrackAll)
            .is_err());
    }

    #[test]
    fn owned_types_are_not_query_roots() {
        assert!(Queryable::new(animals(), "Address").is_err());
    }
}
