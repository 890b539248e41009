//! Query expression tree.
//!
//! Queries are built as a closed set of expression nodes. Application-level
//! nodes ([`Expression::QuerySource`], [`Expression::Member`]) describe what
//! the caller asked for; store-level nodes ([`Expression::RootReference`],
//! [`Expression::KeyAccess`], [`Expression::Select`], ...) describe what the
//! store will run. Translation rewrites the former into the latter.

use crate::error::CoreResult;
use crate::query::select::SelectExpression;
use crate::query::shaper::{DocumentQueryExpression, QueryShaperExpression};
use crate::types::{EntityTypeId, QuerySourceId};
use entiframe_codec::Value;
use std::fmt;

/// Reference to the entity set a query is rooted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuerySourceRef {
    /// Unique id of the source within its query.
    pub id: QuerySourceId,
    /// Entity type the source yields.
    pub entity_type: EntityTypeId,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// Short-circuit conjunction.
    AndAlso,
    /// Short-circuit disjunction.
    OrElse,
}

impl BinaryOp {
    /// Whether the operator combines two predicates.
    #[must_use]
    pub fn is_logical(self) -> bool {
        matches!(self, Self::AndAlso | Self::OrElse)
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::AndAlso => "AND",
            Self::OrElse => "OR",
        }
    }
}

/// A query expression node.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A literal value.
    Constant(Value),
    /// A named parameter whose value is supplied at execution.
    Parameter(String),
    /// The entity set a query is rooted at.
    QuerySource(QuerySourceRef),
    /// Member access on an application-level expression.
    Member {
        /// Expression the member is read from.
        expression: Box<Expression>,
        /// Property or navigation name.
        member: String,
    },
    /// The store object a select reads from, under its alias.
    RootReference {
        /// Alias used in the generated query.
        alias: String,
        /// Entity type stored in the object.
        entity_type: EntityTypeId,
    },
    /// Access to a named store property: `outer["name"]`.
    KeyAccess {
        /// Object the property is read from.
        outer: Box<Expression>,
        /// Store name of the property.
        name: String,
    },
    /// The entity a select projects.
    EntityProjection {
        /// Entity type being projected.
        entity_type: EntityTypeId,
        /// Access to the object holding the entity.
        access: Box<Expression>,
    },
    /// A binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expression>,
        /// Right operand.
        right: Box<Expression>,
    },
    /// Logical negation.
    Not(Box<Expression>),
    /// A complete store query.
    Select(Box<SelectExpression>),
    /// A store query bound to the call that runs it.
    DocumentQuery(Box<DocumentQueryExpression>),
    /// A store query plus the shaper applied to each result.
    QueryShaper(Box<QueryShaperExpression>),
}

impl Expression {
    /// A constant.
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    /// A parameter reference.
    pub fn parameter(name: impl Into<String>) -> Self {
        Self::Parameter(name.into())
    }

    /// Member access on this expression.
    #[must_use]
    pub fn member(self, member: impl Into<String>) -> Self {
        Self::Member {
            expression: Box::new(self),
            member: member.into(),
        }
    }

    /// `outer["name"]`.
    pub fn key_access(outer: Expression, name: impl Into<String>) -> Self {
        Self::KeyAccess {
            outer: Box::new(outer),
            name: name.into(),
        }
    }

    /// A binary node.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `self = other`
    #[must_use]
    pub fn equal(self, other: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::Equal, self, other.into())
    }

    /// `self != other`
    #[must_use]
    pub fn not_equal(self, other: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::NotEqual, self, other.into())
    }

    /// `self < other`
    #[must_use]
    pub fn less_than(self, other: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::LessThan, self, other.into())
    }

    /// `self <= other`
    #[must_use]
    pub fn less_than_or_equal(self, other: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::LessThanOrEqual, self, other.into())
    }

    /// `self > other`
    #[must_use]
    pub fn greater_than(self, other: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::GreaterThan, self, other.into())
    }

    /// `self >= other`
    #[must_use]
    pub fn greater_than_or_equal(self, other: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::GreaterThanOrEqual, self, other.into())
    }

    /// `self AND other`
    #[must_use]
    pub fn and_also(self, other: Expression) -> Self {
        Self::binary(BinaryOp::AndAlso, self, other)
    }

    /// `self OR other`
    #[must_use]
    pub fn or_else(self, other: Expression) -> Self {
        Self::binary(BinaryOp::OrElse, self, other)
    }

    /// `NOT self`
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Whether the node is a constant or parameter.
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Constant(_) | Self::Parameter(_))
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Self::Constant(value)
    }
}

impl From<i64> for Expression {
    fn from(value: i64) -> Self {
        Self::Constant(Value::Integer(value))
    }
}

impl From<i32> for Expression {
    fn from(value: i32) -> Self {
        Self::Constant(Value::Integer(i64::from(value)))
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        Self::Constant(Value::from(value))
    }
}

impl From<bool> for Expression {
    fn from(value: bool) -> Self {
        Self::Constant(Value::Bool(value))
    }
}

/// Splits `source.A.B.C` into the source and `[A, B, C]`.
///
/// Returns `None` when the chain is not rooted at a query source.
#[must_use]
pub fn member_chain(expression: &Expression) -> Option<(QuerySourceRef, Vec<&str>)> {
    let mut path = Vec::new();
    let mut current = expression;
    loop {
        match current {
            Expression::Member { expression, member } => {
                path.push(member.as_str());
                current = expression;
            }
            Expression::QuerySource(source) => {
                path.reverse();
                return Some((*source, path));
            }
            _ => return None,
        }
    }
}

/// Rewrites an expression tree.
///
/// Implementors override [`ExpressionRewriter::rewrite`] for the nodes they
/// care about and call [`ExpressionRewriter::rewrite_children`] for the rest.
pub trait ExpressionRewriter {
    /// Rewrites one node.
    fn rewrite(&mut self, expression: Expression) -> CoreResult<Expression> {
        self.rewrite_children(expression)
    }

    /// Rewrites the direct children of a node, keeping the node itself.
    fn rewrite_children(&mut self, expression: Expression) -> CoreResult<Expression> {
        Ok(match expression {
            Expression::Member { expression, member } => Expression::Member {
                expression: Box::new(self.rewrite(*expression)?),
                member,
            },
            Expression::KeyAccess { outer, name } => Expression::KeyAccess {
                outer: Box::new(self.rewrite(*outer)?),
                name,
            },
            Expression::EntityProjection {
                entity_type,
                access,
            } => Expression::EntityProjection {
                entity_type,
                access: Box::new(self.rewrite(*access)?),
            },
            Expression::Binary { op, left, right } => Expression::Binary {
                op,
                left: Box::new(self.rewrite(*left)?),
                right: Box::new(self.rewrite(*right)?),
            },
            Expression::Not(inner) => Expression::Not(Box::new(self.rewrite(*inner)?)),
            // store-level containers are rewritten as a unit
            other => other,
        })
    }
}

/// Walks an expression tree without changing it.
pub trait ExpressionVisitor {
    /// Visits one node; the default visits its children.
    fn visit(&mut self, expression: &Expression) {
        walk(self, expression);
    }
}

/// Visits the direct children of `expression`.
pub fn walk<V: ExpressionVisitor + ?Sized>(visitor: &mut V, expression: &Expression) {
    match expression {
        Expression::Member { expression, .. } => visitor.visit(expression),
        Expression::KeyAccess { outer, .. } => visitor.visit(outer),
        Expression::EntityProjection { access, .. } => visitor.visit(access),
        Expression::Binary { left, right, .. } => {
            visitor.visit(left);
            visitor.visit(right);
        }
        Expression::Not(inner) => visitor.visit(inner),
        Expression::Select(select) => walk_select(visitor, select),
        Expression::DocumentQuery(query) => walk_select(visitor, query.select()),
        Expression::QueryShaper(shaper) => walk_select(visitor, shaper.query().select()),
        Expression::Constant(_)
        | Expression::Parameter(_)
        | Expression::QuerySource(_)
        | Expression::RootReference { .. } => {}
    }
}

fn walk_select<V: ExpressionVisitor + ?Sized>(visitor: &mut V, select: &SelectExpression) {
    visitor.visit(select.projection());
    visitor.visit(select.from());
    if let Some(predicate) = select.predicate() {
        visitor.visit(predicate);
    }
    for ordering in select.orderings() {
        visitor.visit(&ordering.expression);
    }
    for limit in [select.offset(), select.limit()].into_iter().flatten() {
        visitor.visit(limit);
    }
}

/// Collects the names of all parameters referenced by an expression.
#[derive(Debug, Default)]
pub struct ParameterCollector {
    /// Names in first-use order.
    pub names: Vec<String>,
}

impl ExpressionVisitor for ParameterCollector {
    fn visit(&mut self, expression: &Expression) {
        if let Expression::Parameter(name) = expression {
            if !self.names.contains(name) {
                self.names.push(name.clone());
            }
        }
        walk(self, expression);
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => write!(f, "{value}"),
            Self::Parameter(name) => write!(f, "@{name}"),
            Self::QuerySource(source) => write!(f, "[{}]", source.id),
            Self::Member { expression, member } => write!(f, "{expression}.{member}"),
            Self::RootReference { alias, .. } => f.write_str(alias),
            Self::KeyAccess { outer, name } => write!(f, "{outer}[\"{name}\"]"),
            Self::EntityProjection { access, .. } => write!(f, "{access}"),
            Self::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Self::Not(inner) => write!(f, "NOT ({inner})"),
            Self::Select(select) => write!(f, "{select}"),
            Self::DocumentQuery(query) => write!(f, "DocumentQuery({})", query.select()),
            Self::QueryShaper(shaper) => write!(f, "Shape({})", shaper.query().select()),
        }
    }
}
