//! Store query generation.

use crate::error::{CoreError, CoreResult};
use crate::query::expression::{BinaryOp, Expression};
use crate::query::select::SelectExpression;
use entiframe_codec::Value;
use serde::Serialize;
use std::fmt::{self, Write};

/// A named query parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlParameter {
    /// Name including the `@` prefix.
    pub name: String,
    /// Bound value.
    pub value: Value,
}

/// Generated query text plus its parameters.
///
/// Serializes to the `{"query": ..., "parameters": [...]}` shape document
/// stores accept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    /// Query text.
    #[serde(rename = "query")]
    pub text: String,
    /// Parameters in first-use order.
    pub parameters: Vec<SqlParameter>,
}

/// Relational SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlDialect {
    /// `[ident]`, `N'text'`, `OFFSET .. FETCH`.
    #[default]
    SqlServer,
    /// `"ident"`, `'text'`, `LIMIT .. OFFSET`.
    Sqlite,
}

impl SqlDialect {
    /// Quotes an identifier.
    #[must_use]
    pub fn quote(self, identifier: &str) -> String {
        match self {
            Self::SqlServer => format!("[{}]", identifier.replace(']', "]]")),
            Self::Sqlite => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    /// Qualified, quoted table name.
    #[must_use]
    pub fn table(self, table: &str, schema: Option<&str>) -> String {
        match (self, schema) {
            (Self::SqlServer, Some(schema)) => format!("{}.{}", self.quote(schema), self.quote(table)),
            _ => self.quote(table),
        }
    }

    /// Renders a literal value.
    pub fn literal(self, value: &Value) -> CoreResult<String> {
        Ok(match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self {
                Self::SqlServer => format!("CAST({} AS bit)", u8::from(*b)),
                Self::Sqlite => u8::from(*b).to_string(),
            },
            Value::Integer(n) => n.to_string(),
            Value::Float(x) if x.is_finite() => format!("{x:?}"),
            Value::Text(text) => {
                let escaped = text.replace('\'', "''");
                match self {
                    Self::SqlServer => format!("N'{escaped}'"),
                    Self::Sqlite => format!("'{escaped}'"),
                }
            }
            Value::Bytes(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
                match self {
                    Self::SqlServer => format!("0x{hex}"),
                    Self::Sqlite => format!("X'{hex}'"),
                }
            }
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "{} cannot be written as a SQL literal",
                    other.type_name()
                )))
            }
        })
    }

    /// Statement that reports the rows affected by the previous statement.
    #[must_use]
    pub fn rowcount_check(self) -> &'static str {
        match self {
            Self::SqlServer => "SELECT @@ROWCOUNT;",
            Self::Sqlite => "SELECT changes();",
        }
    }
}

/// Turns a [`SelectExpression`] into store query text.
pub trait QuerySqlGenerator: Send + Sync + fmt::Debug {
    /// Generates the query, binding `parameters` by name.
    fn generate(
        &self,
        select: &SelectExpression,
        parameters: &[(String, Value)],
    ) -> CoreResult<SqlQuery>;
}

/// Document store SQL: `SELECT c FROM root c WHERE c["Prop"] = ...`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentSqlGenerator;

impl DocumentSqlGenerator {
    /// Renders the query text without binding parameters.
    pub fn render(&self, select: &SelectExpression) -> CoreResult<String> {
        let mut writer = Writer::new(Flavor::Document, select);
        writer.select()?;
        Ok(writer.text)
    }
}

impl QuerySqlGenerator for DocumentSqlGenerator {
    fn generate(
        &self,
        select: &SelectExpression,
        parameters: &[(String, Value)],
    ) -> CoreResult<SqlQuery> {
        let mut writer = Writer::new(Flavor::Document, select);
        writer.select()?;
        writer.finish(parameters)
    }
}

/// Relational SQL in one of the supported dialects.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationalSqlGenerator {
    dialect: SqlDialect,
}

impl RelationalSqlGenerator {
    /// Creates a generator for `dialect`.
    #[must_use]
    pub const fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    /// The dialect in use.
    #[must_use]
    pub const fn dialect(&self) -> SqlDialect {
        self.dialect
    }
}

impl QuerySqlGenerator for RelationalSqlGenerator {
    fn generate(
        &self,
        select: &SelectExpression,
        parameters: &[(String, Value)],
    ) -> CoreResult<SqlQuery> {
        let mut writer = Writer::new(Flavor::Relational(self.dialect), select);
        writer.select()?;
        writer.finish(parameters)
    }
}

#[derive(Clone, Copy)]
enum Flavor {
    Document,
    Relational(SqlDialect),
}

struct Writer<'a> {
    flavor: Flavor,
    select: &'a SelectExpression,
    text: String,
    parameters: Vec<String>,
}

impl<'a> Writer<'a> {
    fn new(flavor: Flavor, select: &'a SelectExpression) -> Self {
        Self {
            flavor,
            select,
            text: String::new(),
            parameters: Vec::new(),
        }
    }

    fn fail(&self, message: impl Into<String>) -> CoreError {
        let name = self.select.model().entity_type(self.select.entity_type()).name();
        CoreError::translation_failed(name, message)
    }

    fn finish(self, values: &[(String, Value)]) -> CoreResult<SqlQuery> {
        let mut parameters = Vec::with_capacity(self.parameters.len());
        for name in &self.parameters {
            let value = values
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| self.fail(format!("no value supplied for parameter '@{name}'")))?;
            parameters.push(SqlParameter {
                name: format!("@{name}"),
                value,
            });
        }
        Ok(SqlQuery {
            text: self.text,
            parameters,
        })
    }

    fn select(&mut self) -> CoreResult<()> {
        let select = self.select;
        let paged = select.offset().is_some() || select.limit().is_some();

        self.text.push_str("SELECT ");
        if let (Flavor::Relational(SqlDialect::SqlServer), None, Some(limit)) =
            (self.flavor, select.offset(), select.limit())
        {
            self.text.push_str("TOP(");
            self.expression(limit)?;
            self.text.push_str(") ");
        }
        self.expression(select.projection())?;

        self.text.push_str("\nFROM ");
        match self.flavor {
            Flavor::Document => {
                let _ = write!(self.text, "root {}", select.alias());
            }
            Flavor::Relational(dialect) => {
                let _ = write!(
                    self.text,
                    "{} AS {}",
                    dialect.table(select.store_object(), select.schema()),
                    dialect.quote(select.alias())
                );
            }
        }

        if let Some(predicate) = select.predicate() {
            self.text.push_str("\nWHERE ");
            self.expression(predicate)?;
        }

        let needs_order = matches!(self.flavor, Flavor::Relational(SqlDialect::SqlServer))
            && select.offset().is_some();
        if !select.orderings().is_empty() {
            self.text.push_str("\nORDER BY ");
            for (i, ordering) in select.orderings().iter().enumerate() {
                if i > 0 {
                    self.text.push_str(", ");
                }
                self.expression(&ordering.expression)?;
                if !ordering.ascending {
                    self.text.push_str(" DESC");
                }
            }
        } else if needs_order {
            self.text.push_str("\nORDER BY (SELECT 1)");
        }

        if paged {
            self.paging()?;
        }
        Ok(())
    }

    fn paging(&mut self) -> CoreResult<()> {
        let select = self.select;
        match self.flavor {
            Flavor::Document => {
                self.text.push_str("\nOFFSET ");
                match select.offset() {
                    Some(offset) => self.expression(offset)?,
                    None => self.text.push('0'),
                }
                self.text.push_str(" LIMIT ");
                match select.limit() {
                    Some(limit) => self.expression(limit)?,
                    None => {
                        let _ = write!(self.text, "{}", i32::MAX);
                    }
                }
            }
            Flavor::Relational(SqlDialect::SqlServer) => {
                if let Some(offset) = select.offset() {
                    self.text.push_str("\nOFFSET ");
                    self.expression(offset)?;
                    self.text.push_str(" ROWS");
                    if let Some(limit) = select.limit() {
                        self.text.push_str(" FETCH NEXT ");
                        self.expression(limit)?;
                        self.text.push_str(" ROWS ONLY");
                    }
                }
            }
            Flavor::Relational(SqlDialect::Sqlite) => {
                self.text.push_str("\nLIMIT ");
                match select.limit() {
                    Some(limit) => self.expression(limit)?,
                    None => self.text.push_str("-1"),
                }
                if let Some(offset) = select.offset() {
                    self.text.push_str(" OFFSET ");
                    self.expression(offset)?;
                }
            }
        }
        Ok(())
    }

    fn expression(&mut self, expression: &Expression) -> CoreResult<()> {
        match expression {
            Expression::Constant(value) => {
                let literal = match self.flavor {
                    Flavor::Document => value.to_string(),
                    Flavor::Relational(dialect) => dialect.literal(value)?,
                };
                self.text.push_str(&literal);
            }
            Expression::Parameter(name) => {
                if !self.parameters.contains(name) {
                    self.parameters.push(name.clone());
                }
                let _ = write!(self.text, "@{name}");
            }
            Expression::RootReference { alias, .. } => match self.flavor {
                Flavor::Document => self.text.push_str(alias),
                Flavor::Relational(dialect) => self.text.push_str(&dialect.quote(alias)),
            },
            Expression::KeyAccess { outer, name } => match self.flavor {
                Flavor::Document => {
                    self.expression(outer)?;
                    let _ = write!(self.text, "[\"{name}\"]");
                }
                Flavor::Relational(dialect) => {
                    if !matches!(outer.as_ref(), Expression::RootReference { .. }) {
                        return Err(self.fail(format!("nested access to column '{name}'")));
                    }
                    self.expression(outer)?;
                    let _ = write!(self.text, ".{}", dialect.quote(name));
                }
            },
            Expression::EntityProjection { access, .. } => match self.flavor {
                Flavor::Document => self.expression(access)?,
                Flavor::Relational(dialect) => {
                    let alias = dialect.quote(self.select.alias());
                    let columns: Vec<String> = self
                        .select
                        .columns()
                        .iter()
                        .map(|c| format!("{alias}.{}", dialect.quote(c)))
                        .collect();
                    if columns.is_empty() {
                        self.text.push('*');
                    } else {
                        self.text.push_str(&columns.join(", "));
                    }
                }
            },
            Expression::Binary { op, left, right } => self.binary(*op, left, right)?,
            Expression::Not(inner) => {
                self.text.push_str("NOT (");
                self.expression(inner)?;
                self.text.push(')');
            }
            Expression::QuerySource(_) | Expression::Member { .. } => {
                return Err(self.fail(format!("'{expression}' is not bound to the store query")));
            }
            Expression::Select(_) | Expression::DocumentQuery(_) | Expression::QueryShaper(_) => {
                return Err(self.fail("subqueries are not supported"));
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, left: &Expression, right: &Expression) -> CoreResult<()> {
        let null_test = match (left, right) {
            (operand, Expression::Constant(Value::Null)) | (Expression::Constant(Value::Null), operand)
                if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) =>
            {
                Some(operand)
            }
            _ => None,
        };
        if let (Some(operand), Flavor::Relational(_)) = (null_test, self.flavor) {
            self.text.push('(');
            self.expression(operand)?;
            self.text.push_str(if op == BinaryOp::Equal {
                " IS NULL)"
            } else {
                " IS NOT NULL)"
            });
            return Ok(());
        }

        let symbol = match (op, self.flavor) {
            (BinaryOp::Equal, _) => "=",
            (BinaryOp::NotEqual, Flavor::Document) => "!=",
            (BinaryOp::NotEqual, Flavor::Relational(_)) => "<>",
            (BinaryOp::LessThan, _) => "<",
            (BinaryOp::LessThanOrEqual, _) => "<=",
            (BinaryOp::GreaterThan, _) => ">",
            (BinaryOp::GreaterThanOrEqual, _) => ">=",
            (BinaryOp::AndAlso, _) => "AND",
            (BinaryOp::OrElse, _) => "OR",
        };
        self.text.push('(');
        self.expression(left)?;
        let _ = write!(self.text, " {symbol} ");
        self.expression(right)?;
        self.text.push(')');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, Model, ModelBuilder, ValueKind};
    use crate::types::QuerySourceId;
    use std::sync::Arc;

    fn customer(builder: ModelBuilder) -> Arc<Model> {
        builder
            .entity(
                EntityTypeBuilder::new("Customer")
                    .property("Id", ValueKind::Integer)
                    .property_with(crate::metadata::PropertyBuilder::new("Name", ValueKind::Text).nullable())
                    .key(["Id"])
                    .schema("sales"),
            )
            .owns_one(
                "Customer",
                "Address",
                EntityTypeBuilder::new("Address").property("City", ValueKind::Text),
            )
            .build()
            .unwrap()
    }

    fn select(model: &Arc<Model>) -> SelectExpression {
        let id = model.find_entity_type("Customer").unwrap().id();
        SelectExpression::new(Arc::clone(model), id, QuerySourceId(1))
    }

    fn access(select: &SelectExpression, column: &str) -> Expression {
        Expression::key_access(select.from().clone(), column)
    }

    #[test]
    fn document_query_text() {
        let model = customer(ModelBuilder::document());
        let mut select = select(&model);
        let city = Expression::key_access(access(&select, "Address"), "City");
        select.add_to_predicate(city.clone().equal(Expression::parameter("city")));
        select.add_ordering(access(&select, "Name"), false);
        select.set_limit(Expression::constant(10));

        let query = DocumentSqlGenerator
            .generate(&select, &[("city".to_string(), Value::from("Oslo"))])
            .unwrap();
        assert_eq!(
            query.text,
            "SELECT c\nFROM root c\nWHERE ((c[\"Discriminator\"] = \"Customer\") AND (c[\"Address\"][\"City\"] = @city))\nORDER BY c[\"Name\"] DESC\nOFFSET 0 LIMIT 10"
        );
        assert_eq!(
            query.parameters,
            vec![SqlParameter {
                name: "@city".into(),
                value: Value::from("Oslo")
            }]
        );

        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["parameters"][0]["name"], "@city");
        assert!(json["query"].as_str().unwrap().starts_with("SELECT c"));
    }

    #[test]
    fn missing_parameter_is_translation_failure() {
        let model = customer(ModelBuilder::document());
        let mut select = select(&model);
        select.add_to_predicate(access(&select, "id").equal(Expression::parameter("id")));
        let err = DocumentSqlGenerator.generate(&select, &[]).unwrap_err();
        assert!(matches!(err, CoreError::TranslationFailed { .. }));
    }

    #[test]
    fn sql_server_text() {
        let model = customer(ModelBuilder::relational());
        let mut select = select(&model);
        select.add_to_predicate(access(&select, "Name").equal(Value::Null).negate());
        select.add_to_predicate(access(&select, "Address_City").not_equal("O'Hare"));
        select.set_offset(Expression::parameter("skip"));
        select.set_limit(Expression::constant(5));

        let query = RelationalSqlGenerator::new(SqlDialect::SqlServer)
            .generate(&select, &[("skip".to_string(), Value::Integer(20))])
            .unwrap();
        assert_eq!(
            query.text,
            "SELECT [c].[Id], [c].[Name], [c].[Address_City]\nFROM [sales].[Customer] AS [c]\nWHERE (NOT (([c].[Name] IS NULL)) AND ([c].[Address_City] <> N'O''Hare'))\nORDER BY (SELECT 1)\nOFFSET @skip ROWS FETCH NEXT 5 ROWS ONLY"
        );
    }

    #[test]
    fn sql_server_take_uses_top() {
        let model = customer(ModelBuilder::relational());
        let mut select = select(&model);
        select.set_limit(Expression::constant(1));
        let query = RelationalSqlGenerator::new(SqlDialect::SqlServer).generate(&select, &[]).unwrap();
        assert!(query.text.starts_with("SELECT TOP(1) [c].[Id]"));
        assert!(!query.text.contains("OFFSET"));
    }

    #[test]
    fn sqlite_text() {
        let model = customer(ModelBuilder::relational());
        let mut select = select(&model);
        select.add_to_predicate(access(&select, "Id").greater_than(3));
        select.add_ordering(access(&select, "Id"), true);
        select.set_offset(Expression::constant(2));

        let query = RelationalSqlGenerator::new(SqlDialect::Sqlite).generate(&select, &[]).unwrap();
        assert_eq!(
            query.text,
            "SELECT \"c\".\"Id\", \"c\".\"Name\", \"c\".\"Address_City\"\nFROM \"Customer\" AS \"c\"\nWHERE (\"c\".\"Id\" > 3)\nORDER BY \"c\".\"Id\"\nLIMIT -1 OFFSET 2"
        );
    }

    #[test]
    fn literals() {
        assert_eq!(SqlDialect::SqlServer.literal(&Value::Bool(true)).unwrap(), "CAST(1 AS bit)");
        assert_eq!(SqlDialect::Sqlite.literal(&Value::Bool(false)).unwrap(), "0");
        assert_eq!(SqlDialect::Sqlite.literal(&Value::Bytes(vec![0xab, 1])).unwrap(), "X'AB01'");
        assert_eq!(SqlDialect::SqlServer.literal(&Value::Float(1.0)).unwrap(), "1.0");
        assert!(SqlDialect::Sqlite.literal(&Value::Float(f64::NAN)).is_err());
        assert!(SqlDialect::Sqlite.literal(&Value::empty_object()).is_err());
    }
}
