//! In-process evaluation of bound expressions against documents and rows.

use crate::error::{CoreError, CoreResult};
use crate::query::expression::{BinaryOp, Expression};
use entiframe_codec::Value;
use std::cmp::Ordering;

static NULL: Value = Value::Null;

/// Evaluates a bound expression against one document or row.
///
/// Missing properties read as null. Comparisons involving null or values of
/// unrelated kinds are false, except `null = null`.
pub fn evaluate(
    expression: &Expression,
    row: &Value,
    parameters: &[(String, Value)],
) -> CoreResult<Value> {
    match expression {
        Expression::Constant(value) => Ok(value.clone()),
        Expression::Binary { op, left, right } => binary(*op, left, right, row, parameters),
        Expression::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, row, parameters)?))),
        other => resolve(other, row, parameters).map(Clone::clone),
    }
}

/// Whether a predicate holds for a document or row.
pub fn matches(predicate: &Expression, row: &Value, parameters: &[(String, Value)]) -> CoreResult<bool> {
    evaluate(predicate, row, parameters).map(|v| truthy(&v))
}

/// Orders two documents or rows by a list of `(expression, ascending)` terms.
///
/// Nulls sort first; unordered pairs compare equal.
pub fn compare_rows(
    terms: &[(&Expression, bool)],
    a: &Value,
    b: &Value,
    parameters: &[(String, Value)],
) -> CoreResult<Ordering> {
    for (expression, ascending) in terms {
        let left = resolve(expression, a, parameters)?;
        let right = resolve(expression, b, parameters)?;
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => left.compare(right).unwrap_or(Ordering::Equal),
        };
        let ordering = if *ascending { ordering } else { ordering.reverse() };
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

fn resolve<'a>(
    expression: &Expression,
    row: &'a Value,
    parameters: &'a [(String, Value)],
) -> CoreResult<&'a Value> {
    match expression {
        Expression::Parameter(name) => parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| CoreError::invalid_operation(format!("no value for parameter '@{name}'"))),
        Expression::RootReference { .. } => Ok(row),
        Expression::EntityProjection { access, .. } => resolve(access, row, parameters),
        Expression::KeyAccess { outer, name } => {
            let outer = resolve(outer, row, parameters)?;
            Ok(outer.get(name).unwrap_or(&NULL))
        }
        Expression::Constant(_) => Err(CoreError::invalid_operation(
            "constants are evaluated by value",
        )),
        other => Err(CoreError::invalid_operation(format!(
            "'{other}' cannot be evaluated against a row"
        ))),
    }
}

fn binary(
    op: BinaryOp,
    left: &Expression,
    right: &Expression,
    row: &Value,
    parameters: &[(String, Value)],
) -> CoreResult<Value> {
    match op {
        BinaryOp::AndAlso => {
            if !truthy(&evaluate(left, row, parameters)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(right, row, parameters)?)))
        }
        BinaryOp::OrElse => {
            if truthy(&evaluate(left, row, parameters)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(right, row, parameters)?)))
        }
        _ => {
            let l = evaluate(left, row, parameters)?;
            let r = evaluate(right, row, parameters)?;
            let result = match op {
                BinaryOp::Equal => l.loose_eq(&r),
                BinaryOp::NotEqual => !l.loose_eq(&r),
                BinaryOp::LessThan => l.compare(&r) == Some(Ordering::Less),
                BinaryOp::LessThanOrEqual => {
                    matches!(l.compare(&r), Some(Ordering::Less | Ordering::Equal))
                }
                BinaryOp::GreaterThan => l.compare(&r) == Some(Ordering::Greater),
                BinaryOp::GreaterThanOrEqual => {
                    matches!(l.compare(&r), Some(Ordering::Greater | Ordering::Equal))
                }
                BinaryOp::AndAlso | BinaryOp::OrElse => false,
            };
            Ok(Value::Bool(result))
        }
    }
}

fn truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityTypeId;

    fn root() -> Expression {
        Expression::RootReference {
            alias: "c".into(),
            entity_type: EntityTypeId(0),
        }
    }

    fn doc() -> Value {
        Value::object([
            ("id", Value::from(1)),
            ("Age", Value::from(30)),
            ("Address", Value::object([("City", "Oslo")])),
            ("Nickname", Value::Null),
        ])
    }

    #[test]
    fn nested_access_and_comparisons() {
        let city = Expression::key_access(Expression::key_access(root(), "Address"), "City");
        assert!(matches(&city.clone().equal("Oslo"), &doc(), &[]).unwrap());
        assert!(!matches(&city.equal("Bergen"), &doc(), &[]).unwrap());

        let age = Expression::key_access(root(), "Age");
        assert!(matches(&age.clone().greater_than_or_equal(30), &doc(), &[]).unwrap());
        assert!(matches(&age.clone().less_than(Value::Float(30.5)), &doc(), &[]).unwrap());
        assert!(!matches(&age.greater_than("x"), &doc(), &[]).unwrap());
    }

    #[test]
    fn missing_reads_as_null() {
        let missing = Expression::key_access(Expression::key_access(root(), "Nope"), "Deeper");
        assert!(matches(&missing.equal(Value::Null), &doc(), &[]).unwrap());
        let nickname = Expression::key_access(root(), "Nickname");
        assert!(matches(&nickname.clone().equal(Value::Null), &doc(), &[]).unwrap());
        assert!(!matches(&nickname.less_than(1), &doc(), &[]).unwrap());
    }

    #[test]
    fn logic_and_parameters() {
        let age = Expression::key_access(root(), "Age");
        let predicate = age
            .clone()
            .equal(Expression::parameter("age"))
            .and_also(Expression::constant(true))
            .or_else(Expression::constant(false).negate());
        let params = vec![("age".to_string(), Value::Integer(31))];
        assert!(matches(&predicate, &doc(), &params).unwrap());

        let unbound = age.equal(Expression::parameter("other"));
        assert!(matches(&unbound, &doc(), &params).is_err());
    }

    #[test]
    fn row_ordering() {
        let age = Expression::key_access(root(), "Age");
        let a = Value::object([("Age", 1)]);
        let b = Value::object([("Age", 2)]);
        let n = Value::object([("Age", Value::Null)]);
        assert_eq!(compare_rows(&[(&age, true)], &a, &b, &[]).unwrap(), Ordering::Less);
        assert_eq!(compare_rows(&[(&age, false)], &a, &b, &[]).unwrap(), Ordering::Greater);
        assert_eq!(compare_rows(&[(&age, true)], &n, &a, &[]).unwrap(), Ordering::Less);
    }
}
