//! Built-in filter compilers
//!
//! Each compiler takes the filter value and the SQL expression it targets and
//! returns a boolean condition, or `None` when the value asks for nothing.
//! Objects with several operators produce one condition per operator, AND-ed.

use serde_json::{Map, Value};

use crate::data::error::{EngineError, Result};
use crate::data::sql::{SqlFragment, SqlValue};

/// Element types accepted by the in-array filter
pub const ARRAY_ELEMENT_TYPES: &[&str] = &["text", "numeric", "integer", "bigint"];

fn and_all(conditions: Vec<SqlFragment>) -> Option<SqlFragment> {
    match conditions.len() {
        0 => None,
        1 => conditions.into_iter().next(),
        _ => Some(SqlFragment::join(
            conditions.iter().map(SqlFragment::parenthesized),
            " AND ",
        )),
    }
}

fn compare(column: &SqlFragment, op: &str, value: SqlValue, cast: Option<&str>) -> SqlFragment {
    let mut frag = column.clone().sql(" ").sql(op).sql(" ").bind(value);
    if let Some(cast) = cast {
        frag.push_sql("::");
        frag.push_sql(cast);
    }
    frag
}

fn null_check(column: &SqlFragment, filter: &str, value: &Value) -> Result<SqlFragment> {
    match value {
        Value::Bool(true) => Ok(column.clone().sql(" IS NULL")),
        Value::Bool(false) => Ok(column.clone().sql(" IS NOT NULL")),
        other => Err(EngineError::invalid_filter(
            filter,
            format!("_is_null expects a boolean, got {}", other),
        )),
    }
}

/// `= ANY(...)` / `!= ALL(...)` membership against an array parameter
fn membership(column: &SqlFragment, negate: bool, values: SqlValue, array_type: &str) -> SqlFragment {
    let (op, quantifier) = if negate { ("!=", "ALL") } else { ("=", "ANY") };
    column
        .clone()
        .sql(&format!(" {} {}(", op, quantifier))
        .bind(values)
        .sql(&format!("::{}[])", array_type))
}

/// A scalar or array as a list of non-null items
fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

fn operators<'a>(filter: &str, value: &'a Value) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        EngineError::invalid_filter(filter, format!("expected an object of operators, got {}", value))
    })
}

// =============================================================================
// String
// =============================================================================

fn string_operand(filter: &str, op: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(EngineError::invalid_filter(
            filter,
            format!("{} expects a string, got {}", op, other),
        )),
    }
}

fn string_list(filter: &str, op: &str, value: &Value) -> Result<Vec<String>> {
    as_list(value)
        .into_iter()
        .map(|v| string_operand(filter, op, v))
        .collect()
}

/// String filter: a bare string means equality.
///
/// Operators: `_eq _neq _gt _gte _lt _lte _like _ilike _nlike _nilike _regex
/// _iregex _nregex _niregex _in _nin _is_null`.
pub fn string_filter(value: &Value, column: &SqlFragment, filter: &str) -> Result<Option<SqlFragment>> {
    if let Value::String(s) = value {
        return Ok(Some(compare(column, "=", s.as_str().into(), None)));
    }
    let ops = operators(filter, value)?;
    let mut conditions = Vec::new();
    for (op, operand) in ops {
        if operand.is_null() {
            continue;
        }
        let sql_op = match op.as_str() {
            "_eq" => "=",
            "_neq" => "!=",
            "_gt" => ">",
            "_gte" => ">=",
            "_lt" => "<",
            "_lte" => "<=",
            "_like" => "LIKE",
            "_ilike" => "ILIKE",
            "_nlike" => "NOT LIKE",
            "_nilike" => "NOT ILIKE",
            "_regex" => "~",
            "_iregex" => "~*",
            "_nregex" => "!~",
            "_niregex" => "!~*",
            "_in" | "_nin" => {
                let items = string_list(filter, op, operand)?;
                let negate = op == "_nin";
                if items.is_empty() {
                    // Nothing is in the empty set; everything is outside it
                    if !negate {
                        conditions.push(SqlFragment::raw("FALSE"));
                    }
                    continue;
                }
                conditions.push(membership(column, negate, SqlValue::TextArray(items), "text"));
                continue;
            }
            "_is_null" => {
                conditions.push(null_check(column, filter, operand)?);
                continue;
            }
            other => {
                return Err(EngineError::invalid_filter(
                    filter,
                    format!("unknown string operator {}", other),
                ));
            }
        };
        let operand = string_operand(filter, op, operand)?;
        conditions.push(compare(column, sql_op, operand.into(), None));
    }
    Ok(and_all(conditions))
}

// =============================================================================
// Comparison (numbers, dates, anything ordered)
// =============================================================================

fn comparison_operand(filter: &str, op: &str, value: &Value) -> Result<SqlValue> {
    match value {
        Value::Number(_) | Value::String(_) | Value::Bool(_) => Ok(SqlValue::from_json(value)),
        other => Err(EngineError::invalid_filter(
            filter,
            format!("{} expects a scalar, got {}", op, other),
        )),
    }
}

/// Bind a list of scalars as the narrowest array type that holds them all
fn scalar_array(filter: &str, op: &str, items: &[&Value]) -> Result<(SqlValue, &'static str)> {
    if items.iter().all(|v| v.is_i64()) {
        return Ok((
            SqlValue::IntArray(items.iter().filter_map(|v| v.as_i64()).collect()),
            "bigint",
        ));
    }
    if items.iter().all(|v| v.is_number()) {
        return Ok((
            SqlValue::FloatArray(items.iter().filter_map(|v| v.as_f64()).collect()),
            "float8",
        ));
    }
    let texts = items
        .iter()
        .map(|v| string_operand(filter, op, v))
        .collect::<Result<Vec<_>>>()?;
    Ok((SqlValue::TextArray(texts), "text"))
}

fn comparison_with(
    value: &Value,
    column: &SqlFragment,
    filter: &str,
    cast: Option<&str>,
    validate: &dyn Fn(&str, &Value) -> Result<()>,
) -> Result<Option<SqlFragment>> {
    if !value.is_object() {
        validate(filter, value)?;
        let operand = comparison_operand(filter, "_eq", value)?;
        return Ok(Some(compare(column, "=", operand, cast)));
    }
    let ops = operators(filter, value)?;
    let mut conditions = Vec::new();
    for (op, operand) in ops {
        if operand.is_null() {
            continue;
        }
        let sql_op = match op.as_str() {
            "_eq" => "=",
            "_neq" => "!=",
            "_gt" => ">",
            "_gte" => ">=",
            "_lt" => "<",
            "_lte" => "<=",
            "_in" | "_nin" => {
                let items = as_list(operand);
                let negate = op == "_nin";
                if items.is_empty() {
                    if !negate {
                        conditions.push(SqlFragment::raw("FALSE"));
                    }
                    continue;
                }
                for item in &items {
                    validate(filter, item)?;
                }
                let frag = match cast {
                    Some(cast) => {
                        let texts = items
                            .iter()
                            .map(|v| string_operand(filter, op, v))
                            .collect::<Result<Vec<_>>>()?;
                        membership(column, negate, SqlValue::TextArray(texts), cast)
                    }
                    None => {
                        let (values, array_type) = scalar_array(filter, op, &items)?;
                        membership(column, negate, values, array_type)
                    }
                };
                conditions.push(frag);
                continue;
            }
            "_is_null" => {
                conditions.push(null_check(column, filter, operand)?);
                continue;
            }
            other => {
                return Err(EngineError::invalid_filter(
                    filter,
                    format!("unknown comparison operator {}", other),
                ));
            }
        };
        validate(filter, operand)?;
        let operand = comparison_operand(filter, op, operand)?;
        conditions.push(compare(column, sql_op, operand, cast));
    }
    Ok(and_all(conditions))
}

/// Comparison filter: a bare scalar means equality.
///
/// Operators: `_gt _gte _lt _lte _eq _neq _in _nin _is_null`. When `cast` is
/// given every bound value is cast to it (`$1::numeric`).
pub fn comparison_filter(
    value: &Value,
    column: &SqlFragment,
    filter: &str,
    cast: Option<&str>,
) -> Result<Option<SqlFragment>> {
    comparison_with(value, column, filter, cast, &|_, _| Ok(()))
}

/// Accepted date formats: RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` and `YYYY-MM-DD`
pub fn is_iso_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn validate_date(filter: &str, value: &Value) -> Result<()> {
    match value {
        Value::String(s) if is_iso_date(s) => Ok(()),
        other => Err(EngineError::invalid_filter(
            filter,
            format!("expected an ISO-8601 date, got {}", other),
        )),
    }
}

/// Date filter: comparison operators over ISO-8601 strings, compared as `timestamptz`
pub fn date_filter(value: &Value, column: &SqlFragment, filter: &str) -> Result<Option<SqlFragment>> {
    comparison_with(value, column, filter, Some("timestamptz"), &validate_date)
}

// =============================================================================
// Boolean, array, JSONB
// =============================================================================

/// Boolean filter
///
/// `true` compiles to `expr = TRUE`. `false` compiles to `false_fragment` when one
/// is given, otherwise `expr = FALSE`.
pub fn boolean_filter(
    value: &Value,
    column: &SqlFragment,
    filter: &str,
    false_fragment: Option<&SqlFragment>,
) -> Result<Option<SqlFragment>> {
    match value {
        Value::Bool(true) => Ok(Some(column.clone().sql(" = TRUE"))),
        Value::Bool(false) => Ok(Some(match false_fragment {
            Some(frag) => frag.clone(),
            None => column.clone().sql(" = FALSE"),
        })),
        other => Err(EngineError::invalid_filter(
            filter,
            format!("expected a boolean, got {}", other),
        )),
    }
}

/// In-array filter: a scalar or list, always a set membership test.
///
/// Elements are bound as text and cast to `element_type[]` (default `text`).
pub fn array_filter(
    value: &Value,
    column: &SqlFragment,
    filter: &str,
    element_type: Option<&str>,
) -> Result<Option<SqlFragment>> {
    let element_type = element_type.unwrap_or("text");
    let items = as_list(value);
    if items.is_empty() {
        return Ok(match value {
            Value::Array(_) => Some(SqlFragment::raw("FALSE")),
            _ => None,
        });
    }
    let texts = items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(EngineError::invalid_filter(
                filter,
                format!("expected scalar array elements, got {}", other),
            )),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(membership(column, false, SqlValue::TextArray(texts), element_type)))
}

/// JSONB containment: `expr @> $1::jsonb`. An empty object matches everything.
pub fn jsonb_contains_filter(
    value: &Value,
    column: &SqlFragment,
    filter: &str,
) -> Result<Option<SqlFragment>> {
    match value {
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(_) | Value::Array(_) => Ok(Some(
            column
                .clone()
                .sql(" @> ")
                .bind(SqlValue::Json(value.clone()))
                .sql("::jsonb"),
        )),
        other => Err(EngineError::invalid_filter(
            filter,
            format!("expected an object, got {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col() -> SqlFragment {
        SqlFragment::identifier(&["users", "name"])
    }

    #[test]
    fn test_bare_string_is_equality() {
        let q = string_filter(&json!("Bob"), &col(), "name")
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."name" = $1"#);
        assert_eq!(q.values, vec![SqlValue::Text("Bob".into())]);
    }

    #[test]
    fn test_ilike_is_deterministic() {
        let value = json!({ "_ilike": "%bo%" });
        let a = string_filter(&value, &col(), "name").unwrap().unwrap().to_query();
        let b = string_filter(&value, &col(), "name").unwrap().unwrap().to_query();
        assert_eq!(a, b);
        assert_eq!(a.text, r#""users"."name" ILIKE $1"#);
    }

    #[test]
    fn test_string_operators_are_anded() {
        let q = string_filter(&json!({ "_nlike": "a%", "_is_null": false }), &col(), "name")
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(
            q.text,
            r#"("users"."name" NOT LIKE $1) AND ("users"."name" IS NOT NULL)"#
        );
    }

    #[test]
    fn test_in_normalizes_scalar() {
        let q = string_filter(&json!({ "_in": "Bob" }), &col(), "name")
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."name" = ANY($1::text[])"#);
        assert_eq!(q.values, vec![SqlValue::TextArray(vec!["Bob".into()])]);

        let q = string_filter(&json!({ "_nin": ["a", "b"] }), &col(), "name")
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."name" != ALL($1::text[])"#);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let q = string_filter(&json!({ "_in": [] }), &col(), "name").unwrap().unwrap();
        assert_eq!(q.to_query().text, "FALSE");
        assert!(string_filter(&json!({ "_nin": [] }), &col(), "name").unwrap().is_none());
    }

    #[test]
    fn test_unknown_string_operator() {
        let err = string_filter(&json!({ "_contains": "x" }), &col(), "name").unwrap_err();
        assert!(matches!(err, EngineError::InvalidFilter { .. }));
    }

    #[test]
    fn test_comparison_filter() {
        let age = SqlFragment::identifier(&["users", "age"]);
        let q = comparison_filter(&json!({ "_gte": 18, "_lt": 65 }), &age, "age", None)
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#"("users"."age" >= $1) AND ("users"."age" < $2)"#);
        assert_eq!(q.values, vec![SqlValue::Int(18), SqlValue::Int(65)]);

        let q = comparison_filter(&json!({ "_in": [1, 2] }), &age, "age", None)
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."age" = ANY($1::bigint[])"#);

        let q = comparison_filter(&json!(3), &age, "age", Some("numeric"))
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."age" = $1::numeric"#);
    }

    #[test]
    fn test_date_filter() {
        let created = SqlFragment::identifier(&["users", "created_at"]);
        let q = date_filter(&json!({ "_gt": "2022-01-01" }), &created, "createdAt")
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."created_at" > $1::timestamptz"#);

        let err = date_filter(&json!({ "_gt": "yesterday" }), &created, "createdAt").unwrap_err();
        assert!(matches!(err, EngineError::InvalidFilter { .. }));
        assert!(is_iso_date("2022-01-01T10:00:00Z"));
        assert!(is_iso_date("2022-01-01 10:00:00"));
    }

    #[test]
    fn test_boolean_filter() {
        let adult = SqlFragment::raw("(users.age >= 18)");
        let q = boolean_filter(&json!(true), &adult, "isAdult", None).unwrap().unwrap();
        assert_eq!(q.to_query().text, "(users.age >= 18) = TRUE");

        let absent = SqlFragment::raw("users.deleted_at IS NULL");
        let q = boolean_filter(&json!(false), &adult, "isAdult", Some(&absent))
            .unwrap()
            .unwrap();
        assert_eq!(q.to_query().text, "users.deleted_at IS NULL");

        assert!(boolean_filter(&json!("yes"), &adult, "isAdult", None).is_err());
    }

    #[test]
    fn test_array_filter() {
        let id = SqlFragment::identifier(&["users", "id"]);
        let q = array_filter(&json!([1, 2]), &id, "ids", Some("integer"))
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."id" = ANY($1::integer[])"#);
        assert_eq!(
            q.values,
            vec![SqlValue::TextArray(vec!["1".into(), "2".into()])]
        );

        let q = array_filter(&json!("x"), &id, "ids", None).unwrap().unwrap();
        assert_eq!(q.to_query().text, r#""users"."id" = ANY($1::text[])"#);
    }

    #[test]
    fn test_jsonb_contains_filter() {
        let settings = SqlFragment::identifier(&["users", "settings"]);
        let q = jsonb_contains_filter(&json!({ "theme": "dark" }), &settings, "settings")
            .unwrap()
            .unwrap()
            .to_query();
        assert_eq!(q.text, r#""users"."settings" @> $1::jsonb"#);
        assert_eq!(q.values, vec![SqlValue::Json(json!({ "theme": "dark" }))]);
        assert!(jsonb_contains_filter(&json!({}), &settings, "settings").unwrap().is_none());
    }
}
