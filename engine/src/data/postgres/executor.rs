//! sqlx-backed executor
//!
//! Binds [`SqlValue`]s positionally and decodes result columns into JSON by their
//! Postgres type name.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo, ValueRef};

use crate::data::error::Result;
use crate::data::executor::{Row, SqlExecutor, SqlTransaction};
use crate::data::sql::{Query, SqlValue};

/// Executor over a Postgres connection pool
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn any(&self, query: &Query) -> Result<Vec<Row>> {
        tracing::trace!(sql = %query.text, params = query.values.len(), "Executing query");
        let rows = bind_query(query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl SqlTransaction for PgTransaction {
    async fn any(&mut self, query: &Query) -> Result<Vec<Row>> {
        tracing::trace!(sql = %query.text, params = query.values.len(), "Executing query in transaction");
        let rows = bind_query(query).fetch_all(&mut *self.tx).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn bind_query(query: &Query) -> sqlx::query::Query<'_, Postgres, PgArguments> {
    let mut q = sqlx::query(&query.text);
    for value in &query.values {
        q = match value {
            SqlValue::Null => q.bind(None::<String>),
            SqlValue::Bool(v) => q.bind(*v),
            SqlValue::Int(v) => q.bind(*v),
            SqlValue::Float(v) => q.bind(*v),
            SqlValue::Text(v) => q.bind(v.clone()),
            SqlValue::Json(v) => q.bind(sqlx::types::Json(v.clone())),
            SqlValue::TextArray(v) => q.bind(v.clone()),
            SqlValue::IntArray(v) => q.bind(v.clone()),
            SqlValue::FloatArray(v) => q.bind(v.clone()),
        };
    }
    q
}

fn decode_row(row: &PgRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_column(row, idx));
    }
    out
}

fn decode_column(row: &PgRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(_) => return Value::Null,
    }
    let type_name = row.columns()[idx].type_info().name().to_string();
    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(idx).map(|v| Value::from(v as i64)),
        "INT4" => row.try_get::<i32, _>(idx).map(|v| Value::from(v as i64)),
        "INT8" => row.try_get::<i64, _>(idx).map(Value::from),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| float_value(v as f64)),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(float_value),
        "NUMERIC" => row.try_get::<Decimal, _>(idx).map(decimal_value),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|v| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|v| Value::String(v.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|v| Value::String(v.to_string())),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(idx)
            .map(|v| Value::String(v.to_string())),
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Vec<String>, _>(idx)
            .map(|v| Value::Array(v.into_iter().map(Value::String).collect())),
        "INT4[]" => row
            .try_get::<Vec<i32>, _>(idx)
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        "INT8[]" => row
            .try_get::<Vec<i64>, _>(idx)
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        _ => row.try_get::<String, _>(idx).map(Value::String),
    };
    decoded.unwrap_or_else(|e| {
        tracing::debug!(column = idx, r#type = %type_name, error = %e, "Undecodable column, returning null");
        Value::Null
    })
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Whole numerics become integers, the rest floats
fn decimal_value(v: Decimal) -> Value {
    if v.fract().is_zero()
        && let Some(i) = v.to_i64()
    {
        return Value::from(i);
    }
    v.to_f64().map(float_value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_decimal_value() {
        assert_eq!(decimal_value(Decimal::from(42)), Value::from(42));
        assert_eq!(
            decimal_value(Decimal::from_str("1.5").unwrap()),
            Value::from(1.5)
        );
        assert_eq!(
            decimal_value(Decimal::from_str("-7.000").unwrap()),
            Value::from(-7)
        );
    }

    #[test]
    fn test_float_value_rejects_nan() {
        assert_eq!(float_value(f64::NAN), Value::Null);
        assert_eq!(float_value(2.25), Value::from(2.25));
    }
}
