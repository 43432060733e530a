//! Sortable columns, ORDER BY rendering and keyset conditions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::data::error::{EngineError, Result};
use crate::data::sql::{PostgresDialect, SqlDialect, SqlFragment, SqlValue};

/// Requested sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
    AscNullsLast,
    DescNullsLast,
}

impl SortDirection {
    pub fn is_desc(self) -> bool {
        matches!(self, Self::Desc | Self::DescNullsLast)
    }

    /// NULLS LAST was asked for explicitly
    pub fn nulls_last(self) -> bool {
        matches!(self, Self::AscNullsLast | Self::DescNullsLast)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
            Self::AscNullsLast => "ASC NULLS LAST",
            Self::DescNullsLast => "DESC NULLS LAST",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortDirection {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.to_ascii_uppercase().as_str() {
            "ASC" => Ok(Self::Asc),
            "DESC" => Ok(Self::Desc),
            "ASC NULLS LAST" => Ok(Self::AscNullsLast),
            "DESC NULLS LAST" => Ok(Self::DescNullsLast),
            _ => Err(EngineError::InvalidArgument(format!(
                "Invalid sort direction {}",
                s
            ))),
        }
    }
}

impl Serialize for SortDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SortDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a sortable name maps onto SQL
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub field: SqlFragment,
    /// Always place NULLs last, whatever the direction
    pub nulls_last: bool,
    /// The expression can be NULL; keyset conditions then account for NULL rows
    pub nullable: bool,
    /// Cast applied to cursor values, e.g. `timestamptz`
    pub cast: Option<String>,
    /// Direction used when the field leads a DISTINCT ON without an explicit order
    pub default_direction: Option<SortDirection>,
}

impl SortField {
    pub fn new(field: SqlFragment) -> Self {
        Self {
            field,
            nulls_last: false,
            nullable: false,
            cast: None,
            default_direction: None,
        }
    }

    /// `"users.id"` → `"users"."id"`
    pub fn column(path: &str) -> Self {
        let segments: Vec<&str> = path.split('.').collect();
        Self::new(SqlFragment::identifier(&segments))
    }

    pub fn qualified(table: &str, column: &str) -> Self {
        Self::new(SqlFragment::identifier(&[table, column]))
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls_last = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn cast(mut self, cast: impl Into<String>) -> Self {
        self.cast = Some(cast.into());
        self
    }

    pub fn default_direction(mut self, direction: SortDirection) -> Self {
        self.default_direction = Some(direction);
        self
    }

    fn bind_value(&self, value: &Value) -> SqlFragment {
        let frag = SqlFragment::param(SqlValue::from_json(value));
        match &self.cast {
            Some(cast) => frag.sql("::").sql(cast),
            None => frag,
        }
    }
}

impl From<&str> for SortField {
    fn from(path: &str) -> Self {
        Self::column(path)
    }
}

impl From<(&str, &str)> for SortField {
    fn from((table, column): (&str, &str)) -> Self {
        Self::qualified(table, column)
    }
}

impl From<SqlFragment> for SortField {
    fn from(field: SqlFragment) -> Self {
        Self::new(field)
    }
}

/// One resolved ORDER BY item
#[derive(Debug, Clone)]
pub(crate) struct OrderTerm {
    pub name: String,
    pub field: SortField,
    pub desc: bool,
    pub nulls_last: bool,
}

impl OrderTerm {
    pub fn new(name: &str, field: &SortField, direction: SortDirection) -> Self {
        let desc = direction.is_desc();
        Self {
            name: name.to_string(),
            field: field.clone(),
            desc,
            nulls_last: direction.nulls_last()
                || field.nulls_last
                || PostgresDialect.nulls_last_by_default(desc),
        }
    }

    /// The same term sorting the other way round, NULL placement included
    pub fn reversed(&self) -> Self {
        Self {
            desc: !self.desc,
            nulls_last: !self.nulls_last,
            ..self.clone()
        }
    }

    fn render(&self) -> SqlFragment {
        self.field
            .field
            .clone()
            .sql(" ")
            .sql(&PostgresDialect.order_direction(self.desc, self.nulls_last))
    }

    /// Rows strictly after `value` in this term's order
    fn after(&self, value: &Value) -> Option<SqlFragment> {
        let column = &self.field.field;
        if value.is_null() {
            // Nothing sorts after a trailing NULL; every value sorts after a leading one
            return (!self.nulls_last).then(|| column.clone().sql(" IS NOT NULL"));
        }
        let op = if self.desc { " < " } else { " > " };
        let cmp = column.clone().sql(op).frag(&self.field.bind_value(value));
        Some(if self.field.nullable && self.nulls_last {
            SqlFragment::raw("(")
                .frag(&cmp)
                .sql(" OR ")
                .frag(column)
                .sql(" IS NULL)")
        } else {
            cmp
        })
    }

    fn equals(&self, value: &Value) -> SqlFragment {
        let column = self.field.field.clone();
        if value.is_null() {
            column.sql(" IS NULL")
        } else {
            column.sql(" = ").frag(&self.field.bind_value(value))
        }
    }
}

/// `ORDER BY a ASC NULLS LAST, b DESC NULLS FIRST`
pub(crate) fn order_by_fragment(terms: &[OrderTerm]) -> Option<SqlFragment> {
    if terms.is_empty() {
        return None;
    }
    Some(SqlFragment::raw("ORDER BY ").frag(&SqlFragment::join(
        terms.iter().map(OrderTerm::render),
        ", ",
    )))
}

/// Condition selecting the rows after a cursor position.
///
/// For terms `t1..tn` this is `(t1 > v1) OR (t1 = v1 AND t2 > v2) OR ...`.
pub(crate) fn keyset_condition(terms: &[OrderTerm], cursor: &Map<String, Value>) -> Result<SqlFragment> {
    let values = terms
        .iter()
        .map(|term| {
            cursor.get(&term.name).ok_or_else(|| {
                EngineError::InvalidCursor(format!("missing value for {}", term.name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut branches = Vec::new();
    for (i, term) in terms.iter().enumerate() {
        let Some(after) = term.after(values[i]) else {
            continue;
        };
        let mut parts: Vec<SqlFragment> = terms[..i]
            .iter()
            .zip(&values)
            .map(|(prev, value)| prev.equals(value))
            .collect();
        parts.push(after);
        branches.push(SqlFragment::join(parts, " AND ").parenthesized());
    }
    if branches.is_empty() {
        return Ok(SqlFragment::raw("FALSE"));
    }
    Ok(SqlFragment::join(branches, " OR "))
}
