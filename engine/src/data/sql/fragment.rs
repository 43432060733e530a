//! Parameterized SQL fragments
//!
//! A fragment is an ordered list of raw SQL text, identifiers and bound values.
//! Values are never interpolated into the text: placeholders are numbered only
//! when the fragment is rendered into a [`Query`], so fragments can be nested and
//! joined freely without renumbering.

use serde_json::Value;

use super::{PostgresDialect, SqlDialect};

/// A value bound to a placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

impl SqlValue {
    /// Convert a JSON value into a bind value.
    ///
    /// Scalars map to their natural SQL type; objects and arrays bind as JSON.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Sql(String),
    Ident(Vec<String>),
    Param(SqlValue),
}

/// Parameterized SQL fragment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    parts: Vec<Part>,
}

/// A rendered statement: SQL text with numbered placeholders plus its values
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub values: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw SQL text. Never pass user input here.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Sql(sql.into())],
        }
    }

    /// A single bound value
    pub fn param(value: impl Into<SqlValue>) -> Self {
        Self {
            parts: vec![Part::Param(value.into())],
        }
    }

    /// A (possibly qualified) identifier, e.g. `["users", "id"]` → `"users"."id"`
    pub fn identifier<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            parts: vec![Part::Ident(
                names.iter().map(|n| n.as_ref().to_string()).collect(),
            )],
        }
    }

    /// A string literal with quotes escaped, for names that must be inlined
    pub fn literal(value: &str) -> Self {
        Self::raw(format!("'{}'", value.replace('\'', "''")))
    }

    /// Append raw SQL text
    pub fn sql(mut self, sql: &str) -> Self {
        self.push_sql(sql);
        self
    }

    /// Append a bound value
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.parts.push(Part::Param(value.into()));
        self
    }

    /// Append another fragment
    pub fn frag(mut self, other: &SqlFragment) -> Self {
        self.push_fragment(other);
        self
    }

    pub fn push_sql(&mut self, sql: &str) {
        if sql.is_empty() {
            return;
        }
        if let Some(Part::Sql(last)) = self.parts.last_mut() {
            last.push_str(sql);
        } else {
            self.parts.push(Part::Sql(sql.to_string()));
        }
    }

    pub fn push_fragment(&mut self, other: &SqlFragment) {
        for part in &other.parts {
            match part {
                Part::Sql(s) => self.push_sql(s),
                other => self.parts.push(other.clone()),
            }
        }
    }

    /// Join fragments with a raw separator
    pub fn join<I>(items: I, separator: &str) -> Self
    where
        I: IntoIterator<Item = SqlFragment>,
    {
        let mut out = Self::new();
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                out.push_sql(separator);
            }
            out.push_fragment(&item);
        }
        out
    }

    /// Wrap in parentheses
    pub fn parenthesized(&self) -> Self {
        Self::raw("(").frag(self).sql(")")
    }

    /// The fragment without a leading keyword such as `SELECT`, if it starts with one
    pub fn strip_keyword(&self, keyword: &str) -> Option<SqlFragment> {
        let Some(Part::Sql(first)) = self.parts.first() else {
            return None;
        };
        let trimmed = first.trim_start();
        let head = trimmed.get(..keyword.len())?;
        let rest = &trimmed[keyword.len()..];
        if !head.eq_ignore_ascii_case(keyword)
            || rest.starts_with(|c: char| c.is_alphanumeric() || c == '_')
        {
            return None;
        }
        let mut parts = Vec::with_capacity(self.parts.len());
        let rest = rest.trim_start();
        if !rest.is_empty() {
            parts.push(Part::Sql(rest.to_string()));
        }
        parts.extend(self.parts[1..].iter().cloned());
        Some(Self { parts })
    }

    /// True when the fragment renders to nothing but whitespace
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            Part::Sql(s) => s.trim().is_empty(),
            _ => false,
        })
    }

    /// Render with the given dialect
    pub fn build(&self, dialect: &dyn SqlDialect) -> Query {
        let mut text = String::new();
        let mut values = Vec::new();
        for part in &self.parts {
            match part {
                Part::Sql(s) => text.push_str(s),
                Part::Ident(names) => {
                    let quoted: Vec<String> =
                        names.iter().map(|n| dialect.quote_identifier(n)).collect();
                    text.push_str(&quoted.join("."));
                }
                Part::Param(value) => {
                    values.push(value.clone());
                    text.push_str(&dialect.placeholder(values.len()));
                }
            }
        }
        Query { text, values }
    }

    /// Render with the PostgreSQL dialect
    pub fn to_query(&self) -> Query {
        self.build(&PostgresDialect)
    }
}
