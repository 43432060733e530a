//! Table references used when mapping filters onto columns

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::data::error::{EngineError, Result};
use crate::data::sql::SqlFragment;
use crate::domain::filters::FilterInput;

static LEADING_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^FROM\s*"?(\w+)"#).expect("Invalid regex"));
static TRAILING_ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(AS|\))\s+"?(\w+)"?\s*$"#).expect("Invalid regex"));

/// Find the main table name in a rendered FROM clause.
///
/// `FROM users ...` yields `users`; for subqueries the trailing alias
/// (`FROM (...) AS t`) is used instead.
pub fn parse_table_name(from_sql: &str) -> Option<String> {
    LEADING_TABLE
        .captures(from_sql)
        .and_then(|c| c.get(1))
        .or_else(|| TRAILING_ALIAS.captures(from_sql).and_then(|c| c.get(2)))
        .map(|m| m.as_str().to_string())
}

/// The main table plus declared aliases
///
/// `_main` always resolves to the main table unless explicitly re-aliased.
/// Aliases that were never declared are rejected.
#[derive(Debug, Clone, Default)]
pub struct TableRefs {
    main: Option<String>,
    aliases: HashMap<String, String>,
}

impl TableRefs {
    pub fn new(main: Option<String>) -> Self {
        Self {
            main,
            aliases: HashMap::new(),
        }
    }

    /// Name of the main table, when one could be determined
    pub fn main_table(&self) -> Option<&str> {
        self.main.as_deref()
    }

    pub fn set_alias(&mut self, alias: impl Into<String>, table: impl Into<String>) {
        self.aliases.insert(alias.into(), table.into());
    }

    fn resolve(&self, alias: &str) -> Result<&str> {
        if let Some(table) = self.aliases.get(alias) {
            return Ok(table.as_str());
        }
        match (alias, self.main.as_deref()) {
            ("_main", Some(main)) => Ok(main),
            (alias, Some(main)) if alias == main => Ok(main),
            _ => Err(EngineError::UnknownAlias(alias.to_string())),
        }
    }

    /// `"users"` for the `_main` alias of `FROM users`
    pub fn table(&self, alias: &str) -> Result<SqlFragment> {
        Ok(SqlFragment::identifier(&[self.resolve(alias)?]))
    }

    /// `"users"."name"`
    pub fn column(&self, alias: &str, column: &str) -> Result<SqlFragment> {
        Ok(SqlFragment::identifier(&[self.resolve(alias)?, column]))
    }

    /// Shorthand for `table("_main")`
    pub fn main(&self) -> Result<SqlFragment> {
        self.table("_main")
    }
}

type MapperFn = dyn Fn(&TableRefs, &FilterInput<'_>) -> Result<SqlFragment> + Send + Sync;

/// How a registered filter finds the SQL expression it targets
#[derive(Clone)]
pub enum ColumnMapper {
    /// A fixed expression
    Fragment(SqlFragment),
    /// An expression built per call from the view's tables and the filter input
    Fn(Arc<MapperFn>),
}

impl ColumnMapper {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&TableRefs, &FilterInput<'_>) -> Result<SqlFragment> + Send + Sync + 'static,
    {
        Self::Fn(Arc::new(f))
    }

    pub(crate) fn resolve(&self, tables: &TableRefs, input: &FilterInput<'_>) -> Result<SqlFragment> {
        match self {
            Self::Fragment(frag) => Ok(frag.clone()),
            Self::Fn(f) => f(tables, input),
        }
    }
}

impl From<SqlFragment> for ColumnMapper {
    fn from(frag: SqlFragment) -> Self {
        Self::Fragment(frag)
    }
}

impl std::fmt::Debug for ColumnMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fragment(frag) => f.debug_tuple("Fragment").field(frag).finish(),
            Self::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// Column targeted by a filter registered without a mapper.
///
/// Only the first and last dot-separated segments of the key matter, so a filter
/// re-exported as `posts.author.name` still targets `"posts"."name"`. A bare key
/// is qualified with the main table.
pub fn default_column(key: &str, main_table: Option<&str>) -> SqlFragment {
    let mut segments: Vec<&str> = key.split('.').collect();
    if segments.len() > 2 {
        let last = segments[segments.len() - 1];
        segments.truncate(1);
        segments.push(last);
    }
    match (segments.as_slice(), main_table) {
        ([single], Some(table)) => SqlFragment::identifier(&[table, *single]),
        _ => SqlFragment::identifier(&segments),
    }
}
