//! Ad-hoc tables
//!
//! Turns in-memory records into a queryable CTE by unnesting a bound JSON array:
//!
//! ```sql
//! WITH "items" AS (SELECT (x.value->>'id')::numeric AS "id"
//! , (x.value->>'name')::text AS "name" FROM JSONB_ARRAY_ELEMENTS($1::jsonb) x)
//! , "userQuery" AS (
//! SELECT * FROM items JOIN users ON users.id = items.id)
//! SELECT * FROM "userQuery"
//! ```
//!
//! Further CTEs can be chained with [`SqlWith::with`] (more records) and
//! [`SqlWith::as_query`] (any statement, e.g. `UPDATE ... RETURNING`). Each one may
//! reference the CTEs declared before it. [`SqlWith::run`] splits the root records
//! into batches and runs every batch inside a single transaction.

use std::sync::Arc;

use serde_json::Value;

use crate::core::config::LoaderConfig;
use crate::core::constants::{DEFAULT_BATCH_SIZE, USER_QUERY_CTE};
use crate::data::error::{EngineError, Result};
use crate::data::executor::{Row, SqlExecutor, SqlTransaction};
use crate::data::sql::{PostgresDialect, SqlDialect, SqlFragment, SqlValue};

type Confirmation = dyn Fn(&[Row]) -> Result<bool> + Send + Sync;

/// Options for [`SqlWith::run`]
#[derive(Clone)]
pub struct RunOptions {
    pub db: Option<Arc<dyn SqlExecutor>>,
    /// Root records per statement
    pub batch_size: usize,
    /// Render and log the statements without running them
    pub dry_run: bool,
    confirmation: Option<Arc<Confirmation>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            db: None,
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            confirmation: None,
        }
    }
}

impl From<&LoaderConfig> for RunOptions {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            ..Default::default()
        }
    }
}

impl RunOptions {
    pub fn new(db: Arc<dyn SqlExecutor>) -> Self {
        Self {
            db: Some(db),
            ..Default::default()
        }
    }

    pub fn db(mut self, db: Arc<dyn SqlExecutor>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Gate the commit on the accumulated rows.
    ///
    /// Returning `false` or an error rolls back every batch.
    pub fn confirmation<F>(mut self, confirmation: F) -> Self
    where
        F: Fn(&[Row]) -> Result<bool> + Send + Sync + 'static,
    {
        self.confirmation = Some(Arc::new(confirmation));
        self
    }
}

#[derive(Debug, Clone)]
enum CteSource {
    Records { rows: Vec<Row>, empty_value: Option<Row> },
    Query(SqlFragment),
}

/// A chain of CTEs rooted at an in-memory dataset
#[derive(Debug, Clone)]
pub struct SqlWith {
    name: String,
    rows: Vec<Row>,
    ctes: Vec<(String, CteSource)>,
}

impl SqlWith {
    pub fn new(name: impl Into<String>, rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            name: name.into(),
            rows: rows.into_iter().collect(),
            ctes: Vec::new(),
        }
    }

    /// Chain another dataset; `empty_value` stands in for an empty one
    pub fn with(
        mut self,
        name: impl Into<String>,
        rows: impl IntoIterator<Item = Row>,
        empty_value: Option<Row>,
    ) -> Result<Self> {
        let name = self.check_name(name.into())?;
        self.ctes.push((
            name,
            CteSource::Records {
                rows: rows.into_iter().collect(),
                empty_value,
            },
        ));
        Ok(self)
    }

    /// Chain a statement that can read every CTE declared so far
    pub fn as_query(mut self, name: impl Into<String>, query: SqlFragment) -> Result<Self> {
        let name = self.check_name(name.into())?;
        self.ctes.push((name, CteSource::Query(query)));
        Ok(self)
    }

    fn check_name(&self, name: String) -> Result<String> {
        if self.names().any(|n| n == name) {
            return Err(EngineError::duplicate("Fragment", &name));
        }
        Ok(name)
    }

    /// CTE names in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.ctes.iter().map(|(n, _)| n.as_str()))
    }

    /// `WITH ...` over root records `skip..skip + take`, without a trailing statement
    pub fn get_query(&self, skip: usize, take: usize) -> SqlFragment {
        let end = skip.saturating_add(take).min(self.rows.len());
        let batch = self.rows.get(skip..end).unwrap_or_default();

        let mut query = SqlFragment::raw("WITH ")
            .frag(&SqlFragment::identifier(&[&self.name]))
            .sql(" AS (")
            .frag(&records_query(&self.name, batch))
            .sql(")");
        for (name, source) in &self.ctes {
            let body = match source {
                CteSource::Query(query) => query.clone(),
                CteSource::Records { rows, empty_value } => match (rows.is_empty(), empty_value) {
                    (true, Some(empty)) => records_query(name, std::slice::from_ref(empty)),
                    _ => records_query(name, rows),
                },
            };
            query = query
                .sql(", ")
                .frag(&SqlFragment::identifier(&[name]))
                .sql(" AS (\n")
                .frag(&body)
                .sql(")");
        }
        query
    }

    /// One statement per batch, each ending in `SELECT * FROM "userQuery"`
    pub fn statements(&self, user_query: &SqlFragment, batch_size: usize) -> Result<Vec<SqlFragment>> {
        if batch_size == 0 {
            return Err(EngineError::InvalidArgument("batch size must be positive".into()));
        }
        if self.names().any(|n| n == USER_QUERY_CTE) {
            return Err(EngineError::duplicate("Fragment", USER_QUERY_CTE));
        }
        let batches = self.rows.len().div_ceil(batch_size).max(1);
        Ok((0..batches)
            .map(|i| {
                self.get_query(i * batch_size, batch_size)
                    .sql(", ")
                    .frag(&SqlFragment::identifier(&[USER_QUERY_CTE]))
                    .sql(" AS (\n")
                    .frag(user_query)
                    .sql(")\nSELECT * FROM ")
                    .frag(&SqlFragment::identifier(&[USER_QUERY_CTE]))
            })
            .collect())
    }

    /// Run `user_query` over every batch of root records in one transaction
    /// and return the accumulated rows
    pub async fn run(&self, user_query: SqlFragment, options: RunOptions) -> Result<Vec<Row>> {
        let statements = self.statements(&user_query, options.batch_size)?;

        if options.dry_run {
            for (i, statement) in statements.iter().enumerate() {
                let query = statement.to_query();
                tracing::info!(
                    batch = i + 1,
                    batches = statements.len(),
                    params = query.values.len(),
                    sql = %query.text,
                    "Dry run"
                );
            }
            return Ok(Vec::new());
        }

        let db = options.db.as_ref().ok_or(EngineError::MissingDatabase)?;
        tracing::debug!(
            name = %self.name,
            records = self.rows.len(),
            batches = statements.len(),
            "Running ad-hoc table query"
        );

        let mut tx = db.begin().await?;
        let result = run_batches(tx.as_mut(), &statements, options.confirmation.as_deref()).await;
        match result {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "Rolling back ad-hoc table query");
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn run_batches(
    tx: &mut dyn SqlTransaction,
    statements: &[SqlFragment],
    confirmation: Option<&Confirmation>,
) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for statement in statements {
        rows.extend(tx.any(&statement.to_query()).await?);
    }
    if let Some(confirm) = confirmation
        && !confirm(&rows)?
    {
        return Err(EngineError::ConfirmationRejected);
    }
    Ok(rows)
}

/// `SELECT (x.value->>'key')::type AS "key" ... FROM JSONB_ARRAY_ELEMENTS($1::jsonb) x`
fn records_query(name: &str, rows: &[Row]) -> SqlFragment {
    let Some(first) = rows.first() else {
        tracing::warn!(table = %name, "No records for ad-hoc table, selecting a placeholder row");
        return SqlFragment::raw("(SELECT 1 AS value)");
    };

    let columns = first.keys().map(|key| {
        SqlFragment::raw("(x.value->>")
            .frag(&SqlFragment::literal(key))
            .sql(")::")
            .sql(column_type(rows, key))
            .sql(" AS ")
            .frag(&SqlFragment::identifier(&[key]))
    });
    let data = Value::Array(rows.iter().cloned().map(Value::Object).collect());

    SqlFragment::raw("SELECT ")
        .frag(&SqlFragment::join(columns, "\n, "))
        .sql(" FROM ")
        .sql(PostgresDialect.json_array_elements())
        .sql("(")
        .bind(SqlValue::Json(data))
        .sql("::jsonb) x")
}

/// Cast for `key`, taken from the first record holding a non-null value
fn column_type(rows: &[Row], key: &str) -> &'static str {
    match rows.iter().filter_map(|row| row.get(key)).find(|v| !v.is_null()) {
        Some(Value::Number(_)) => "numeric",
        Some(Value::Bool(_)) => "bool",
        _ => "text",
    }
}
