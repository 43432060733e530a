//! Multi-count loader
//!
//! Computes several named counts over a view in a single table scan:
//!
//! ```sql
//! SELECT COUNT(*) FILTER (WHERE "users"."active" = TRUE) AS "active",
//!  COUNT(DISTINCT users.name) FILTER (WHERE TRUE) AS "distinctNames"
//! FROM users
//! ```
//!
//! Labels that are not selected are left out of the statement entirely.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;

use crate::data::error::{EngineError, Result};
use crate::data::executor::SqlExecutor;
use crate::data::sql::SqlFragment;
use crate::domain::filters::{Context, FilterOptions, FilterTree};
use crate::domain::view::{Constraints, View};

/// One named count
#[derive(Debug, Clone, Default)]
pub struct CountSpec {
    /// Rows counted; each count may use `OR` groups
    pub filter: FilterTree,
    /// Argument of `COUNT(...)`, e.g. `DISTINCT users.date_of_birth`. Defaults to `*`.
    pub count: Option<SqlFragment>,
}

impl From<FilterTree> for CountSpec {
    fn from(filter: FilterTree) -> Self {
        Self {
            filter,
            count: None,
        }
    }
}

/// Arguments for [`CountLoader::load`]
#[derive(Clone, Default)]
pub struct CountArgs {
    /// Labels to compute; `None` computes every registered count
    pub select: Option<Vec<String>>,
    pub ctx: Context,
    pub db: Option<Arc<dyn SqlExecutor>>,
}

pub struct CountLoader {
    view: Arc<View>,
    counts: Vec<(String, CountSpec)>,
    constraints: Option<Arc<dyn Constraints>>,
    db: Option<Arc<dyn SqlExecutor>>,
}

impl CountLoader {
    pub fn new(view: Arc<View>) -> Self {
        Self {
            view,
            counts: Vec::new(),
            constraints: None,
            db: None,
        }
    }

    /// Register a count; a label registered twice keeps the latest definition
    pub fn count(mut self, label: impl Into<String>, spec: impl Into<CountSpec>) -> Self {
        let label = label.into();
        let spec = spec.into();
        match self.counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, existing)) => *existing = spec,
            None => self.counts.push((label, spec)),
        }
        self
    }

    /// Conditions for the outer WHERE, shared by every count
    pub fn constraints<C: Constraints + 'static>(mut self, constraints: C) -> Self {
        self.constraints = Some(Arc::new(constraints));
        self
    }

    pub fn db(mut self, db: Arc<dyn SqlExecutor>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.counts.iter().map(|(label, _)| label.as_str())
    }

    /// Build the statement for the selected labels, or `None` when nothing is selected
    pub async fn get_query(&self, select: Option<&[String]>, ctx: &Context) -> Result<Option<SqlFragment>> {
        let selected: Vec<&(String, CountSpec)> = self
            .counts
            .iter()
            .filter(|(label, _)| select.is_none_or(|s| s.contains(label)))
            .collect();
        if selected.is_empty() {
            return Ok(None);
        }

        let columns = try_join_all(selected.iter().map(|(label, spec)| async move {
            let filter = self
                .view
                .get_where_fragment(&spec.filter, ctx, FilterOptions::or_enabled())
                .await?;
            let counted = spec.count.clone().unwrap_or_else(|| SqlFragment::raw("*"));
            Ok::<_, EngineError>(
                SqlFragment::raw("COUNT(")
                    .frag(&counted)
                    .sql(") FILTER (")
                    .frag(&filter)
                    .sql(") AS ")
                    .frag(&SqlFragment::identifier(&[label])),
            )
        }))
        .await?;

        let mut query = SqlFragment::raw("SELECT ")
            .frag(&SqlFragment::join(columns, ",\n "))
            .sql(" ")
            .frag(&self.view.get_from_fragment(ctx));

        let mut conditions = match &self.constraints {
            Some(constraints) => constraints.constraints(ctx).await?,
            None => Vec::new(),
        };
        conditions.retain(|c| !c.is_empty());
        if !conditions.is_empty() {
            query = query
                .sql("\nWHERE (")
                .frag(&SqlFragment::join(conditions, ") AND ("))
                .sql(")");
        }
        Ok(Some(query))
    }

    /// Compute the selected counts in one statement
    pub async fn load(&self, args: &CountArgs) -> Result<BTreeMap<String, i64>> {
        let db = args
            .db
            .as_ref()
            .or(self.db.as_ref())
            .or(self.view.db())
            .ok_or(EngineError::MissingDatabase)?;
        let Some(query) = self.get_query(args.select.as_deref(), &args.ctx).await? else {
            return Ok(BTreeMap::new());
        };
        let query = query.to_query();
        tracing::debug!(view = ?self.view.table_name(), "Loading counts");
        tracing::trace!(sql = %query.text, "Count query");

        let rows = db.any(&query).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(BTreeMap::new());
        };
        Ok(row
            .into_iter()
            .map(|(label, value)| {
                let count = match &value {
                    Value::Number(n) => n.as_i64().unwrap_or_default(),
                    Value::String(s) => s.parse().unwrap_or_default(),
                    _ => 0,
                };
                (label, count)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::RecordingExecutor;
    use serde_json::json;

    fn loader(db: &RecordingExecutor) -> CountLoader {
        let view = View::from_sql(SqlFragment::raw("FROM users"))
            .unwrap()
            .add_boolean_filter(
                "isAdult",
                Some(SqlFragment::raw("users.age >= 18").into()),
                None,
            )
            .unwrap()
            .add_string_filter("name", None)
            .unwrap();
        CountLoader::new(Arc::new(view))
            .count("all", FilterTree::new())
            .count("adults", FilterTree::new().field("isAdult", json!(true)))
            .count(
                "distinctNames",
                CountSpec {
                    count: Some(SqlFragment::raw("DISTINCT users.name")),
                    ..Default::default()
                },
            )
            .db(Arc::new(db.clone()))
    }

    #[tokio::test]
    async fn test_counts_run_in_one_statement() {
        let db = RecordingExecutor::new();
        db.respond(vec![json!({ "all": 10, "adults": 7 })]);

        let counts = loader(&db)
            .load(&CountArgs {
                select: Some(vec!["all".into(), "adults".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts["all"], 10);
        assert_eq!(counts["adults"], 7);

        let queries = db.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0].text,
            "SELECT COUNT(*) FILTER (WHERE TRUE) AS \"all\",\n \
             COUNT(*) FILTER (WHERE \n((users.age >= 18) = TRUE)\n) AS \"adults\" FROM users"
        );
        assert!(!queries[0].text.contains("distinctNames"));
    }

    #[tokio::test]
    async fn test_count_expression_and_or_groups() {
        let db = RecordingExecutor::new();
        let loader = loader(&db).count(
            "bobOrAlice",
            FilterTree::new().or(vec![
                FilterTree::new().field("name", json!("Bob")),
                FilterTree::new().field("name", json!("Alice")),
            ]),
        );
        let query = loader
            .get_query(
                Some(&["distinctNames".to_string(), "bobOrAlice".to_string()]),
                &Context::new(),
            )
            .await
            .unwrap()
            .unwrap()
            .to_query();
        assert!(query.text.starts_with("SELECT COUNT(DISTINCT users.name) FILTER (WHERE TRUE)"));
        assert!(query.text.contains(" OR "));
        assert_eq!(query.values.len(), 2);
    }

    #[tokio::test]
    async fn test_constraints_go_in_outer_where() {
        let db = RecordingExecutor::new();
        let loader = loader(&db).constraints(|ctx: &Context| {
            let org = ctx.get("orgId").cloned().unwrap_or(Value::Null);
            Ok::<_, EngineError>(vec![
                SqlFragment::raw("users.org_id = ").bind(crate::data::sql::SqlValue::from_json(&org)),
            ])
        });
        let ctx: Context = json!({ "orgId": 3 }).as_object().cloned().unwrap();
        let query = loader
            .get_query(Some(&["all".to_string()]), &ctx)
            .await
            .unwrap()
            .unwrap()
            .to_query();
        assert!(query.text.ends_with("FROM users\nWHERE (users.org_id = $1)"));
    }

    #[tokio::test]
    async fn test_nothing_selected_skips_query() {
        let db = RecordingExecutor::new();
        let counts = loader(&db)
            .load(&CountArgs {
                select: Some(vec![]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(counts.is_empty());
        assert!(db.queries().is_empty());
    }

    #[tokio::test]
    async fn test_missing_database() {
        let view = View::from_sql(SqlFragment::raw("FROM users")).unwrap();
        let err = CountLoader::new(Arc::new(view))
            .count("all", FilterTree::new())
            .load(&CountArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingDatabase));
    }
}
