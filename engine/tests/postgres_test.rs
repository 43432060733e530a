//! End-to-end tests against a live PostgreSQL.
//!
//! Skipped unless `VIEWQL_TEST_POSTGRES_URL` is set. Every test works in a schema
//! of its own and drops it afterwards.

use std::sync::Arc;

use serde_json::{Value, json};
use viewql::domain::loader::SortDirection;
use viewql::{
    CountArgs, CountLoader, EngineError, FilterTree, LoadArgs, PostgresConfig, PostgresService,
    QueryLoader, Row, RunOptions, SqlExecutor, SqlFragment, SqlWith, View,
};

const ENV_TEST_URL: &str = "VIEWQL_TEST_POSTGRES_URL";

struct TestDb {
    service: PostgresService,
    schema: String,
}

impl TestDb {
    async fn connect() -> Option<Self> {
        let Ok(url) = std::env::var(ENV_TEST_URL) else {
            eprintln!("{ENV_TEST_URL} not set, skipping");
            return None;
        };
        let service = PostgresService::init(&PostgresConfig {
            url,
            max_connections: 4,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        let schema = format!("viewql_test_{}", uuid::Uuid::new_v4().simple());

        let setup = [
            format!("CREATE SCHEMA {schema}"),
            format!(
                "CREATE TABLE {schema}.users (id INT PRIMARY KEY, name TEXT, age INT NOT NULL, seen BOOL NOT NULL DEFAULT FALSE)"
            ),
            format!(
                "INSERT INTO {schema}.users (id, name, age) VALUES \
                 (1, 'alice', 31), (2, 'bob', 17), (3, NULL, 45), (4, 'bob', 22), \
                 (5, 'carol', 12), (6, NULL, 60), (7, 'dave', 38)"
            ),
        ];
        for statement in &setup {
            sqlx::query(statement).execute(service.pool()).await.unwrap();
        }
        Some(Self { service, schema })
    }

    fn executor(&self) -> Arc<dyn SqlExecutor> {
        Arc::new(self.service.executor())
    }

    fn from(&self) -> SqlFragment {
        SqlFragment::raw(format!("FROM (SELECT * FROM {}.users) AS users", self.schema))
    }

    fn view(&self) -> View {
        View::from_sql(self.from())
            .unwrap()
            .add_string_filter("name", None)
            .unwrap()
            .add_comparison_filter("age", None, None)
            .unwrap()
            .add_boolean_filter("isAdult", Some(SqlFragment::raw("users.age >= 18").into()), None)
            .unwrap()
            .with_db(self.executor())
    }

    async fn teardown(self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(self.service.pool())
            .await
            .unwrap();
        self.service.close().await;
    }
}

fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect()
}

#[tokio::test]
async fn test_cursor_pages_cover_every_row_once() {
    let Some(db) = TestDb::connect().await else { return };
    let loader = QueryLoader::builder(SqlFragment::raw("users.id, users.name"))
        .view(Arc::new(db.view()))
        .columns(["id", "name"])
        .sortable("id", "users.id")
        .sortable("name", viewql::domain::loader::SortField::column("users.name").nullable())
        .build()
        .unwrap();

    let mut args = LoadArgs::new()
        .take(3)
        .order_by("name", SortDirection::DescNullsLast)
        .order_by("id", SortDirection::Asc);
    let mut seen = Vec::new();
    loop {
        let page = loader.load_pagination(&args).await.unwrap();
        seen.extend(ids(&page.nodes));
        if !page.page_info.has_next_page {
            break;
        }
        args = args.cursor(page.page_info.end_cursor.unwrap());
    }
    assert_eq!(seen, vec![7, 5, 2, 4, 1, 3, 6]);

    db.teardown().await;
}

#[tokio::test]
async fn test_offset_page_with_total_count() {
    let Some(db) = TestDb::connect().await else { return };
    let loader = QueryLoader::builder(SqlFragment::raw("users.*"))
        .view(Arc::new(db.view()))
        .sortable("id", "users.id")
        .default_order_by("id", SortDirection::Asc)
        .build()
        .unwrap();

    let args = LoadArgs {
        take: Some(2),
        skip: Some(1),
        take_count: true,
        filter: FilterTree::new().field("isAdult", json!(true)),
        ..Default::default()
    };
    let page = loader.load_pagination(&args).await.unwrap();
    assert_eq!(ids(&page.nodes), vec![3, 4]);
    assert_eq!(page.page_info.count, Some(5));
    assert!(page.page_info.has_next_page);
    assert!(page.page_info.has_previous_page);

    db.teardown().await;
}

#[tokio::test]
async fn test_counts_in_one_scan() {
    let Some(db) = TestDb::connect().await else { return };
    let counts = CountLoader::new(Arc::new(db.view()))
        .count("all", FilterTree::new())
        .count("adults", FilterTree::new().field("isAdult", json!(true)))
        .count(
            "bobOrCarol",
            FilterTree::new().or(vec![
                FilterTree::new().field("name", json!("bob")),
                FilterTree::new().field("name", json!("carol")),
            ]),
        )
        .load(&CountArgs::default())
        .await
        .unwrap();

    assert_eq!(counts["all"], 7);
    assert_eq!(counts["adults"], 5);
    assert_eq!(counts["bobOrCarol"], 3);

    db.teardown().await;
}

#[tokio::test]
async fn test_rejected_batches_leave_no_changes() {
    let Some(db) = TestDb::connect().await else { return };
    let records: Vec<Row> = (1..=5)
        .map(|id| json!({ "id": id }).as_object().cloned().unwrap())
        .collect();
    let update = SqlFragment::raw(format!(
        "UPDATE {}.users SET seen = TRUE FROM seen_ids WHERE users.id = seen_ids.id RETURNING users.id",
        db.schema
    ));
    let with = SqlWith::new("seen_ids", records)
        .as_query("updated", update)
        .unwrap();

    let err = with
        .run(
            SqlFragment::raw("SELECT * FROM updated"),
            RunOptions::new(db.executor())
                .batch_size(2)
                .confirmation(|rows: &[Row]| Ok(rows.len() < 5)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfirmationRejected));

    let seen: (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM {}.users WHERE seen",
        db.schema
    ))
    .fetch_one(db.service.pool())
    .await
    .unwrap();
    assert_eq!(seen.0, 0);

    let rows = with
        .run(
            SqlFragment::raw("SELECT * FROM updated"),
            RunOptions::new(db.executor()).batch_size(2),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);

    db.teardown().await;
}
