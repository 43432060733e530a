//! View builder
//!
//! A view owns a FROM clause and everything needed to filter and project it:
//! - named filter interpreters (typed helpers or generic ones)
//! - table aliases used to map filters onto columns
//! - selectable columns and aggregates
//! - authorization constraints that are AND-ed into every WHERE clause
//!
//! Views are configured once with chained builder calls, then shared (usually in an
//! `Arc`) by every loader built on top of them.

mod table;

pub use table::{ColumnMapper, TableRefs, default_column, parse_table_name};

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::data::error::{EngineError, Result};
use crate::data::executor::{Row, SqlExecutor};
use crate::data::sql::SqlFragment;
use crate::domain::filters::interpreters::{
    ARRAY_ELEMENT_TYPES, array_filter, boolean_filter, comparison_filter, date_filter,
    jsonb_contains_filter, string_filter,
};
use crate::domain::filters::{
    Context, FilterInput, FilterOptions, FilterRegistry, FilterTree, Interpreter, interpret_filter,
};

// =============================================================================
// Hooks
// =============================================================================

/// Authorization conditions derived from the request context
#[async_trait]
pub trait Constraints: Send + Sync {
    async fn constraints(&self, ctx: &Context) -> Result<Vec<SqlFragment>>;
}

#[async_trait]
impl<F> Constraints for F
where
    F: Fn(&Context) -> Result<Vec<SqlFragment>> + Send + Sync,
{
    async fn constraints(&self, ctx: &Context) -> Result<Vec<SqlFragment>> {
        self(ctx)
    }
}

/// Rewrites a filter tree before it is interpreted
#[async_trait]
pub trait Preprocessor: Send + Sync {
    async fn preprocess(&self, filter: FilterTree, ctx: &Context) -> Result<FilterTree>;
}

#[async_trait]
impl<F> Preprocessor for F
where
    F: Fn(FilterTree, &Context) -> Result<FilterTree> + Send + Sync,
{
    async fn preprocess(&self, filter: FilterTree, ctx: &Context) -> Result<FilterTree> {
        self(filter, ctx)
    }
}

/// One or several filter names
pub trait FilterNames {
    fn into_names(self) -> Vec<String>;
}

impl FilterNames for &str {
    fn into_names(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl FilterNames for String {
    fn into_names(self) -> Vec<String> {
        vec![self]
    }
}

impl FilterNames for &[&str] {
    fn into_names(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl<const N: usize> FilterNames for [&str; N] {
    fn into_names(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl FilterNames for Vec<String> {
    fn into_names(self) -> Vec<String> {
        self
    }
}

// =============================================================================
// Options and arguments
// =============================================================================

/// View-wide defaults
#[derive(Clone, Default)]
pub struct ViewOptions {
    pub db: Option<Arc<dyn SqlExecutor>>,
    pub filter: FilterOptions,
}

/// Selection for [`View::load`]
#[derive(Debug, Clone)]
pub enum ViewSelect {
    /// Names registered with `set_columns` / `set_aggregates`
    Columns(Vec<String>),
    /// A select list used as-is; `SELECT` is prepended when missing
    Raw(SqlFragment),
}

impl Default for ViewSelect {
    fn default() -> Self {
        Self::Raw(SqlFragment::raw("SELECT *"))
    }
}

/// Arguments for [`View::load`]
#[derive(Clone, Default)]
pub struct ViewLoadArgs {
    pub select: ViewSelect,
    pub filter: FilterTree,
    pub order_by: Option<SqlFragment>,
    pub group_by: Option<SqlFragment>,
    pub take: Option<i64>,
    pub skip: Option<i64>,
    pub ctx: Context,
    pub db: Option<Arc<dyn SqlExecutor>>,
}

/// Selection for [`View::get_filters`]
///
/// `include` and `exclude` take exact names or a prefix ending in `*`; exclusion
/// wins over inclusion.
#[derive(Debug, Clone, Default)]
pub struct GetFiltersOptions<'a> {
    /// Prefix for exported names; a trailing `.` is added when missing
    pub table: Option<&'a str>,
    pub include: &'a [&'a str],
    pub exclude: &'a [&'a str],
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

// =============================================================================
// Field filters
// =============================================================================

type Compile = dyn Fn(&Value, &SqlFragment, &str) -> Result<Option<SqlFragment>> + Send + Sync;

/// Interpreter produced by the typed `add_*_filter` helpers
struct FieldFilter {
    tables: Arc<RwLock<TableRefs>>,
    mapper: Option<ColumnMapper>,
    parenthesize_mapped: bool,
    compile: Arc<Compile>,
}

impl FieldFilter {
    fn column(&self, input: &FilterInput<'_>) -> Result<SqlFragment> {
        let tables = self.tables.read();
        match &self.mapper {
            Some(mapper) => {
                let column = mapper.resolve(&tables, input)?;
                Ok(if self.parenthesize_mapped {
                    column.parenthesized()
                } else {
                    column
                })
            }
            None => Ok(default_column(input.key, tables.main_table())),
        }
    }
}

#[async_trait]
impl Interpreter for FieldFilter {
    async fn interpret(&self, input: &FilterInput<'_>) -> Result<Option<SqlFragment>> {
        let column = self.column(input)?;
        (self.compile)(input.value, &column, input.key)
    }
}

// =============================================================================
// View
// =============================================================================

#[derive(Clone)]
enum FromSource {
    Static(SqlFragment),
    Dynamic(Arc<dyn Fn(&Context) -> SqlFragment + Send + Sync>),
}

/// A reusable FROM source with its filters, columns and constraints
pub struct View {
    from: FromSource,
    tables: Arc<RwLock<TableRefs>>,
    filters: FilterRegistry,
    columns: HashMap<String, SqlFragment>,
    aggregates: HashSet<String>,
    constraints: Option<Arc<dyn Constraints>>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    context: Context,
    options: ViewOptions,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("table", &self.table_name())
            .field("filters", &self.filters)
            .field("columns", &self.columns.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn check_from(from: &SqlFragment) -> Result<Option<String>> {
    let text = from.to_query().text;
    let text = text.trim_start();
    if !text.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("FROM")) {
        return Err(EngineError::config("First part of view must be FROM"));
    }
    Ok(parse_table_name(text))
}

impl View {
    /// Build a view over a fixed FROM clause
    pub fn from_sql(from: SqlFragment) -> Result<Self> {
        let table = check_from(&from)?;
        Ok(Self::with_source(FromSource::Static(from), table))
    }

    /// Build a view whose FROM clause depends on the request context.
    ///
    /// The table name is taken from the clause rendered for an empty context.
    pub fn from_fn<F>(factory: F) -> Result<Self>
    where
        F: Fn(&Context) -> SqlFragment + Send + Sync + 'static,
    {
        let table = check_from(&factory(&Context::new()))?;
        Ok(Self::with_source(FromSource::Dynamic(Arc::new(factory)), table))
    }

    fn with_source(from: FromSource, table: Option<String>) -> Self {
        Self {
            from,
            tables: Arc::new(RwLock::new(TableRefs::new(table))),
            filters: FilterRegistry::new(),
            columns: HashMap::new(),
            aggregates: HashSet::new(),
            constraints: None,
            preprocessors: Vec::new(),
            context: Context::new(),
            options: ViewOptions::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    /// Merge interpreters in; later registrations win
    pub fn add_filters(mut self, filters: &FilterRegistry) -> Self {
        self.filters.extend(filters);
        self
    }

    fn add_field_filter<N, F>(
        mut self,
        names: N,
        mapper: Option<ColumnMapper>,
        parenthesize_mapped: bool,
        compile: F,
    ) -> Result<Self>
    where
        N: FilterNames,
        F: Fn(&Value, &SqlFragment, &str) -> Result<Option<SqlFragment>> + Send + Sync + 'static,
    {
        let names = names.into_names();
        if mapper.is_some() && names.len() > 1 {
            return Err(EngineError::config(
                "If you specify a mapper function you cannot have multiple filter keys",
            ));
        }
        let compile: Arc<Compile> = Arc::new(compile);
        for name in names {
            let interpreter = FieldFilter {
                tables: Arc::clone(&self.tables),
                mapper: mapper.clone(),
                parenthesize_mapped,
                compile: Arc::clone(&compile),
            };
            self.filters.insert(name, Arc::new(interpreter));
        }
        Ok(self)
    }

    /// String operators (`_eq`, `_ilike`, `_regex`, `_in`, ...)
    pub fn add_string_filter<N: FilterNames>(self, names: N, mapper: Option<ColumnMapper>) -> Result<Self> {
        self.add_field_filter(names, mapper, false, string_filter)
    }

    /// Comparison operators; `cast` is applied to every bound value
    pub fn add_comparison_filter<N: FilterNames>(
        self,
        names: N,
        mapper: Option<ColumnMapper>,
        cast: Option<&str>,
    ) -> Result<Self> {
        let cast = cast.map(str::to_string);
        self.add_field_filter(names, mapper, false, move |value, column, filter| {
            comparison_filter(value, column, filter, cast.as_deref())
        })
    }

    /// Comparison operators over ISO-8601 dates
    pub fn add_date_filter<N: FilterNames>(self, names: N, mapper: Option<ColumnMapper>) -> Result<Self> {
        self.add_field_filter(names, mapper, false, date_filter)
    }

    /// `true`/`false` equality; `false_fragment` replaces the `false` branch
    pub fn add_boolean_filter<N: FilterNames>(
        self,
        names: N,
        mapper: Option<ColumnMapper>,
        false_fragment: Option<SqlFragment>,
    ) -> Result<Self> {
        self.add_field_filter(names, mapper, true, move |value, column, filter| {
            boolean_filter(value, column, filter, false_fragment.as_ref())
        })
    }

    /// Set membership; `element_type` is one of `text`, `numeric`, `integer`, `bigint`
    pub fn add_in_array_filter<N: FilterNames>(
        self,
        names: N,
        mapper: Option<ColumnMapper>,
        element_type: Option<&str>,
    ) -> Result<Self> {
        if let Some(ty) = element_type
            && !ARRAY_ELEMENT_TYPES.contains(&ty)
        {
            return Err(EngineError::config(format!(
                "Unsupported array element type {}",
                ty
            )));
        }
        let element_type = element_type.map(str::to_string);
        self.add_field_filter(names, mapper, false, move |value, column, filter| {
            array_filter(value, column, filter, element_type.as_deref())
        })
    }

    /// JSONB containment (`@>`)
    pub fn add_json_contains_filter<N: FilterNames>(
        self,
        names: N,
        mapper: Option<ColumnMapper>,
    ) -> Result<Self> {
        self.add_field_filter(names, mapper, false, jsonb_contains_filter)
    }

    /// Register a caller-supplied interpreter
    pub fn add_generic_filter<I>(mut self, name: impl Into<String>, interpreter: I) -> Self
    where
        I: Interpreter + 'static,
    {
        self.filters.insert(name, Arc::new(interpreter));
        self
    }

    /// Register a synchronous caller-supplied interpreter
    pub fn add_generic_filter_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&FilterInput<'_>) -> Result<Option<SqlFragment>> + Send + Sync + 'static,
    {
        self.filters.insert_fn(name, f);
        self
    }

    /// Export a snapshot of the filters, optionally renamed under a table prefix
    pub fn get_filters(&self, options: &GetFiltersOptions<'_>) -> FilterRegistry {
        let prefix = match options.table {
            Some(table) if !table.is_empty() && !table.ends_with('.') => format!("{}.", table),
            Some(table) => table.to_string(),
            None => String::new(),
        };
        let mut exported = FilterRegistry::new();
        for (key, interpreter) in self.filters.iter() {
            if options.exclude.iter().any(|ex| matches_pattern(key, ex)) {
                continue;
            }
            let included = options.include.is_empty()
                || options.include.iter().any(|inc| matches_pattern(key, inc));
            if !included {
                continue;
            }
            let bare = key.strip_prefix(prefix.as_str()).unwrap_or(key);
            exported.insert(format!("{}{}", prefix, bare), Arc::clone(interpreter));
        }
        exported
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Rewrites applied to every filter tree.
    ///
    /// Only the most recently registered preprocessor runs.
    pub fn set_filter_preprocess<P: Preprocessor + 'static>(mut self, preprocess: P) -> Self {
        self.preprocessors.push(Arc::new(preprocess));
        self
    }

    /// Authorization conditions, AND-ed ahead of every user filter
    pub fn set_constraints<C: Constraints + 'static>(mut self, constraints: C) -> Self {
        self.constraints = Some(Arc::new(constraints));
        self
    }

    // -------------------------------------------------------------------------
    // Tables, columns, context
    // -------------------------------------------------------------------------

    pub fn set_table_aliases<'a, I>(self, aliases: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        {
            let mut tables = self.tables.write();
            for (alias, table) in aliases {
                tables.set_alias(alias, table);
            }
        }
        self
    }

    /// Snapshot of the table references
    pub fn tables(&self) -> TableRefs {
        self.tables.read().clone()
    }

    pub fn table_name(&self) -> Option<String> {
        self.tables.read().main_table().map(str::to_string)
    }

    /// Register selectable expressions by name
    pub fn set_columns<I, K>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlFragment)>,
        K: Into<String>,
    {
        for (name, frag) in columns {
            if !frag.is_empty() {
                self.columns.insert(name.into(), frag);
            }
        }
        self
    }

    /// Register plain columns selected by their own name
    pub fn set_column_names(mut self, names: &[&str]) -> Self {
        for name in names {
            self.columns
                .insert(name.to_string(), SqlFragment::identifier(&[*name]));
        }
        self
    }

    /// Register aggregate expressions. Selecting one groups by every other selected column.
    pub fn set_aggregates<I, K>(mut self, aggregates: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlFragment)>,
        K: Into<String>,
    {
        for (name, frag) in aggregates {
            if !frag.is_empty() {
                let name = name.into();
                self.aggregates.insert(name.clone());
                self.columns.insert(name, frag);
            }
        }
        self
    }

    pub fn column(&self, name: &str) -> Option<&SqlFragment> {
        self.columns.get(name)
    }

    pub fn is_aggregate(&self, name: &str) -> bool {
        self.aggregates.contains(name)
    }

    /// Merge default context values
    pub fn context(mut self, ctx: Context) -> Self {
        self.context.extend(ctx);
        self
    }

    /// Merge options; filter switches are OR-ed with the existing ones
    pub fn options(mut self, options: ViewOptions) -> Self {
        if options.db.is_some() {
            self.options.db = options.db;
        }
        self.options.filter = self.options.filter.union(options.filter);
        self
    }

    pub fn with_db(mut self, db: Arc<dyn SqlExecutor>) -> Self {
        self.options.db = Some(db);
        self
    }

    pub fn db(&self) -> Option<&Arc<dyn SqlExecutor>> {
        self.options.db.as_ref()
    }

    /// View context overlaid with the call context
    pub fn merged_context(&self, ctx: &Context) -> Context {
        let mut merged = self.context.clone();
        for (key, value) in ctx {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    // -------------------------------------------------------------------------
    // Query fragments
    // -------------------------------------------------------------------------

    pub fn get_from_fragment(&self, ctx: &Context) -> SqlFragment {
        match &self.from {
            FromSource::Static(frag) => frag.clone(),
            FromSource::Dynamic(factory) => factory(&self.merged_context(ctx)),
        }
    }

    /// Authorization conditions followed by the compiled filter conditions
    pub async fn get_where_conditions(
        &self,
        filter: &FilterTree,
        ctx: &Context,
        options: FilterOptions,
    ) -> Result<Vec<SqlFragment>> {
        self.where_conditions_with(filter, ctx, options, None).await
    }

    /// Same as [`View::get_where_conditions`] with extra interpreters layered over the view's
    pub(crate) async fn where_conditions_with(
        &self,
        filter: &FilterTree,
        ctx: &Context,
        options: FilterOptions,
        extra: Option<&FilterRegistry>,
    ) -> Result<Vec<SqlFragment>> {
        let ctx = self.merged_context(ctx);
        let options = self.options.filter.union(options);

        let filter = match self.preprocessors.last() {
            Some(preprocess) => preprocess.preprocess(filter.clone(), &ctx).await?,
            None => filter.clone(),
        };

        let mut conditions = match &self.constraints {
            Some(constraints) if !options.bypass_constraints => {
                constraints.constraints(&ctx).await?
            }
            _ => Vec::new(),
        };
        conditions.retain(|c| !c.is_empty());
        let registry = match extra {
            Some(extra) if !extra.is_empty() => {
                let mut merged = self.filters.clone();
                merged.extend(extra);
                Cow::Owned(merged)
            }
            _ => Cow::Borrowed(&self.filters),
        };
        conditions.extend(interpret_filter(&filter, &registry, &ctx, options).await?);
        Ok(conditions)
    }

    /// `WHERE (a) AND (b)`, or `WHERE TRUE` when nothing applies
    pub async fn get_where_fragment(
        &self,
        filter: &FilterTree,
        ctx: &Context,
        options: FilterOptions,
    ) -> Result<SqlFragment> {
        let conditions = self.get_where_conditions(filter, ctx, options).await?;
        Ok(where_fragment(conditions))
    }

    /// Run a query against the view
    pub async fn load(&self, args: &ViewLoadArgs) -> Result<Vec<Row>> {
        let db = args
            .db
            .as_ref()
            .or(self.options.db.as_ref())
            .ok_or(EngineError::MissingDatabase)?;
        if args.take == Some(0) {
            return Ok(Vec::new());
        }
        let query = self.build_load_query(args).await?;
        let query = query.to_query();
        tracing::trace!(sql = %query.text, "View query");
        db.any(&query).await
    }

    async fn build_load_query(&self, args: &ViewLoadArgs) -> Result<SqlFragment> {
        let ctx = self.merged_context(&args.ctx);

        let (select, group_by) = match &args.select {
            ViewSelect::Raw(frag) => (select_prefix(frag), args.group_by.clone()),
            ViewSelect::Columns(names) => {
                let selected: Vec<(&str, &SqlFragment)> = names
                    .iter()
                    .filter_map(|name| self.columns.get(name).map(|frag| (name.as_str(), frag)))
                    .collect();
                let has_aggregates = selected.iter().any(|(name, _)| self.is_aggregate(name));
                if has_aggregates && args.group_by.is_some() {
                    return Err(EngineError::GroupByConflict);
                }
                let group_by = if has_aggregates {
                    let positions: Vec<SqlFragment> = selected
                        .iter()
                        .enumerate()
                        .filter(|(_, (name, _))| !self.is_aggregate(name))
                        .map(|(idx, _)| SqlFragment::raw((idx + 1).to_string()))
                        .collect();
                    (!positions.is_empty()).then(|| SqlFragment::join(positions, ", "))
                } else {
                    args.group_by.clone()
                };
                let select = SqlFragment::raw("SELECT ").frag(&SqlFragment::join(
                    selected.into_iter().map(|(_, frag)| frag.clone()),
                    "\n, ",
                ));
                (select, group_by)
            }
        };

        let conditions = self
            .get_where_conditions(&args.filter, &ctx, FilterOptions::default())
            .await?;
        tracing::debug!(
            view = ?self.table_name(),
            conditions = conditions.len(),
            take = ?args.take,
            skip = ?args.skip,
            "Loading view"
        );

        let mut query = select
            .sql(" ")
            .frag(&self.get_from_fragment(&ctx))
            .sql(" ")
            .frag(&where_fragment(conditions));
        if let Some(group_by) = group_by {
            query = query.sql("\nGROUP BY ").frag(&group_by);
        }
        if let Some(order_by) = &args.order_by {
            query = query.sql("\nORDER BY ").frag(order_by);
        }
        if let Some(take) = args.take.filter(|t| *t > 0) {
            query = query.sql("\nLIMIT ").bind(take);
        }
        if let Some(skip) = args.skip.filter(|s| *s > 0) {
            query = query.sql("\nOFFSET ").bind(skip);
        }
        Ok(query)
    }
}

/// Join conditions into a WHERE clause that is always syntactically present
pub fn where_fragment(conditions: Vec<SqlFragment>) -> SqlFragment {
    if conditions.is_empty() {
        return SqlFragment::raw("WHERE TRUE");
    }
    SqlFragment::raw("WHERE \n(")
        .frag(&SqlFragment::join(conditions, ")\n AND ("))
        .sql(")\n")
}

fn select_prefix(frag: &SqlFragment) -> SqlFragment {
    let text = frag.to_query().text;
    let head = text.trim_start();
    if head.get(..6).is_some_and(|kw| kw.eq_ignore_ascii_case("SELECT")) {
        frag.clone()
    } else {
        SqlFragment::raw("SELECT ").frag(frag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::RecordingExecutor;
    use crate::data::sql::SqlValue;
    use serde_json::json;

    fn users_view() -> View {
        View::from_sql(SqlFragment::raw("FROM users"))
            .unwrap()
            .add_string_filter(["name", "email"], None)
            .unwrap()
            .add_comparison_filter("id", None, None)
            .unwrap()
            .add_boolean_filter(
                "isAdult",
                Some(SqlFragment::raw("users.age >= 18").into()),
                None,
            )
            .unwrap()
    }

    fn tree(value: serde_json::Value) -> FilterTree {
        FilterTree::from_value(value).unwrap()
    }

    async fn where_sql(view: &View, value: serde_json::Value, options: FilterOptions) -> Result<String> {
        let frag = view
            .get_where_fragment(&tree(value), &Context::new(), options)
            .await?;
        Ok(frag.to_query().text)
    }

    #[test]
    fn test_from_must_come_first() {
        let err = View::from_sql(SqlFragment::raw("SELECT * FROM users")).unwrap_err();
        assert!(err.is_configuration());
        let view = View::from_sql(SqlFragment::raw("  from users")).unwrap();
        assert_eq!(view.table_name().as_deref(), Some("users"));
    }

    #[test]
    fn test_mapper_with_multiple_names_is_rejected() {
        let err = View::from_sql(SqlFragment::raw("FROM users"))
            .unwrap()
            .add_string_filter(["a", "b"], Some(SqlFragment::raw("x").into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_filters_compile_to_true() {
        let sql = where_sql(&users_view(), json!({ "nope": 1, "other": "x" }), FilterOptions::default())
            .await
            .unwrap();
        assert_eq!(sql, "WHERE TRUE");
    }

    #[tokio::test]
    async fn test_where_fragment_layout() {
        let sql = where_sql(
            &users_view(),
            json!({ "name": "Bob", "isAdult": true }),
            FilterOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            sql,
            "WHERE \n(\"users\".\"name\" = $1)\n AND ((users.age >= 18) = TRUE)\n"
        );
    }

    #[tokio::test]
    async fn test_or_needs_option() {
        let view = users_view();
        let err = where_sql(&view, json!({ "OR": [{ "id": 1 }, { "id": 2 }] }), FilterOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_policy());

        let sql = where_sql(
            &view,
            json!({ "OR": [{ "id": 1 }, { "id": 2 }] }),
            FilterOptions::or_enabled(),
        )
        .await
        .unwrap();
        assert!(sql.contains(r#"("users"."id" = $1)) OR (("users"."id" = $2)"#));
    }

    #[tokio::test]
    async fn test_view_level_or_option() {
        let view = users_view().options(ViewOptions {
            db: None,
            filter: FilterOptions::or_enabled(),
        });
        assert!(
            where_sql(&view, json!({ "OR": [{ "id": 1 }] }), FilterOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_constraints_come_first_and_can_be_bypassed() {
        let view = users_view().set_constraints(|ctx: &Context| {
            let user_id = ctx.get("userId").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok::<_, EngineError>(vec![SqlFragment::raw("users.id = ").bind(user_id)])
        });
        let ctx: Context = json!({ "userId": 7 }).as_object().cloned().unwrap();

        let conditions = view
            .get_where_conditions(
                &tree(json!({ "OR": [{ "name": "a" }, { "name": "b" }] })),
                &ctx,
                FilterOptions::or_enabled(),
            )
            .await
            .unwrap();
        assert_eq!(conditions.len(), 2);
        let first = conditions[0].to_query();
        assert_eq!(first.text, "users.id = $1");
        assert_eq!(first.values, vec![SqlValue::Int(7)]);

        let bypassed = view
            .get_where_conditions(
                &FilterTree::new(),
                &ctx,
                FilterOptions {
                    bypass_constraints: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(bypassed.is_empty());
    }

    #[tokio::test]
    async fn test_only_last_preprocessor_runs() {
        let view = users_view()
            .set_filter_preprocess(|mut tree: FilterTree, _: &Context| {
                tree.set("name", json!("first"));
                Ok::<_, EngineError>(tree)
            })
            .set_filter_preprocess(|mut tree: FilterTree, _: &Context| {
                tree.set("id", json!(2));
                Ok::<_, EngineError>(tree)
            });
        let sql = where_sql(&view, json!({}), FilterOptions::default()).await.unwrap();
        assert_eq!(sql, "WHERE \n(\"users\".\"id\" = $1)\n");
    }

    #[tokio::test]
    async fn test_add_filters_last_wins() {
        let first = FilterRegistry::new()
            .with_fn("flag", |_: &FilterInput<'_>| Ok(Some(SqlFragment::raw("first"))));
        let second = FilterRegistry::new()
            .with_fn("flag", |_: &FilterInput<'_>| Ok(Some(SqlFragment::raw("second"))));
        let view = users_view().add_filters(&first).add_filters(&second);
        let sql = where_sql(&view, json!({ "flag": true }), FilterOptions::default())
            .await
            .unwrap();
        assert_eq!(sql, "WHERE \n(second)\n");
    }

    #[tokio::test]
    async fn test_get_filters_prefixes_and_filters() {
        let view = users_view();
        let exported = view.get_filters(&GetFiltersOptions {
            table: Some("author"),
            include: &[],
            exclude: &["is*"],
        });
        let names: Vec<&str> = exported.names().collect();
        assert_eq!(names, vec!["author.email", "author.id", "author.name"]);

        let posts = View::from_sql(SqlFragment::raw(
            "FROM posts LEFT JOIN users author ON author.id = posts.author_id",
        ))
        .unwrap()
        .add_filters(&exported);
        let sql = where_sql(&posts, json!({ "author.name": "Bob" }), FilterOptions::default())
            .await
            .unwrap();
        assert_eq!(sql, "WHERE \n(\"author\".\"name\" = $1)\n");

        let only = view.get_filters(&GetFiltersOptions {
            include: &["id"],
            ..Default::default()
        });
        assert_eq!(only.names().collect::<Vec<_>>(), vec!["id"]);
    }

    #[tokio::test]
    async fn test_mapper_uses_aliases_set_later() {
        let view = View::from_sql(SqlFragment::raw("FROM users u"))
            .unwrap()
            .add_string_filter(
                "fullName",
                Some(ColumnMapper::from_fn(|tables, _| {
                    Ok(SqlFragment::raw("CONCAT(")
                        .frag(&tables.column("person", "first_name")?)
                        .sql(", ")
                        .frag(&tables.column("person", "last_name")?)
                        .sql(")"))
                })),
            )
            .unwrap()
            .set_table_aliases([("person", "u")]);
        let sql = where_sql(&view, json!({ "fullName": "Ann Lee" }), FilterOptions::default())
            .await
            .unwrap();
        assert_eq!(
            sql,
            "WHERE \n(CONCAT(\"u\".\"first_name\", \"u\".\"last_name\") = $1)\n"
        );

        let unknown = View::from_sql(SqlFragment::raw("FROM users"))
            .unwrap()
            .add_string_filter(
                "x",
                Some(ColumnMapper::from_fn(|tables, _| tables.column("ghost", "x"))),
            )
            .unwrap();
        let err = where_sql(&unknown, json!({ "x": "1" }), FilterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownAlias(_)));
    }

    #[tokio::test]
    async fn test_dynamic_from() {
        let view = View::from_fn(|ctx: &Context| {
            match ctx.get("archive").and_then(|v| v.as_bool()) {
                Some(true) => SqlFragment::raw("FROM users_archive users"),
                _ => SqlFragment::raw("FROM users"),
            }
        })
        .unwrap();
        assert_eq!(view.table_name().as_deref(), Some("users"));
        let ctx: Context = json!({ "archive": true }).as_object().cloned().unwrap();
        assert_eq!(
            view.get_from_fragment(&ctx).to_query().text,
            "FROM users_archive users"
        );
    }

    #[tokio::test]
    async fn test_load_requires_db() {
        let err = users_view().load(&ViewLoadArgs::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingDatabase));
    }

    #[tokio::test]
    async fn test_load_take_zero_skips_query() {
        let db = RecordingExecutor::new();
        let view = users_view().with_db(Arc::new(db.clone()));
        let rows = view
            .load(&ViewLoadArgs {
                take: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(db.queries().is_empty());
    }

    #[tokio::test]
    async fn test_load_groups_by_non_aggregates() {
        let db = RecordingExecutor::new();
        db.respond(vec![json!({ "name": "Bob", "postsCount": 3 })]);
        let view = users_view()
            .set_columns([("name", SqlFragment::raw("users.name AS \"name\""))])
            .set_aggregates([("postsCount", SqlFragment::raw("COUNT(*) AS \"postsCount\""))])
            .with_db(Arc::new(db.clone()));

        let rows = view
            .load(&ViewLoadArgs {
                select: ViewSelect::Columns(vec!["postsCount".into(), "name".into()]),
                take: Some(10),
                skip: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let query = db.last_query().unwrap();
        assert!(query.text.starts_with("SELECT COUNT(*) AS \"postsCount\"\n, users.name AS \"name\" FROM users WHERE TRUE"));
        assert!(query.text.contains("GROUP BY 2"));
        assert!(query.text.contains("LIMIT $1"));
        assert!(query.text.contains("OFFSET $2"));
        assert_eq!(query.values, vec![SqlValue::Int(10), SqlValue::Int(5)]);
    }

    #[tokio::test]
    async fn test_group_by_with_aggregates_conflicts() {
        let view = users_view()
            .set_aggregates([("total", SqlFragment::raw("COUNT(*)"))])
            .with_db(Arc::new(RecordingExecutor::new()));
        let err = view
            .load(&ViewLoadArgs {
                select: ViewSelect::Columns(vec!["total".into()]),
                group_by: Some(SqlFragment::raw("1")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::GroupByConflict));
    }

    #[tokio::test]
    async fn test_raw_select_gets_keyword() {
        let db = RecordingExecutor::new();
        let view = users_view().with_db(Arc::new(db.clone()));
        view.load(&ViewLoadArgs {
            select: ViewSelect::Raw(SqlFragment::raw("users.id")),
            filter: tree(json!({ "id": 3 })),
            order_by: Some(SqlFragment::raw("users.id DESC")),
            ..Default::default()
        })
        .await
        .unwrap();
        let query = db.last_query().unwrap();
        assert!(query.text.starts_with("SELECT users.id FROM users WHERE \n(\"users\".\"id\" = $1)\n"));
        assert!(query.text.ends_with("ORDER BY users.id DESC"));
    }
}
