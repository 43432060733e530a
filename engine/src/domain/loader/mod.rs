//! Query loader
//!
//! Composes a [`View`] (or a raw FROM clause) with a select list, sortable
//! columns, virtual fields and plugins, and loads either a flat list of rows or
//! a page with cursors and counts. Every load compiles to one statement, plus an
//! optional count statement for paginated loads.

mod args;
mod cursor;
mod plugins;
mod sortable;
mod virtual_fields;

pub use args::{LoadArgs, PageInfo, PageResult};
pub use cursor::{decode_cursor, encode_cursor};
pub use plugins::{
    LoadDoneHook, LoadKind, LoadOutput, PluginFlow, PluginHooks, PluginSession, QueryPlugin,
    SlowQuery, SlowQueryPlugin,
};
pub use sortable::{SortDirection, SortField};
pub use virtual_fields::{FnVirtualField, ResolveInput, VirtualField};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::{Map, Value};

use self::sortable::{OrderTerm, keyset_condition, order_by_fragment};
use crate::core::config::LoaderConfig;
use crate::core::constants::{
    CURSOR_COLUMN_PREFIX, DEFAULT_MAX_LIMIT, DEFAULT_RUN_CONCURRENCY, DEFAULT_TAKE,
};
use crate::data::error::{EngineError, Result};
use crate::data::executor::{Row, SqlExecutor};
use crate::data::sql::{Query, SqlFragment};
use crate::domain::filters::{
    Context, FilterOptions, FilterRegistry, FilterTree, Interpreter, interpret_filter,
};
use crate::domain::view::{Constraints, View, where_fragment};

type ContextFactory = dyn Fn(Context) -> Result<Context> + Send + Sync;
type GroupByFn = dyn Fn(&LoadArgs) -> Option<SqlFragment> + Send + Sync;

/// Loader-wide defaults
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Allow `OR` groups in request filters
    pub or_enabled: bool,
    pub default_take: i64,
    /// Upper bound for `take`; 0 = unlimited
    pub max_limit: i64,
    /// Rows resolved concurrently while computing virtual fields
    pub run_concurrency: usize,
    pub default_order_by: Vec<(String, SortDirection)>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            or_enabled: false,
            default_take: DEFAULT_TAKE,
            max_limit: DEFAULT_MAX_LIMIT,
            run_concurrency: DEFAULT_RUN_CONCURRENCY,
            default_order_by: Vec::new(),
        }
    }
}

impl From<&LoaderConfig> for LoaderOptions {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            default_take: config.default_take,
            max_limit: config.max_limit,
            run_concurrency: config.run_concurrency,
            ..Self::default()
        }
    }
}

enum Source {
    View(Arc<View>),
    From(SqlFragment),
}

enum GroupBy {
    Fixed(SqlFragment),
    Dynamic(Arc<GroupByFn>),
}

/// Builder for [`QueryLoader`]
pub struct QueryLoaderBuilder {
    select: SqlFragment,
    view: Option<Arc<View>>,
    from: Option<SqlFragment>,
    columns: Vec<String>,
    sortable: BTreeMap<String, SortField>,
    column_groups: BTreeMap<String, Vec<String>>,
    virtual_fields: Vec<(String, Arc<dyn VirtualField>)>,
    plugins: Vec<Arc<dyn QueryPlugin>>,
    filters: FilterRegistry,
    constraints: Option<Arc<dyn Constraints>>,
    group_by: Option<GroupBy>,
    context_factory: Option<Arc<ContextFactory>>,
    db: Option<Arc<dyn SqlExecutor>>,
    options: LoaderOptions,
}

impl QueryLoaderBuilder {
    pub fn view(mut self, view: Arc<View>) -> Self {
        self.view = Some(view);
        self
    }

    /// Raw FROM clause, used instead of a view
    pub fn from(mut self, from: SqlFragment) -> Self {
        self.from = Some(from);
        self
    }

    /// Names of the fields the select list produces
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sortable(mut self, name: impl Into<String>, field: impl Into<SortField>) -> Self {
        self.sortable.insert(name.into(), field.into());
        self
    }

    /// Named field sets selectable through `select_groups`
    pub fn column_group(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        self.column_groups
            .insert(name.into(), fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn virtual_field<V: VirtualField + 'static>(mut self, name: impl Into<String>, field: V) -> Self {
        self.virtual_fields.push((name.into(), Arc::new(field)));
        self
    }

    pub fn plugin<P: QueryPlugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Extra interpreters layered over the view's
    pub fn filter<I: Interpreter + 'static>(mut self, name: impl Into<String>, interpreter: I) -> Self {
        self.filters.insert(name, Arc::new(interpreter));
        self
    }

    pub fn filters(mut self, filters: &FilterRegistry) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Conditions AND-ed ahead of the view's own constraints
    pub fn constraints<C: Constraints + 'static>(mut self, constraints: C) -> Self {
        self.constraints = Some(Arc::new(constraints));
        self
    }

    pub fn group_by(mut self, group_by: SqlFragment) -> Self {
        self.group_by = Some(GroupBy::Fixed(group_by));
        self
    }

    pub fn group_by_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&LoadArgs) -> Option<SqlFragment> + Send + Sync + 'static,
    {
        self.group_by = Some(GroupBy::Dynamic(Arc::new(f)));
        self
    }

    /// Derive the effective context from the request context
    pub fn context_factory<F>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Result<Context> + Send + Sync + 'static,
    {
        self.context_factory = Some(Arc::new(f));
        self
    }

    pub fn db(mut self, db: Arc<dyn SqlExecutor>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn or_enabled(mut self, enabled: bool) -> Self {
        self.options.or_enabled = enabled;
        self
    }

    pub fn default_order_by(mut self, name: impl Into<String>, direction: SortDirection) -> Self {
        self.options.default_order_by.push((name.into(), direction));
        self
    }

    pub fn build(self) -> Result<QueryLoader> {
        let select = self
            .select
            .strip_keyword("SELECT")
            .unwrap_or_else(|| self.select.clone());
        if select.is_empty() {
            return Err(EngineError::config("Select list must not be empty"));
        }

        let source = match (self.view, self.from) {
            (Some(_), Some(_)) => {
                return Err(EngineError::config("Specify either view or from, not both"));
            }
            (Some(view), None) => Source::View(view),
            (None, Some(from)) => {
                if from.strip_keyword("FROM").is_none() {
                    return Err(EngineError::config("First part of from must be FROM"));
                }
                Source::From(from)
            }
            (None, None) => return Err(EngineError::config("Either view or from is required")),
        };

        let mut seen: HashSet<&str> = self.columns.iter().map(String::as_str).collect();
        for (name, _) in &self.virtual_fields {
            if !seen.insert(name.as_str()) {
                return Err(EngineError::duplicate("Virtual field", name));
            }
        }
        if !self.columns.is_empty() {
            for (group, fields) in &self.column_groups {
                if let Some(unknown) = fields.iter().find(|f| !seen.contains(f.as_str())) {
                    return Err(EngineError::config(format!(
                        "Column group {} references unknown field {}",
                        group, unknown
                    )));
                }
            }
        }
        for (name, _) in &self.options.default_order_by {
            if !self.sortable.contains_key(name) {
                return Err(EngineError::config(format!(
                    "Default order {} is not a sortable column",
                    name
                )));
            }
        }
        if self.options.max_limit < 0 || self.options.run_concurrency == 0 {
            return Err(EngineError::config(
                "max_limit must be >= 0 and run_concurrency > 0",
            ));
        }

        Ok(QueryLoader {
            select,
            source,
            columns: self.columns,
            sortable: self.sortable,
            column_groups: self.column_groups,
            virtual_fields: self.virtual_fields,
            plugins: self.plugins,
            filters: self.filters,
            constraints: self.constraints,
            group_by: self.group_by,
            context_factory: self.context_factory,
            db: self.db,
            options: self.options,
        })
    }
}

/// Per-call resolution of the request arguments
struct Plan {
    /// Output fields in order; `None` keeps rows as the database returned them
    projection: Option<Vec<String>>,
    virtuals: Vec<(String, Arc<dyn VirtualField>)>,
    terms: Vec<OrderTerm>,
    distinct: Vec<SqlFragment>,
    reverse: bool,
    take: i64,
    skip: i64,
    after: Option<Map<String, Value>>,
    ctx: Context,
}

struct Statements {
    query: SqlFragment,
    count: SqlFragment,
}

/// Loads rows and pages from a view
pub struct QueryLoader {
    select: SqlFragment,
    source: Source,
    columns: Vec<String>,
    sortable: BTreeMap<String, SortField>,
    column_groups: BTreeMap<String, Vec<String>>,
    virtual_fields: Vec<(String, Arc<dyn VirtualField>)>,
    plugins: Vec<Arc<dyn QueryPlugin>>,
    filters: FilterRegistry,
    constraints: Option<Arc<dyn Constraints>>,
    group_by: Option<GroupBy>,
    context_factory: Option<Arc<ContextFactory>>,
    db: Option<Arc<dyn SqlExecutor>>,
    options: LoaderOptions,
}

impl QueryLoader {
    /// Start a loader over a select list (`users.*` or `SELECT users.*`)
    pub fn builder(select: SqlFragment) -> QueryLoaderBuilder {
        QueryLoaderBuilder {
            select,
            view: None,
            from: None,
            columns: Vec::new(),
            sortable: BTreeMap::new(),
            column_groups: BTreeMap::new(),
            virtual_fields: Vec::new(),
            plugins: Vec::new(),
            filters: FilterRegistry::new(),
            constraints: None,
            group_by: None,
            context_factory: None,
            db: None,
            options: LoaderOptions::default(),
        }
    }

    /// Every field a request may select: columns first, then virtual fields
    pub fn selectable_fields(&self) -> Vec<String> {
        self.columns
            .iter()
            .cloned()
            .chain(self.virtual_fields.iter().map(|(name, _)| name.clone()))
            .collect()
    }

    pub fn sortable_columns(&self) -> impl Iterator<Item = &str> {
        self.sortable.keys().map(String::as_str)
    }

    /// Render the statement `load` would run, without running it
    pub async fn get_query(&self, args: &LoadArgs) -> Result<Query> {
        let plan = self.plan(args)?;
        Ok(self.statements(args, &plan, plan.take).await?.query.to_query())
    }

    /// Load a flat list of rows
    pub async fn load(&self, args: &LoadArgs) -> Result<Vec<Row>> {
        let plan = self.plan(args)?;
        if plan.take == 0 {
            return Ok(Vec::new());
        }
        let statements = self.statements(args, &plan, plan.take).await?;
        let query = statements.query.to_query();

        let (flow, hooks) = self.run_plugins(LoadKind::Load, args, &query, None).await?;
        let mut output = match flow {
            PluginFlow::StopWith(output) => output,
            _ => {
                let db = self.db()?;
                tracing::debug!(
                    take = plan.take,
                    skip = plan.skip,
                    reverse = plan.reverse,
                    "Loading rows"
                );
                tracing::trace!(sql = %query.text, "Loader query");
                let mut rows = db.any(&query).await?;
                if plan.reverse {
                    rows.reverse();
                }
                LoadOutput::Rows(self.finish_rows(rows, &plan, args).await?)
            }
        };
        for hook in hooks {
            output = hook.on_load_done(output, args).await?;
        }
        Ok(output.into_rows())
    }

    /// Load one page with page info, optional cursors and an optional total count
    pub async fn load_pagination(&self, args: &LoadArgs) -> Result<PageResult> {
        let plan = self.plan(args)?;
        let pages = args.take_next_pages.unwrap_or(1).max(1);
        let fetch = plan
            .take
            .checked_mul(pages)
            .and_then(|rows| rows.checked_add(1))
            .ok_or_else(|| {
                EngineError::InvalidArgument("take * takeNextPages is out of range".into())
            })?;
        let statements = self.statements(args, &plan, fetch).await?;
        let query = statements.query.to_query();
        let count_query = statements.count.to_query();

        let (flow, hooks) = self
            .run_plugins(LoadKind::Pagination, args, &query, Some(&count_query))
            .await?;
        let mut output = match flow {
            PluginFlow::StopWith(output) => LoadOutput::Page(output.into_page()?),
            flow => {
                let db = self.db()?;
                tracing::debug!(
                    take = plan.take,
                    skip = plan.skip,
                    fetch,
                    reverse = plan.reverse,
                    cursor = plan.after.is_some(),
                    count = args.take_count,
                    "Loading page"
                );
                tracing::trace!(sql = %query.text, "Loader query");

                let count = async {
                    match flow {
                        _ if !args.take_count => Ok::<_, EngineError>(None),
                        PluginFlow::OverrideCount(count) => Ok(Some(count)),
                        _ => {
                            let rows = db.any(&count_query).await?;
                            Ok(rows
                                .first()
                                .and_then(|row| row.get("count"))
                                .and_then(Value::as_i64))
                        }
                    }
                };
                let (rows, count) = futures::try_join!(db.any(&query), count)?;
                LoadOutput::Page(self.build_page(rows, count, &plan, args).await?)
            }
        };
        for hook in hooks {
            output = hook.on_load_done(output, args).await?;
        }
        output.into_page()
    }

    fn db(&self) -> Result<&Arc<dyn SqlExecutor>> {
        let view_db = match &self.source {
            Source::View(view) => view.db(),
            Source::From(_) => None,
        };
        self.db
            .as_ref()
            .or(view_db)
            .ok_or(EngineError::MissingDatabase)
    }

    // -------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------

    fn sort_field(&self, name: &str) -> Result<&SortField> {
        self.sortable.get(name).ok_or_else(|| {
            EngineError::InvalidArgument(format!("{} is not a sortable column", name))
        })
    }

    fn plan(&self, args: &LoadArgs) -> Result<Plan> {
        let ctx = match &self.context_factory {
            Some(factory) => factory(args.ctx.clone())?,
            None => args.ctx.clone(),
        };

        let (projection, virtuals) = self.resolve_selection(args)?;

        let requested = args.take.unwrap_or(self.options.default_take);
        let reverse = requested < 0;
        let mut take = requested.saturating_abs();
        if self.options.max_limit > 0 {
            take = take.min(self.options.max_limit);
        }
        let skip = args.skip.unwrap_or(0).max(0);

        let order_by = if args.order_by.is_empty() {
            &self.options.default_order_by
        } else {
            &args.order_by
        };
        let mut terms = Vec::new();
        let mut distinct = Vec::new();
        for name in &args.distinct_on {
            let field = self.sort_field(name)?;
            distinct.push(field.field.clone());
            let direction = order_by
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, d)| *d)
                .or(field.default_direction)
                .unwrap_or(SortDirection::Asc);
            terms.push(OrderTerm::new(name, field, direction));
        }
        for (name, direction) in order_by {
            let field = self.sort_field(name)?;
            if !terms.iter().any(|t| &t.name == name) {
                terms.push(OrderTerm::new(name, field, *direction));
            }
        }
        if reverse {
            terms = terms.iter().map(OrderTerm::reversed).collect();
        }

        let after = match (&args.cursor, &args.search_after) {
            (Some(_), Some(_)) => {
                return Err(EngineError::InvalidArgument(
                    "cursor and searchAfter cannot be combined".into(),
                ));
            }
            (Some(cursor), None) => Some(decode_cursor(cursor)?),
            (None, Some(search_after)) => {
                if let Some(unknown) = search_after.keys().find(|k| !self.sortable.contains_key(*k)) {
                    return Err(EngineError::InvalidArgument(format!(
                        "searchAfter field {} is not sortable",
                        unknown
                    )));
                }
                Some(search_after.clone())
            }
            (None, None) => None,
        };
        if after.is_some() && terms.is_empty() {
            return Err(EngineError::InvalidArgument(
                "Cursor pagination requires orderBy".into(),
            ));
        }

        Ok(Plan {
            projection,
            virtuals,
            terms,
            distinct,
            reverse,
            take,
            skip,
            after,
            ctx,
        })
    }

    #[allow(clippy::type_complexity)]
    fn resolve_selection(
        &self,
        args: &LoadArgs,
    ) -> Result<(Option<Vec<String>>, Vec<(String, Arc<dyn VirtualField>)>)> {
        let mut requested: Vec<String> = Vec::new();
        for name in &args.select {
            if !requested.contains(name) {
                requested.push(name.clone());
            }
        }
        for group in &args.select_groups {
            let fields = self.column_groups.get(group).ok_or_else(|| {
                EngineError::InvalidArgument(format!("Unknown column group {}", group))
            })?;
            for name in fields {
                if !requested.contains(name) {
                    requested.push(name.clone());
                }
            }
        }

        let is_virtual = |name: &str| self.virtual_fields.iter().any(|(n, _)| n == name);
        if requested.is_empty() {
            if self.columns.is_empty() {
                return Ok((None, self.virtual_fields.clone()));
            }
            requested = self.selectable_fields();
        } else if !self.columns.is_empty()
            && let Some(unknown) = requested
                .iter()
                .find(|n| !self.columns.contains(*n) && !is_virtual(n.as_str()))
        {
            return Err(EngineError::InvalidArgument(format!(
                "Unknown field {}",
                unknown
            )));
        }

        let virtuals: Vec<(String, Arc<dyn VirtualField>)> = self
            .virtual_fields
            .iter()
            .filter(|(name, _)| requested.contains(name))
            .cloned()
            .collect();
        for (name, field) in &virtuals {
            if let Some(missing) = field
                .dependencies()
                .iter()
                .find(|dep| !requested.contains(*dep))
            {
                return Err(EngineError::MissingDependency {
                    field: name.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok((Some(requested), virtuals))
    }

    // -------------------------------------------------------------------------
    // SQL
    // -------------------------------------------------------------------------

    async fn where_conditions(&self, filter: &FilterTree, ctx: &Context) -> Result<Vec<SqlFragment>> {
        let options = FilterOptions {
            or_enabled: self.options.or_enabled,
            bypass_constraints: false,
        };
        let mut conditions = match &self.constraints {
            Some(constraints) => constraints.constraints(ctx).await?,
            None => Vec::new(),
        };
        conditions.retain(|c| !c.is_empty());
        let user = match &self.source {
            Source::View(view) => {
                view.where_conditions_with(filter, ctx, options, Some(&self.filters))
                    .await?
            }
            Source::From(_) => interpret_filter(filter, &self.filters, ctx, options).await?,
        };
        conditions.extend(user);
        Ok(conditions)
    }

    fn from_fragment(&self, ctx: &Context) -> SqlFragment {
        match &self.source {
            Source::View(view) => view.get_from_fragment(ctx),
            Source::From(from) => from.clone(),
        }
    }

    async fn statements(&self, args: &LoadArgs, plan: &Plan, limit: i64) -> Result<Statements> {
        let conditions = self.where_conditions(&args.filter, &plan.ctx).await?;
        let from = self.from_fragment(&plan.ctx);
        let group_by = match &self.group_by {
            Some(GroupBy::Fixed(frag)) => Some(frag.clone()),
            Some(GroupBy::Dynamic(f)) => f(args),
            None => None,
        };

        let mut head = SqlFragment::raw("SELECT ");
        if !plan.distinct.is_empty() {
            head = head
                .sql("DISTINCT ON (")
                .frag(&SqlFragment::join(plan.distinct.iter().cloned(), ", "))
                .sql(") ");
        }
        let head = head.frag(&self.select);

        let mut body = SqlFragment::raw(" ").frag(&from).sql(" ");
        let mut count_body = body.clone().frag(&where_fragment(conditions.clone()));
        let mut conditions = conditions;
        if let Some(after) = &plan.after {
            conditions.push(keyset_condition(&plan.terms, after)?);
        }
        body = body.frag(&where_fragment(conditions));
        if let Some(group_by) = &group_by {
            body = body.sql("\nGROUP BY ").frag(group_by);
            count_body = count_body.sql("\nGROUP BY ").frag(group_by);
        }

        let mut query = head.clone();
        for term in &plan.terms {
            query = query
                .sql(", ")
                .frag(&term.field.field)
                .sql(" AS ")
                .frag(&SqlFragment::identifier(&[format!(
                    "{}{}",
                    CURSOR_COLUMN_PREFIX, term.name
                )]));
        }
        query = query.frag(&body);
        if let Some(order_by) = order_by_fragment(&plan.terms) {
            query = query.sql("\n").frag(&order_by);
        }
        query = query.sql("\nLIMIT ").bind(limit);
        if plan.skip > 0 {
            query = query.sql("\nOFFSET ").bind(plan.skip);
        }

        let count = SqlFragment::raw("SELECT COUNT(*) AS \"count\" FROM (")
            .frag(&head)
            .frag(&count_body)
            .sql(") \"countSubquery\"");

        Ok(Statements { query, count })
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    async fn run_plugins(
        &self,
        kind: LoadKind,
        args: &LoadArgs,
        query: &Query,
        count_query: Option<&Query>,
    ) -> Result<(PluginFlow, Vec<Box<dyn LoadDoneHook>>)> {
        let session = PluginSession {
            kind,
            args,
            query,
            count_query,
        };
        let mut flow = PluginFlow::Continue;
        let mut hooks = Vec::new();
        for plugin in &self.plugins {
            let result = plugin.on_load(&session).await?;
            match result.flow {
                PluginFlow::Continue => {}
                stop @ PluginFlow::StopWith(_) => flow = stop,
                count @ PluginFlow::OverrideCount(_) => {
                    if !matches!(flow, PluginFlow::StopWith(_)) {
                        flow = count;
                    }
                }
            }
            if let Some(hook) = result.on_done {
                hooks.push(hook);
            }
        }
        Ok((flow, hooks))
    }

    async fn build_page(
        &self,
        mut rows: Vec<Row>,
        count: Option<i64>,
        plan: &Plan,
        args: &LoadArgs,
    ) -> Result<PageResult> {
        let fetched = rows.len() as i64;
        let has_more = fetched > plan.take;
        rows.truncate(plan.take as usize);
        if plan.reverse {
            rows.reverse();
        }

        let cursors: Vec<Option<String>> = rows
            .iter()
            .map(|row| self.row_cursor(row, plan))
            .collect();
        let nodes = self.finish_rows(rows, plan, args).await?;

        let came_from_before = plan.skip > 0 || plan.after.is_some();
        let (has_previous_page, has_next_page) = if plan.reverse {
            (has_more, came_from_before)
        } else {
            (came_from_before, has_more)
        };

        Ok(PageResult {
            nodes,
            page_info: PageInfo {
                has_previous_page,
                has_next_page,
                minimum_count: plan.skip.saturating_add(fetched),
                start_cursor: cursors.first().cloned().flatten(),
                end_cursor: cursors.last().cloned().flatten(),
                count,
            },
            cursors: args.take_cursors.then_some(cursors),
        })
    }

    fn row_cursor(&self, row: &Row, plan: &Plan) -> Option<String> {
        if plan.terms.is_empty() {
            return None;
        }
        let values: Map<String, Value> = plan
            .terms
            .iter()
            .map(|term| {
                let column = format!("{}{}", CURSOR_COLUMN_PREFIX, term.name);
                (term.name.clone(), row.get(&column).cloned().unwrap_or(Value::Null))
            })
            .collect();
        Some(encode_cursor(&values))
    }

    /// Resolve virtual fields, then project to the requested fields
    async fn finish_rows(&self, rows: Vec<Row>, plan: &Plan, args: &LoadArgs) -> Result<Vec<Row>> {
        let mut rows = rows;
        if !plan.virtuals.is_empty() && !rows.is_empty() {
            let loaded = try_join_all(
                plan.virtuals
                    .iter()
                    .map(|(_, field)| field.load(&rows, args)),
            )
            .await?;

            let virtuals = &plan.virtuals;
            let loaded = &loaded;
            let source = &rows;
            let resolved: Vec<Vec<Value>> = stream::iter(source.iter().enumerate())
                .map(move |(index, row)| async move {
                    let mut values = Vec::with_capacity(virtuals.len());
                    for (i, (_, field)) in virtuals.iter().enumerate() {
                        let input = ResolveInput {
                            args,
                            index,
                            loaded: loaded[i].as_ref(),
                        };
                        values.push(field.resolve(row, input).await?);
                    }
                    Ok::<_, EngineError>(values)
                })
                .buffered(self.options.run_concurrency)
                .try_collect()
                .await?;

            for (row, values) in rows.iter_mut().zip(resolved) {
                for ((name, _), value) in plan.virtuals.iter().zip(values) {
                    row.insert(name.clone(), value);
                }
            }
        }

        Ok(rows
            .into_iter()
            .map(|row| match &plan.projection {
                Some(fields) => {
                    let mut row = row;
                    let mut projected = Row::new();
                    for name in fields {
                        if let Some(value) = row.remove(name) {
                            projected.insert(name.clone(), value);
                        }
                    }
                    projected
                }
                None => row
                    .into_iter()
                    .filter(|(key, _)| !key.starts_with(CURSOR_COLUMN_PREFIX))
                    .collect(),
            })
            .collect())
    }
}

impl std::fmt::Debug for QueryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLoader")
            .field("columns", &self.columns)
            .field("sortable", &self.sortable.keys().collect::<Vec<_>>())
            .field(
                "virtual_fields",
                &self.virtual_fields.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("plugins", &self.plugins.len())
            .finish()
    }
}
