//! Loader plugins
//!
//! Every plugin sees the rendered statement before it runs. A plugin may let the
//! load continue, override the total count, or stop execution with a result of
//! its own (caching, mocking). It may also return a hook that runs after the
//! load and can rewrite the result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::args::{LoadArgs, PageResult};
use crate::core::config::LoaderConfig;
use crate::core::constants::DEFAULT_SLOW_QUERY_THRESHOLD_MS;
use crate::data::error::{EngineError, Result};
use crate::data::executor::Row;
use crate::data::sql::Query;

/// Which loader entry point is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Load,
    Pagination,
}

/// What a plugin sees before execution
#[derive(Debug, Clone, Copy)]
pub struct PluginSession<'a> {
    pub kind: LoadKind,
    pub args: &'a LoadArgs,
    pub query: &'a Query,
    /// Present for paginated loads
    pub count_query: Option<&'a Query>,
}

/// Result of a load, for either entry point
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutput {
    Rows(Vec<Row>),
    Page(PageResult),
}

impl LoadOutput {
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Page(page) => page.nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Page(page) => page.nodes,
        }
    }

    pub(crate) fn into_page(self) -> Result<PageResult> {
        match self {
            Self::Page(page) => Ok(page),
            Self::Rows(_) => Err(EngineError::InvalidArgument(
                "plugin returned rows for a paginated load".into(),
            )),
        }
    }
}

/// How the load proceeds after a plugin ran
#[derive(Debug, Clone, PartialEq)]
pub enum PluginFlow {
    Continue,
    /// Use this total instead of running the count query
    OverrideCount(i64),
    /// Skip the database and use this result
    StopWith(LoadOutput),
}

/// Runs after the load; may rewrite the result
#[async_trait]
pub trait LoadDoneHook: Send {
    async fn on_load_done(self: Box<Self>, output: LoadOutput, args: &LoadArgs) -> Result<LoadOutput>;
}

/// What a plugin hands back from [`QueryPlugin::on_load`]
pub struct PluginHooks {
    pub flow: PluginFlow,
    pub on_done: Option<Box<dyn LoadDoneHook>>,
}

impl PluginHooks {
    pub fn proceed() -> Self {
        Self {
            flow: PluginFlow::Continue,
            on_done: None,
        }
    }

    pub fn stop_with(output: LoadOutput) -> Self {
        Self {
            flow: PluginFlow::StopWith(output),
            on_done: None,
        }
    }

    pub fn with_done<H: LoadDoneHook + 'static>(mut self, hook: H) -> Self {
        self.on_done = Some(Box::new(hook));
        self
    }
}

#[async_trait]
pub trait QueryPlugin: Send + Sync {
    async fn on_load(&self, session: &PluginSession<'_>) -> Result<PluginHooks>;
}

// =============================================================================
// Slow query reporting
// =============================================================================

/// A load that took longer than the threshold
#[derive(Debug, Clone)]
pub struct SlowQuery {
    pub sql: String,
    pub duration: Duration,
    pub rows: usize,
    pub kind: LoadKind,
}

type SlowQueryCallback = dyn Fn(&SlowQuery) + Send + Sync;

/// Reports loads slower than a threshold
pub struct SlowQueryPlugin {
    threshold: Duration,
    callback: Option<Arc<SlowQueryCallback>>,
}

impl Default for SlowQueryPlugin {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SLOW_QUERY_THRESHOLD_MS))
    }
}

impl SlowQueryPlugin {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            callback: None,
        }
    }

    /// Report through `callback` instead of a warning
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SlowQuery) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl From<&LoaderConfig> for SlowQueryPlugin {
    fn from(config: &LoaderConfig) -> Self {
        Self::new(Duration::from_millis(config.slow_query_threshold_ms))
    }
}

struct SlowQueryTimer {
    started: Instant,
    threshold: Duration,
    sql: String,
    kind: LoadKind,
    callback: Option<Arc<SlowQueryCallback>>,
}

#[async_trait]
impl LoadDoneHook for SlowQueryTimer {
    async fn on_load_done(self: Box<Self>, output: LoadOutput, _args: &LoadArgs) -> Result<LoadOutput> {
        let duration = self.started.elapsed();
        if duration >= self.threshold {
            let report = SlowQuery {
                sql: self.sql,
                duration,
                rows: output.len(),
                kind: self.kind,
            };
            match &self.callback {
                Some(callback) => callback(&report),
                None => tracing::warn!(
                    duration_ms = report.duration.as_millis() as u64,
                    rows = report.rows,
                    sql = %report.sql,
                    "Slow query"
                ),
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl QueryPlugin for SlowQueryPlugin {
    async fn on_load(&self, session: &PluginSession<'_>) -> Result<PluginHooks> {
        Ok(PluginHooks::proceed().with_done(SlowQueryTimer {
            started: Instant::now(),
            threshold: self.threshold,
            sql: session.query.text.clone(),
            kind: session.kind,
            callback: self.callback.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn session<'a>(args: &'a LoadArgs, query: &'a Query) -> PluginSession<'a> {
        PluginSession {
            kind: LoadKind::Load,
            args,
            query,
            count_query: None,
        }
    }

    #[tokio::test]
    async fn test_slow_query_reports_over_threshold() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let plugin = SlowQueryPlugin::new(Duration::ZERO)
            .with_callback(move |report: &SlowQuery| sink.lock().push(report.sql.clone()));

        let args = LoadArgs::default();
        let query = Query {
            text: "SELECT 1".into(),
            values: vec![],
        };
        let hooks = plugin.on_load(&session(&args, &query)).await.unwrap();
        assert_eq!(hooks.flow, PluginFlow::Continue);

        let output = hooks
            .on_done
            .unwrap()
            .on_load_done(LoadOutput::Rows(vec![Row::new()]), &args)
            .await
            .unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(reports.lock().as_slice(), ["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn test_fast_query_is_silent() {
        let reports = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&reports);
        let plugin = SlowQueryPlugin::new(Duration::from_secs(3600))
            .with_callback(move |_: &SlowQuery| *sink.lock() += 1);

        let args = LoadArgs::default();
        let query = Query {
            text: "SELECT 1".into(),
            values: vec![],
        };
        let hooks = plugin.on_load(&session(&args, &query)).await.unwrap();
        hooks
            .on_done
            .unwrap()
            .on_load_done(LoadOutput::Rows(vec![]), &args)
            .await
            .unwrap();
        assert_eq!(*reports.lock(), 0);
    }

    #[test]
    fn test_rows_are_not_a_page() {
        assert!(LoadOutput::Rows(vec![]).into_page().is_err());
        let page = LoadOutput::Page(PageResult::default());
        assert!(page.into_rows().is_empty());
    }
}
