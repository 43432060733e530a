//! In-memory executor for unit tests

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::error::Result;
use super::executor::{Row, SqlExecutor, SqlTransaction};
use super::sql::Query;

#[derive(Default)]
struct State {
    queries: Vec<Query>,
    responses: VecDeque<Vec<Row>>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

/// Records every statement and replays scripted result sets in order.
///
/// When the script runs out each statement returns no rows.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    state: Arc<Mutex<State>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the rows returned by the next statement
    pub fn respond(&self, rows: Vec<Value>) -> &Self {
        let rows = rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.state.lock().responses.push_back(rows);
        self
    }

    pub fn queries(&self) -> Vec<Query> {
        self.state.lock().queries.clone()
    }

    pub fn last_query(&self) -> Option<Query> {
        self.state.lock().queries.last().cloned()
    }

    pub fn begins(&self) -> usize {
        self.state.lock().begins
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    fn record(&self, query: &Query) -> Vec<Row> {
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        state.responses.pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn any(&self, query: &Query) -> Result<Vec<Row>> {
        Ok(self.record(query))
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>> {
        self.state.lock().begins += 1;
        Ok(Box::new(RecordingTransaction {
            executor: self.clone(),
        }))
    }
}

struct RecordingTransaction {
    executor: RecordingExecutor,
}

#[async_trait]
impl SqlTransaction for RecordingTransaction {
    async fn any(&mut self, query: &Query) -> Result<Vec<Row>> {
        Ok(self.executor.record(query))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.executor.state.lock().commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.executor.state.lock().rollbacks += 1;
        Ok(())
    }
}
