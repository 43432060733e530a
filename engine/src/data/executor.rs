//! SQL executor boundary
//!
//! The engine never manages connections itself. It hands rendered statements to a
//! [`SqlExecutor`] and reads back plain JSON records.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::Result;
use super::sql::Query;

/// A result record keyed by column name, in select order
pub type Row = Map<String, Value>;

/// Executes rendered statements
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a statement and return every row
    async fn any(&self, query: &Query) -> Result<Vec<Row>>;

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn SqlTransaction>>;
}

/// An open transaction. Dropping it without commit rolls back.
#[async_trait]
pub trait SqlTransaction: Send {
    async fn any(&mut self, query: &Query) -> Result<Vec<Row>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
