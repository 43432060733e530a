//! Computed result fields

use async_trait::async_trait;
use serde_json::Value;

use super::args::LoadArgs;
use crate::data::error::Result;
use crate::data::executor::Row;

/// Per-row input for [`VirtualField::resolve`]
#[derive(Debug, Clone, Copy)]
pub struct ResolveInput<'a> {
    pub args: &'a LoadArgs,
    /// Position of the row within the page
    pub index: usize,
    /// What [`VirtualField::load`] returned for this page
    pub loaded: Option<&'a Value>,
}

/// A field computed after the query ran
///
/// `load` runs once per page before any row is resolved, so a field can
/// prefetch related data in a single round trip and then resolve each row
/// from it.
#[async_trait]
pub trait VirtualField: Send + Sync {
    /// Columns that must be selected alongside this field
    fn dependencies(&self) -> &[String];

    async fn load(&self, _rows: &[Row], _args: &LoadArgs) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn resolve(&self, row: &Row, input: ResolveInput<'_>) -> Result<Value>;
}

type ResolveFn = dyn Fn(&Row, ResolveInput<'_>) -> Result<Value> + Send + Sync;

/// Virtual field backed by a synchronous closure
pub struct FnVirtualField {
    dependencies: Vec<String>,
    resolve: Box<ResolveFn>,
}

impl FnVirtualField {
    pub fn new<F>(dependencies: &[&str], resolve: F) -> Self
    where
        F: Fn(&Row, ResolveInput<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            resolve: Box::new(resolve),
        }
    }
}

#[async_trait]
impl VirtualField for FnVirtualField {
    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn resolve(&self, row: &Row, input: ResolveInput<'_>) -> Result<Value> {
        (self.resolve)(row, input)
    }
}
