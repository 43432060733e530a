//! viewql
//!
//! Composable SQL views over PostgreSQL: declarative filters compiled to
//! parameterized conditions, a query loader with offset and keyset pagination,
//! multi-count loading and ad-hoc tables built from in-memory records.

pub mod core;
pub mod data;
pub mod domain;

pub use crate::core::{EngineConfig, LoaderConfig, PostgresConfig, init_logging};
pub use data::{
    EngineError, PgExecutor, PostgresService, Query, Result, Row, SqlExecutor, SqlFragment,
    SqlTransaction, SqlValue,
};
pub use domain::{
    Context, CountArgs, CountLoader, CountSpec, FilterOptions, FilterRegistry, FilterTree,
    Interpreter, LoadArgs, PageInfo, PageResult, QueryLoader, QueryLoaderBuilder, RunOptions,
    SqlWith, View, ViewLoadArgs, ViewOptions, ViewSelect,
};
