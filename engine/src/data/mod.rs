//! Data layer
//!
//! - `sql` - Parameterized fragments and the SQL dialect
//! - `executor` - The boundary the engine runs statements through
//! - `postgres` - Connection pool and sqlx-backed executor
//! - `error` - Unified error type

pub mod error;
pub mod executor;
pub mod postgres;
pub mod sql;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{EngineError, Result};
pub use executor::{Row, SqlExecutor, SqlTransaction};
pub use postgres::{PgExecutor, PostgresService};
pub use sql::{PostgresDialect, Query, SqlDialect, SqlFragment, SqlValue};

