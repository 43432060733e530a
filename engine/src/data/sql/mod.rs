//! SQL building blocks
//!
//! Fragments are assembled dialect-free and rendered through a [`SqlDialect`]
//! once the statement is complete.

mod dialect;
mod fragment;
mod postgres_dialect;

pub use dialect::SqlDialect;
pub use fragment::{Query, SqlFragment, SqlValue};
pub use postgres_dialect::PostgresDialect;
