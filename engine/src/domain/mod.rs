//! Query construction
//!
//! - `filters` - Filter trees, interpreters and the recursive evaluator
//! - `view` - Views: FROM source, filter registry, columns and constraints
//! - `loader` - Query loader with offset and keyset pagination
//! - `count` - Several named counts in one table scan
//! - `sql_with` - In-memory records as CTEs, run in batches

pub mod count;
pub mod filters;
pub mod loader;
pub mod sql_with;
pub mod view;

pub use count::{CountArgs, CountLoader, CountSpec};
pub use filters::{Context, FilterOptions, FilterRegistry, FilterTree, Interpreter};
pub use loader::{LoadArgs, PageInfo, PageResult, QueryLoader, QueryLoaderBuilder};
pub use sql_with::{RunOptions, SqlWith};
pub use view::{View, ViewLoadArgs, ViewOptions, ViewSelect};
