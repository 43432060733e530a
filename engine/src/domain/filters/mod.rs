//! Filter trees, interpreters and their evaluation

mod evaluator;
pub mod interpreters;
mod types;

pub use evaluator::interpret_filter;
pub use types::{Context, FilterInput, FilterOptions, FilterRegistry, FilterTree, Interpreter};
