//! SQL dialect trait
//!
//! The engine targets a single dialect, but every piece of syntax that differs
//! between databases goes through this trait so fragments stay dialect-free
//! until they are rendered.

/// SQL dialect trait for generating database-specific SQL
///
/// Covers the syntax the engine emits itself:
/// - Parameter placeholders (`?` vs `$1`)
/// - Identifier quoting
/// - ORDER BY direction with NULL placement
/// - Unnesting a JSON array parameter into rows
pub trait SqlDialect: Send + Sync {
    /// Generate a parameter placeholder for the given index (1-based)
    ///
    /// - PostgreSQL: Returns "$1", "$2", etc.
    fn placeholder(&self, index: usize) -> String;

    /// Quote a single identifier segment
    ///
    /// - PostgreSQL: `"name"` with embedded quotes doubled
    fn quote_identifier(&self, ident: &str) -> String;

    /// Generate the direction part of an ORDER BY item
    ///
    /// - Most: `DESC NULLS LAST`
    fn order_direction(&self, desc: bool, nulls_last: bool) -> String;

    /// Whether NULLs sort after non-NULL values when no placement is given
    ///
    /// - PostgreSQL: NULL is larger than any value, so `ASC` puts NULLs last
    fn nulls_last_by_default(&self, desc: bool) -> bool;

    /// Table function that expands a JSON array into one row per element
    ///
    /// - PostgreSQL: `JSONB_ARRAY_ELEMENTS`
    fn json_array_elements(&self) -> &'static str;
}
