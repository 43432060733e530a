//! Recursive filter evaluation
//!
//! Folds a [`FilterTree`] into a flat list of conditions whose conjunction is the
//! filter. An empty list means "always true".

use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};

use super::types::{Context, FilterInput, FilterOptions, FilterRegistry, FilterTree};
use crate::data::error::{EngineError, Result};
use crate::data::sql::SqlFragment;

/// `(a) AND (b)` for a non-empty list
fn and_group(conditions: &[SqlFragment]) -> SqlFragment {
    SqlFragment::raw("(")
        .frag(&SqlFragment::join(conditions.iter().cloned(), ") AND ("))
        .sql(")")
}

/// Evaluate every branch concurrently and keep the non-empty groups
async fn branch_groups(
    branches: &[FilterTree],
    registry: &FilterRegistry,
    ctx: &Context,
    options: FilterOptions,
) -> Result<Vec<SqlFragment>> {
    let results = try_join_all(
        branches
            .iter()
            .map(|branch| interpret_filter(branch, registry, ctx, options)),
    )
    .await?;
    Ok(results
        .iter()
        .filter(|conditions| !conditions.is_empty())
        .map(|conditions| and_group(conditions))
        .collect())
}

/// Compile a filter tree against a registry of interpreters.
///
/// Field entries come first, then `OR`, `AND` and `NOT`. Entries with no
/// registered interpreter are skipped without error.
pub fn interpret_filter<'a>(
    tree: &'a FilterTree,
    registry: &'a FilterRegistry,
    ctx: &'a Context,
    options: FilterOptions,
) -> BoxFuture<'a, Result<Vec<SqlFragment>>> {
    async move {
        let mut conditions = Vec::new();

        for (key, value) in &tree.fields {
            if value.is_null() {
                continue;
            }
            let Some(interpreter) = registry.get(key) else {
                continue;
            };
            let input = FilterInput {
                value,
                all: tree,
                ctx,
                key,
            };
            if let Some(condition) = interpreter.interpret(&input).await?
                && !condition.is_empty()
            {
                conditions.push(condition);
            }
        }

        if !tree.or.is_empty() {
            if !options.or_enabled {
                return Err(EngineError::OrDisabled);
            }
            let groups = branch_groups(&tree.or, registry, ctx, options).await?;
            if !groups.is_empty() {
                conditions.push(
                    SqlFragment::raw("(")
                        .frag(&SqlFragment::join(groups, ") OR ("))
                        .sql(")"),
                );
            }
        }

        if !tree.and.is_empty() {
            let groups = branch_groups(&tree.and, registry, ctx, options).await?;
            if !groups.is_empty() {
                conditions.push(and_group(&groups));
            }
        }

        if let Some(not) = &tree.not {
            let negated = interpret_filter(not, registry, ctx, options).await?;
            if !negated.is_empty() {
                // NOT binds tighter than AND, so a multi-condition group needs its own parens
                let negated = match negated.as_slice() {
                    [single] => single.parenthesized(),
                    _ => and_group(&negated).parenthesized(),
                };
                conditions.push(SqlFragment::raw("NOT ").frag(&negated));
            }
        }

        Ok(conditions)
    }
    .boxed()
}
