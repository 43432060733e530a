//! PostgreSQL SQL dialect implementation

use super::SqlDialect;

/// PostgreSQL SQL dialect
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn order_direction(&self, desc: bool, nulls_last: bool) -> String {
        let dir = if desc { "DESC" } else { "ASC" };
        let nulls = if nulls_last {
            "NULLS LAST"
        } else {
            "NULLS FIRST"
        };
        format!("{} {}", dir, nulls)
    }

    fn nulls_last_by_default(&self, desc: bool) -> bool {
        !desc
    }

    fn json_array_elements(&self) -> &'static str {
        "JSONB_ARRAY_ELEMENTS"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.placeholder(1), "$1");
        assert_eq!(dialect.placeholder(5), "$5");
    }

    #[test]
    fn test_quote_identifier() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.quote_identifier("users"), "\"users\"");
        assert_eq!(dialect.quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_order_direction() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.order_direction(true, true), "DESC NULLS LAST");
        assert_eq!(dialect.order_direction(false, false), "ASC NULLS FIRST");
    }

    #[test]
    fn test_default_null_placement() {
        let dialect = PostgresDialect;
        assert!(dialect.nulls_last_by_default(false));
        assert!(!dialect.nulls_last_by_default(true));
    }
}
