use super::constants::{DEFAULT_LOG_FILTER, ENV_LOG};

/// Install a compact fmt subscriber
///
/// The filter comes from `VIEWQL_LOG`, then `RUST_LOG`, then the built-in default.
/// Returns false when a global subscriber was already installed.
pub fn init_logging() -> bool {
    let filter = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .compact()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        assert!(!init_logging());
    }
}
