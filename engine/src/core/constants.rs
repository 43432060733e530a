// =============================================================================
// Identity
// =============================================================================

/// Crate name in lowercase (for log targets and identifiers)
pub const APP_NAME_LOWER: &str = "viewql";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "viewql.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "VIEWQL_CONFIG";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "VIEWQL_LOG";

/// Environment variable for the PostgreSQL connection URL
pub const ENV_POSTGRES_URL: &str = "VIEWQL_POSTGRES_URL";

/// Environment variable for the maximum rows a single load may return
pub const ENV_MAX_LIMIT: &str = "VIEWQL_MAX_LIMIT";

/// Environment variable for the page size used when a load omits `take`
pub const ENV_DEFAULT_TAKE: &str = "VIEWQL_DEFAULT_TAKE";

/// Environment variable for the ad-hoc table batch size
pub const ENV_BATCH_SIZE: &str = "VIEWQL_BATCH_SIZE";

/// Environment variable for the slow query threshold in milliseconds
pub const ENV_SLOW_QUERY_MS: &str = "VIEWQL_SLOW_QUERY_MS";

// =============================================================================
// Logging
// =============================================================================

/// Filter used when neither `VIEWQL_LOG` nor `RUST_LOG` is set
pub const DEFAULT_LOG_FILTER: &str = "info,viewql=info";

// =============================================================================
// Loader Defaults
// =============================================================================

/// Rows per page when a load omits `take`
pub const DEFAULT_TAKE: i64 = 100;

/// Hard cap on `take` (0 disables the cap)
pub const DEFAULT_MAX_LIMIT: i64 = 0;

/// Rows resolved concurrently during virtual field resolution
pub const DEFAULT_RUN_CONCURRENCY: usize = 50;

/// Records per statement when running an ad-hoc table query
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Loads slower than this are reported by the slow query plugin
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 1000;

/// Prefix of hidden columns selected to build keyset cursors
pub const CURSOR_COLUMN_PREFIX: &str = "__cursor_";

/// Name of the CTE wrapping the caller's query in an ad-hoc table statement
pub const USER_QUERY_CTE: &str = "userQuery";

// =============================================================================
// PostgreSQL Defaults
// =============================================================================

/// Default maximum connections in pool
pub const POSTGRES_DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Default minimum connections kept warm
pub const POSTGRES_DEFAULT_MIN_CONNECTIONS: u32 = 2;

/// Default connection acquire timeout in seconds
pub const POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Default idle connection timeout in seconds
pub const POSTGRES_DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default maximum connection lifetime in seconds
pub const POSTGRES_DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;

/// Default statement timeout in seconds (0 disables it)
pub const POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 60;
