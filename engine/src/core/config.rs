use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_BATCH_SIZE, DEFAULT_MAX_LIMIT, DEFAULT_RUN_CONCURRENCY,
    DEFAULT_SLOW_QUERY_THRESHOLD_MS, DEFAULT_TAKE, ENV_BATCH_SIZE, ENV_CONFIG, ENV_DEFAULT_TAKE,
    ENV_MAX_LIMIT, ENV_POSTGRES_URL, ENV_SLOW_QUERY_MS, POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS,
    POSTGRES_DEFAULT_IDLE_TIMEOUT_SECS, POSTGRES_DEFAULT_MAX_CONNECTIONS,
    POSTGRES_DEFAULT_MAX_LIFETIME_SECS, POSTGRES_DEFAULT_MIN_CONNECTIONS,
    POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS,
};

// =============================================================================
// File Config Sections
// =============================================================================

/// PostgreSQL configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PostgresFileConfig {
    /// PostgreSQL connection URL (or use VIEWQL_POSTGRES_URL env var)
    pub url: Option<String>,
    /// Maximum number of connections in the pool (default: 20)
    pub max_connections: Option<u32>,
    /// Minimum number of connections to keep warm (default: 2)
    pub min_connections: Option<u32>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Idle connection timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Max connection lifetime in seconds (default: 1800)
    pub max_lifetime_secs: Option<u64>,
    /// Statement timeout in seconds, 0 to disable (default: 60)
    pub statement_timeout_secs: Option<u64>,
}

/// Loader configuration section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
pub struct LoaderFileConfig {
    /// Page size when a load omits `take` (default: 100)
    pub default_take: Option<i64>,
    /// Hard cap on `take`, 0 to disable (default: 0)
    pub max_limit: Option<i64>,
    /// Rows resolved concurrently for virtual fields (default: 50)
    pub run_concurrency: Option<usize>,
    /// Records per ad-hoc table statement (default: 2000)
    pub batch_size: Option<usize>,
    /// Slow query threshold in milliseconds (default: 1000)
    pub slow_query_threshold_ms: Option<u64>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub database: Option<PostgresFileConfig>,
    pub loader: Option<LoaderFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }

    /// Merge another FileConfig into this one (other takes precedence)
    fn merge(&mut self, other: FileConfig) {
        if let Some(db) = other.database {
            let current = self
                .database
                .get_or_insert_with(PostgresFileConfig::default);
            if db.url.is_some() {
                tracing::trace!("Merging database.url");
                current.url = db.url;
            }
            if db.max_connections.is_some() {
                current.max_connections = db.max_connections;
            }
            if db.min_connections.is_some() {
                current.min_connections = db.min_connections;
            }
            if db.acquire_timeout_secs.is_some() {
                current.acquire_timeout_secs = db.acquire_timeout_secs;
            }
            if db.idle_timeout_secs.is_some() {
                current.idle_timeout_secs = db.idle_timeout_secs;
            }
            if db.max_lifetime_secs.is_some() {
                current.max_lifetime_secs = db.max_lifetime_secs;
            }
            if db.statement_timeout_secs.is_some() {
                current.statement_timeout_secs = db.statement_timeout_secs;
            }
        }

        if let Some(loader) = other.loader {
            let current = self.loader.get_or_insert_with(LoaderFileConfig::default);
            if loader.default_take.is_some() {
                tracing::trace!(default_take = ?loader.default_take, "Merging loader.default_take");
                current.default_take = loader.default_take;
            }
            if loader.max_limit.is_some() {
                tracing::trace!(max_limit = ?loader.max_limit, "Merging loader.max_limit");
                current.max_limit = loader.max_limit;
            }
            if loader.run_concurrency.is_some() {
                current.run_concurrency = loader.run_concurrency;
            }
            if loader.batch_size.is_some() {
                current.batch_size = loader.batch_size;
            }
            if loader.slow_query_threshold_ms.is_some() {
                current.slow_query_threshold_ms = loader.slow_query_threshold_ms;
            }
        }
    }
}

// =============================================================================
// Runtime Config
// =============================================================================

/// PostgreSQL configuration (final/runtime)
#[derive(Debug, Clone, Default)]
pub struct PostgresConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of connections to keep warm
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    pub acquire_timeout_secs: u64,
    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,
    /// Max connection lifetime in seconds
    pub max_lifetime_secs: u64,
    /// Statement timeout in seconds (0 = disabled)
    pub statement_timeout_secs: u64,
}

/// Loader defaults (final/runtime)
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub default_take: i64,
    /// 0 = unlimited
    pub max_limit: i64,
    pub run_concurrency: usize,
    pub batch_size: usize,
    pub slow_query_threshold_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            default_take: DEFAULT_TAKE,
            max_limit: DEFAULT_MAX_LIMIT,
            run_concurrency: DEFAULT_RUN_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
        }
    }
}

/// Final merged engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub database: PostgresConfig,
    pub loader: LoaderConfig,
}

impl EngineConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. `VIEWQL_CONFIG` path OR `viewql.json` in the working directory
    /// 3. Environment variables
    pub fn load() -> Result<Self> {
        let path = match std::env::var(ENV_CONFIG) {
            Ok(path) if !path.is_empty() => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path)
            }
            _ => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                if local.exists() { Some(local) } else { None }
            }
        };
        Self::load_with(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load from an optional config file and an environment lookup
    pub fn load_with<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        tracing::debug!("Loading engine configuration");

        let mut file_config = FileConfig::default();
        if let Some(path) = path {
            let overlay = FileConfig::load_from_file(path)?;
            overlay.warn_unknown_fields();
            file_config.merge(overlay);
        }

        let file_db = file_config.database.unwrap_or_default();
        let file_loader = file_config.loader.unwrap_or_default();

        let database = PostgresConfig {
            url: env(ENV_POSTGRES_URL)
                .filter(|v| !v.is_empty())
                .or(file_db.url)
                .unwrap_or_default(),
            max_connections: file_db
                .max_connections
                .unwrap_or(POSTGRES_DEFAULT_MAX_CONNECTIONS),
            min_connections: file_db
                .min_connections
                .unwrap_or(POSTGRES_DEFAULT_MIN_CONNECTIONS),
            acquire_timeout_secs: file_db
                .acquire_timeout_secs
                .unwrap_or(POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout_secs: file_db
                .idle_timeout_secs
                .unwrap_or(POSTGRES_DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime_secs: file_db
                .max_lifetime_secs
                .unwrap_or(POSTGRES_DEFAULT_MAX_LIFETIME_SECS),
            statement_timeout_secs: file_db
                .statement_timeout_secs
                .unwrap_or(POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS),
        };

        let loader = LoaderConfig {
            default_take: env_parse(&env, ENV_DEFAULT_TAKE)?
                .or(file_loader.default_take)
                .unwrap_or(DEFAULT_TAKE),
            max_limit: env_parse(&env, ENV_MAX_LIMIT)?
                .or(file_loader.max_limit)
                .unwrap_or(DEFAULT_MAX_LIMIT),
            run_concurrency: file_loader
                .run_concurrency
                .unwrap_or(DEFAULT_RUN_CONCURRENCY),
            batch_size: env_parse(&env, ENV_BATCH_SIZE)?
                .or(file_loader.batch_size)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            slow_query_threshold_ms: env_parse(&env, ENV_SLOW_QUERY_MS)?
                .or(file_loader.slow_query_threshold_ms)
                .unwrap_or(DEFAULT_SLOW_QUERY_THRESHOLD_MS),
        };

        let config = Self { database, loader };
        config.validate()?;

        tracing::debug!(
            postgres_configured = !config.database.url.is_empty(),
            default_take = config.loader.default_take,
            max_limit = config.loader.max_limit,
            batch_size = config.loader.batch_size,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<()> {
        if self.loader.default_take <= 0 {
            anyhow::bail!("Configuration error: loader.default_take must be greater than 0");
        }
        if self.loader.max_limit < 0 {
            anyhow::bail!("Configuration error: loader.max_limit must not be negative");
        }
        if self.loader.batch_size == 0 {
            anyhow::bail!("Configuration error: loader.batch_size must be greater than 0");
        }
        if self.loader.run_concurrency == 0 {
            anyhow::bail!("Configuration error: loader.run_concurrency must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Configuration error: database.min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }
        Ok(())
    }
}

fn env_parse<F, T>(env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::load_with(None, no_env).unwrap();
        assert_eq!(config.loader.default_take, DEFAULT_TAKE);
        assert_eq!(config.loader.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.database.max_connections, POSTGRES_DEFAULT_MAX_CONNECTIONS);
        assert!(config.database.url.is_empty());
    }

    #[test]
    fn test_file_config_parse_extra_fields() {
        let json = r#"{ "loader": { "batch_size": 10 }, "unknown_field": 123 }"#;
        let config: FileConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.loader.as_ref().unwrap().batch_size, Some(10));
        assert_eq!(config.extra.get("unknown_field").unwrap(), 123);
    }

    #[test]
    fn test_file_config_merge() {
        let mut base = FileConfig {
            loader: Some(LoaderFileConfig {
                default_take: Some(10),
                max_limit: Some(500),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = FileConfig {
            loader: Some(LoaderFileConfig {
                default_take: Some(25),
                ..Default::default()
            }),
            ..Default::default()
        };
        base.merge(overlay);

        let loader = base.loader.unwrap();
        assert_eq!(loader.default_take, Some(25));
        assert_eq!(loader.max_limit, Some(500));
    }

    #[test]
    fn test_load_from_file_and_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "database": {{ "url": "postgres://file/db", "max_connections": 5, "min_connections": 1 }},
                "loader": {{ "default_take": 20, "batch_size": 50 }}
            }}"#
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_POSTGRES_URL, "postgres://env/db"),
            (ENV_BATCH_SIZE, "7"),
        ]);
        let config = EngineConfig::load_with(Some(file.path()), |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.database.url, "postgres://env/db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.loader.default_take, 20);
        assert_eq!(config.loader.batch_size, 7);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let err = EngineConfig::load_with(None, |key| {
            (key == ENV_MAX_LIMIT).then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_LIMIT));
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let err = EngineConfig::load_with(None, |key| {
            (key == ENV_BATCH_SIZE).then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        assert!(EngineConfig::load_with(Some(&path), no_env).is_err());
    }
}
