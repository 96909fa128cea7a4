//! Configuration handling for the request-scope server.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use crate::db::SqliteBackend;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::{
    DEFAULT_CONNECTION_KEY, DEFAULT_POOL_KEY, DEFAULT_SESSION_KEY, DatabaseConfig,
};
use clap::Parser;
use std::collections::HashMap;
use url::Url;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:db-request-scope.db";
/// Commit mode of the server binary.
pub const DEFAULT_CLI_COMMIT_MODE: &str = "autocommit";
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Connection pool configuration options parsed from the database URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 5)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Query parameter names recognized on the database URL.
    const URL_KEYS: &'static [&'static str] = &[
        "max_connections",
        "min_connections",
        "idle_timeout",
        "acquire_timeout",
        "test_before_acquire",
    ];

    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min == 0 {
                return Err("min_connections must be greater than 0".to_string());
            }
            if min > self.max_connections_or_default() {
                return Err(format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    min,
                    self.max_connections_or_default()
                ));
            }
        }
        Ok(())
    }

    fn from_query(opts: &mut HashMap<String, String>) -> Self {
        Self {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            min_connections: opts.remove("min_connections").and_then(|v| v.parse().ok()),
            idle_timeout_secs: opts.remove("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
            test_before_acquire: opts.remove("test_before_acquire").and_then(|v| {
                if v.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if v.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None // Invalid value ignored
                }
            }),
        }
    }
}

/// Split a database URL into the driver connection string and pool options.
///
/// Pool keys are removed from the query string; all other parameters are
/// kept for the driver.
pub fn parse_database_url(s: &str) -> Result<(String, PoolOptions), String> {
    let mut url = Url::parse(s).map_err(|e| format!("Invalid URL: {e}"))?;
    if !url.scheme().eq_ignore_ascii_case("sqlite") {
        return Err(format!(
            "Unsupported database scheme '{}': only sqlite is available",
            url.scheme()
        ));
    }

    let mut opts = extract_options(&mut url, PoolOptions::URL_KEYS);
    let pool_options = PoolOptions::from_query(&mut opts);
    pool_options.validate()?;

    Ok((url.to_string(), pool_options))
}

/// Extract pool options from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

/// Configuration for the request-scope server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-request-scope",
    about = "HTTP service with request-scoped database connections and status-driven commits",
    version,
    author
)]
pub struct Config {
    /// SQLite database URL.
    /// Pool options may be appended as query parameters,
    /// e.g. "sqlite:app.db?max_connections=4&acquire_timeout=5".
    #[arg(
        short = 'd',
        long = "database",
        value_name = "URL",
        default_value = DEFAULT_DATABASE_URL,
        env = "DB_SCOPE_DATABASE"
    )]
    pub database: String,

    /// Open a fresh connection per request instead of using a pool
    #[arg(long, env = "DB_SCOPE_NO_POOLING")]
    pub no_pooling: bool,

    /// Return BLOB columns as UTF-8 text when valid instead of base64
    #[arg(long, env = "DB_SCOPE_DECODE_BINARY")]
    pub decode_binary: bool,

    /// Commit mode (manual, autocommit, autocommit_include_redirect)
    #[arg(long, default_value = DEFAULT_CLI_COMMIT_MODE, env = "DB_SCOPE_COMMIT_MODE")]
    pub commit_mode: String,

    /// Request cache key for the connection
    #[arg(long, default_value = DEFAULT_CONNECTION_KEY, env = "DB_SCOPE_CONNECTION_KEY")]
    pub connection_key: String,

    /// Application cache key for the pool
    #[arg(long, default_value = DEFAULT_POOL_KEY, env = "DB_SCOPE_POOL_KEY")]
    pub pool_key: String,

    /// Request cache key for the session
    #[arg(long, default_value = DEFAULT_SESSION_KEY, env = "DB_SCOPE_SESSION_KEY")]
    pub session_key: String,

    /// Status codes that always commit in autocommit modes
    #[arg(
        long = "extra-commit-status",
        value_name = "STATUS",
        env = "DB_SCOPE_EXTRA_COMMIT_STATUSES",
        value_delimiter = ','
    )]
    pub extra_commit_statuses: Vec<u16>,

    /// Status codes that always roll back in autocommit modes
    #[arg(
        long = "extra-rollback-status",
        value_name = "STATUS",
        env = "DB_SCOPE_EXTRA_ROLLBACK_STATUSES",
        value_delimiter = ','
    )]
    pub extra_rollback_statuses: Vec<u16>,

    /// HTTP host to bind to
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "DB_SCOPE_HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "DB_SCOPE_HTTP_PORT")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_SCOPE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_SCOPE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database: DEFAULT_DATABASE_URL.to_string(),
            no_pooling: false,
            decode_binary: false,
            commit_mode: DEFAULT_CLI_COMMIT_MODE.to_string(),
            connection_key: DEFAULT_CONNECTION_KEY.to_string(),
            pool_key: DEFAULT_POOL_KEY.to_string(),
            session_key: DEFAULT_SESSION_KEY.to_string(),
            extra_commit_statuses: Vec::new(),
            extra_rollback_statuses: Vec::new(),
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Build the SQLite backend described by the database URL.
    pub fn backend(&self) -> ScopeResult<SqliteBackend> {
        let (connection_string, pool_options) =
            parse_database_url(&self.database).map_err(ScopeError::configuration)?;
        Ok(SqliteBackend::new(&connection_string, !self.no_pooling, pool_options)?
            .with_binary_decoding(self.decode_binary))
    }

    /// Build and validate the full database configuration.
    pub fn database_config(&self) -> ScopeResult<DatabaseConfig<SqliteBackend>> {
        DatabaseConfig::builder(self.backend()?)
            .commit_mode_name(&self.commit_mode)
            .connection_key(self.connection_key.as_str())
            .pool_key(self.pool_key.as_str())
            .session_key(self.session_key.as_str())
            .extra_commit_statuses(self.extra_commit_statuses.iter().copied())
            .extra_rollback_statuses(self.extra_rollback_statuses.iter().copied())
            .build()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
