use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub analytics: AnalyticsConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Analytics engine tuning
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Time-to-live of cached pattern results (seconds)
    pub pattern_cache_ttl_secs: u64,
    /// Rows fetched per page during long scans
    pub scan_page_size: u32,
    /// Upper bound on the candidate pool for similarity search
    pub similarity_candidates: u32,
    /// Number of frequent reasoning terms reported per decision analysis
    pub top_terms: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("TRACE_DATABASE_PATH").unwrap_or_else(|_| "./data/traces.db".to_string()),
            ),
            max_connections: parse_env("TRACE_DATABASE_MAX_CONNECTIONS", 5),
            busy_timeout_ms: parse_env("TRACE_DATABASE_BUSY_TIMEOUT_MS", 5000),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let analytics = AnalyticsConfig {
            pattern_cache_ttl_secs: parse_env("TRACE_PATTERN_CACHE_TTL_SECS", 3600),
            scan_page_size: parse_env("TRACE_SCAN_PAGE_SIZE", 500),
            similarity_candidates: parse_env("TRACE_SIMILARITY_CANDIDATES", 1000),
            top_terms: parse_env("TRACE_TOP_TERMS", 10),
        };

        if analytics.scan_page_size == 0 {
            return Err(AppError::Config {
                message: "TRACE_SCAN_PAGE_SIZE must be greater than zero".to_string(),
            });
        }

        Ok(Config {
            database,
            logging,
            analytics,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl DatabaseConfig {
    /// Configuration for a database file at `path` with default pool settings.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/traces.db"),
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            pattern_cache_ttl_secs: 3600,
            scan_page_size: 500,
            similarity_candidates: 1000,
            top_terms: 10,
        }
    }
}

impl AnalyticsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pattern_cache_ttl_secs)
    }
}
