//! Environment-driven configuration.
//!
//! All settings have working defaults so a bare `Config::from_env()` is
//! enough for local development. Call `dotenvy::dotenv().ok()` before
//! constructing if a `.env` file should be honored.

use std::path::PathBuf;
use std::time::Duration;

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/tagmere".to_string()),
            max_connections: std::env::var("DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between queue polls when no work was found
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll
    pub batch_size: i64,
    /// Minimum age before a previously attempted task is retried
    pub retry_backoff: Duration,
    /// Attempts before a task is parked as failed
    pub max_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(
                env_parse("TAGMERE_WORKER_POLL_SECS").unwrap_or(2),
            ),
            batch_size: env_parse("TAGMERE_WORKER_BATCH_SIZE").unwrap_or(16),
            retry_backoff: Duration::from_secs(
                env_parse("TAGMERE_WORKER_BACKOFF_SECS").unwrap_or(30),
            ),
            max_attempts: env_parse("TAGMERE_WORKER_MAX_ATTEMPTS").unwrap_or(5),
        }
    }
}

/// Where uploaded contribution files live
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: std::env::var("TAGMERE_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
