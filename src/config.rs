// config.rs - Server environment configuration and client sync settings

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding the per-database oplog files.
    pub db_path: PathBuf,
    /// When set, protected endpoints require an Authorization header.
    /// Actual token verification is mounted by deployment middleware.
    pub jwt_secret: Option<String>,
    pub enable_cors: bool,
    pub cors_allowed_origins: Vec<String>,
    pub max_pull_limit: u32,
    pub max_push_batch_size: u32,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8472,
            db_path: PathBuf::from("./data"),
            jwt_secret: None,
            enable_cors: false,
            cors_allowed_origins: Vec::new(),
            max_pull_limit: 1000,
            max_push_batch_size: 100,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("Invalid PORT '{}': {}", v, e)))?,
            Err(_) => defaults.port,
        };

        let max_pull_limit = parse_env_u32("MAX_PULL_LIMIT", defaults.max_pull_limit)?;
        let max_push_batch_size =
            parse_env_u32("MAX_PUSH_BATCH_SIZE", defaults.max_push_batch_size)?;

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port,
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            jwt_secret: std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            enable_cors: std::env::var("ENABLE_CORS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins,
            max_pull_limit,
            max_push_batch_size,
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Socket address string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u32>()
            .map_err(|e| Error::Config(format!("Invalid {} '{}': {}", key, v, e))),
        Err(_) => Ok(default),
    }
}

/// Client-side sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Logical database to replicate.
    pub db_id: String,
    /// Identifier of this device; origin of locally produced operations.
    pub device_id: String,
    /// Base URL of the coordinator, e.g. "http://localhost:8472".
    pub server_url: String,
    /// Bearer token attached to requests when set.
    pub auth_token: Option<String>,
    /// Maximum operations requested per pull page.
    pub pull_batch_size: u32,
    /// Maximum pull pages per sync cycle.
    pub max_pull_pages: u32,
    /// Maximum operations per push batch.
    pub push_batch_size: u32,
    /// Retries before a queued operation is marked failed.
    pub max_retries: u32,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Interval between automatic sync cycles.
    pub sync_interval: Duration,
    /// Initial backoff delay after a recoverable error.
    pub backoff_initial: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl SyncConfig {
    pub fn new(db_id: impl Into<String>, device_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
            device_id: device_id.into(),
            server_url: server_url.into(),
            auth_token: None,
            pull_batch_size: 200,
            max_pull_pages: 50,
            push_batch_size: 100,
            max_retries: 5,
            request_timeout: Duration::from_secs(30),
            sync_interval: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_pull_limit, 1000);
        assert_eq!(config.max_push_batch_size, 100);
        assert!(!config.enable_cors);
    }

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::new("db", "device-a", "http://localhost:8472");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.backoff_initial, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(60));
        assert_eq!(config.max_retries, 5);
    }
}
