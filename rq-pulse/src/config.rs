//! Runtime configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::CollectorConfig;
use crate::source::RedisSourceConfig;
use crate::{Error, Result};

/// Analytics configuration.
///
/// Built explicitly and handed to constructors; nothing here is global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_collection_interval_secs")]
    pub collection_interval_secs: u64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Full connection URL. When unset one is built from the host/port/db/password fields.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default)]
    pub redis_db: u32,

    #[serde(default)]
    pub redis_password: Option<String>,

    #[serde(default = "default_redis_timeout_secs")]
    pub redis_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily-rotated log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/analytics.db")
}

fn default_retention_days() -> u32 {
    7
}

fn default_collection_interval_secs() -> u64 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            collection_interval_secs: default_collection_interval_secs(),
            enabled: default_enabled(),
            redis_url: None,
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            redis_password: None,
            redis_timeout_secs: default_redis_timeout_secs(),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::config(format!("{} has an invalid value: {:?}", name, raw)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{} is not a boolean: {:?}", name, raw))),
    }
}

impl AnalyticsConfig {
    /// Load from the process environment after reading `.env` if present.
    ///
    /// Supported env vars:
    /// - `APP_ANALYTICS_DB_PATH`, `APP_ANALYTICS_RETENTION_DAYS`,
    ///   `APP_ANALYTICS_COLLECTION_INTERVAL`, `APP_ANALYTICS_ENABLED`
    /// - `APP_REDIS_URL`, or `APP_REDIS_HOST` / `APP_REDIS_PORT` / `APP_REDIS_DB` / `APP_REDIS_PASSWORD`
    /// - `APP_REDIS_TIMEOUT`
    /// - `APP_LOG_LEVEL`, `APP_LOG_DIR`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get("APP_ANALYTICS_DB_PATH") {
            config.db_path = PathBuf::from(path.trim());
        }
        if let Some(raw) = get("APP_ANALYTICS_RETENTION_DAYS") {
            config.retention_days = parse_var("APP_ANALYTICS_RETENTION_DAYS", &raw)?;
        }
        if let Some(raw) = get("APP_ANALYTICS_COLLECTION_INTERVAL") {
            config.collection_interval_secs = parse_var("APP_ANALYTICS_COLLECTION_INTERVAL", &raw)?;
        }
        if let Some(raw) = get("APP_ANALYTICS_ENABLED") {
            config.enabled = parse_bool("APP_ANALYTICS_ENABLED", &raw)?;
        }

        config.redis_url = get("APP_REDIS_URL").map(|u| u.trim().to_string());
        if let Some(host) = get("APP_REDIS_HOST") {
            config.redis_host = host.trim().to_string();
        }
        if let Some(raw) = get("APP_REDIS_PORT") {
            config.redis_port = parse_var("APP_REDIS_PORT", &raw)?;
        }
        if let Some(raw) = get("APP_REDIS_DB") {
            config.redis_db = parse_var("APP_REDIS_DB", &raw)?;
        }
        config.redis_password = get("APP_REDIS_PASSWORD");
        if let Some(raw) = get("APP_REDIS_TIMEOUT") {
            config.redis_timeout_secs = parse_var("APP_REDIS_TIMEOUT", &raw)?;
        }

        if let Some(level) = get("APP_LOG_LEVEL") {
            config.log_level = level.trim().to_string();
        }
        config.log_dir = get("APP_LOG_DIR").map(|d| PathBuf::from(d.trim()));

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.collection_interval_secs < 1 {
            return Err(Error::config("collection interval must be at least 1 second"));
        }
        if self.retention_days < 1 {
            return Err(Error::config("retention must be at least 1 day"));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::config("database path must not be empty"));
        }
        if self.redis_timeout_secs < 1 {
            return Err(Error::config("Redis timeout must be at least 1 second"));
        }
        Ok(())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }

    /// Connection URL for the queue system's Redis.
    pub fn redis_url(&self) -> String {
        if let Some(url) = &self.redis_url {
            return url.clone();
        }
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    pub fn redis_source_config(&self) -> RedisSourceConfig {
        RedisSourceConfig {
            url: self.redis_url(),
            timeout: Duration::from_secs(self.redis_timeout_secs),
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig::new().with_retention_days(self.retention_days)
    }
}
