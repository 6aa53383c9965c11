//! Configuration management for the QAN data plane
//!
//! TOML file support, environment variable overrides and sensible defaults.
//! Durations are given in milliseconds or seconds in the file and converted
//! to the runtime configs of each component.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ingestion::IngestionConfig;
use crate::retention::RetentionConfig;
use crate::store::ClickHouseConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Store connection
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Ingestion batcher tuning
    #[serde(default)]
    pub ingestion: IngestionSettings,

    /// Partition retention
    #[serde(default)]
    pub retention: RetentionSettings,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Deadline of one store call on the read path, in seconds
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Largest accepted request body, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// Ingestion configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionSettings {
    /// Queued collect requests before callers block
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Batch window in milliseconds
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Pause after a failed batch in milliseconds
    #[serde(default = "default_error_delay_ms")]
    pub error_delay_ms: u64,

    /// Times a failed request is put back into the queue
    #[serde(default)]
    pub requeue_attempts: u32,
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionSettings {
    /// Keep this many days of data
    #[serde(default = "default_retention_days")]
    pub days: u32,

    /// Interval between runs in seconds
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Expose `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_listen_addr() -> String { "127.0.0.1:9911".to_string() }
fn default_query_timeout_secs() -> u64 { 30 }
fn default_max_body_size() -> usize { 10 * 1024 * 1024 }
fn default_queue_capacity() -> usize { crate::ingestion::DEFAULT_QUEUE_CAPACITY }
fn default_batch_window_ms() -> u64 { 500 }
fn default_error_delay_ms() -> u64 { 1000 }
fn default_retention_days() -> u32 { 30 }
fn default_retention_interval_secs() -> u64 { 24 * 3600 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            query_timeout_secs: default_query_timeout_secs(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_window_ms: default_batch_window_ms(),
            error_delay_ms: default_error_delay_ms(),
            requeue_attempts: 0,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            interval_secs: default_retention_interval_secs(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Read-path deadline
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl IngestionSettings {
    /// Runtime batcher configuration
    pub fn to_ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            queue_capacity: self.queue_capacity,
            batch_window: Duration::from_millis(self.batch_window_ms),
            error_delay: Duration::from_millis(self.error_delay_ms),
            requeue_attempts: self.requeue_attempts,
        }
    }
}

impl RetentionSettings {
    /// Runtime retention configuration
    pub fn to_retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            days: self.days,
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(addr) = std::env::var("QAN_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }

        // Store
        if let Ok(url) = std::env::var("QAN_CLICKHOUSE_URL") {
            self.clickhouse.url = url;
        }
        if let Ok(database) = std::env::var("QAN_CLICKHOUSE_DATABASE") {
            self.clickhouse.database = database;
        }
        if let Ok(user) = std::env::var("QAN_CLICKHOUSE_USER") {
            self.clickhouse.user = Some(user);
        }
        if let Ok(password) = std::env::var("QAN_CLICKHOUSE_PASSWORD") {
            self.clickhouse.password = Some(password);
        }

        // Retention
        if let Ok(days) = std::env::var("QAN_DATA_RETENTION_DAYS") {
            if let Ok(d) = days.parse() {
                self.retention.days = d;
            }
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "Invalid listen address: {}",
                self.server.listen_addr
            ));
        }
        if self.server.query_timeout_secs == 0 {
            return Err("Query timeout must be > 0".to_string());
        }
        if self.server.max_body_size == 0 {
            return Err("Max body size must be > 0".to_string());
        }

        if self.clickhouse.url.is_empty() {
            return Err("ClickHouse URL cannot be empty".to_string());
        }
        if self.clickhouse.database.is_empty() {
            return Err("ClickHouse database cannot be empty".to_string());
        }

        self.ingestion.to_ingestion_config().validate()?;
        self.retention.to_retention_config().validate()?;

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}
