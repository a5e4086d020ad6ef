//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Comma-separated origins allowed by CORS
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_cors_origins() -> String {
    "http://localhost:3000,http://127.0.0.1:3000".to_string()
}

/// Database configuration
///
/// Without a URL the process runs on in-memory stores.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Apply embedded migrations at startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,

    /// JSON array of accounts loaded into the in-memory store
    pub seed_file: Option<String>,
}

fn default_max_connections() -> u32 {
    10
}

fn default_run_migrations() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            run_migrations: default_run_migrations(),
            seed_file: None,
        }
    }
}

/// Redis configuration (dashboard status mirror)
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: Option<String>,
}

/// Billing-specific configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    /// Length of one billing interval in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Remaining intervals at or below which the payer is warned
    #[serde(default = "default_low_balance_threshold")]
    pub low_balance_threshold: i64,

    /// Intervals the requester must be able to afford before being admitted
    #[serde(default = "default_minimum_required_intervals")]
    pub minimum_required_intervals: i64,

    /// Seconds a disconnected participant has to reconnect before its sessions end
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_low_balance_threshold() -> i64 {
    2
}

fn default_minimum_required_intervals() -> i64 {
    1
}

fn default_disconnect_grace_secs() -> u64 {
    30
}

impl BillingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            low_balance_threshold: default_low_balance_threshold(),
            minimum_required_intervals: default_minimum_required_intervals(),
            disconnect_grace_secs: default_disconnect_grace_secs(),
        }
    }
}

/// Push notification gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Webhook receiving push alerts; alerts are only logged when unset
    pub webhook_url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,
}

fn default_notification_timeout() -> u64 {
    5
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notification_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("server.cors_origins", default_cors_origins())?
            .set_default("database.max_connections", 10)?
            .set_default("database.run_migrations", true)?
            .set_default("billing.interval_secs", 60)?
            .set_default("billing.low_balance_threshold", 2)?
            .set_default("billing.minimum_required_intervals", 1)?
            .set_default("billing.disconnect_grace_secs", 30)?
            .set_default("notifications.timeout_secs", 5)?
            .set_default("log.level", "info")?
            .set_default("log.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with PARLEY prefix
            .add_source(
                Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("PARLEY").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
