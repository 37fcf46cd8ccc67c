//! Configuration management for fedq services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Plan executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Document store configuration
    #[serde(default)]
    pub mongodb: MongoConfig,

    /// Analytical store configuration
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Query guard configuration
    #[serde(default)]
    pub guard: GuardConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Maximum number of query steps in flight at once
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    /// Total attempts per query step, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for a single retry delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Growth factor applied to the delay after each retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomization factor in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Timeout for a single adapter call in milliseconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Plan deadline used when the request does not carry one
    #[serde(default = "default_deadline")]
    pub default_deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MongoConfig {
    /// Connection string
    #[serde(default = "default_mongo_uri")]
    pub uri: String,

    /// Database queried by document steps
    #[serde(default = "default_mongo_database")]
    pub database: String,

    /// Application name reported to the server
    #[serde(default = "default_service_name")]
    pub app_name: String,

    /// Maximum pooled connections
    #[serde(default = "default_mongo_pool_size")]
    pub max_pool_size: u32,

    /// Connect and server selection timeout in milliseconds
    #[serde(default = "default_mongo_connect_timeout")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseConfig {
    /// HTTP interface URL
    #[serde(default = "default_clickhouse_url")]
    pub url: String,

    /// Database queried by analytical steps
    #[serde(default = "default_clickhouse_database")]
    pub database: String,

    /// User name
    #[serde(default = "default_clickhouse_user")]
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Request timeout in seconds
    #[serde(default = "default_clickhouse_timeout")]
    pub timeout_secs: u64,

    /// Idle connections kept per host
    #[serde(default = "default_clickhouse_idle")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuardConfig {
    /// Maximum size of a single query payload in characters
    #[serde(default = "default_max_query_size")]
    pub max_query_size: usize,

    /// Allow statements and stages that write to a store
    #[serde(default)]
    pub enable_write_operations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 60 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_body_bytes() -> usize { 1024 * 1024 }
fn default_max_concurrent_queries() -> usize { 8 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 100 }
fn default_max_delay() -> u64 { 2_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.2 }
fn default_attempt_timeout() -> u64 { 10_000 }
fn default_deadline() -> u64 { 30_000 }
fn default_mongo_uri() -> String { "mongodb://localhost:27017".to_string() }
fn default_mongo_database() -> String { "analytics".to_string() }
fn default_mongo_pool_size() -> u32 { 20 }
fn default_mongo_connect_timeout() -> u64 { 5_000 }
fn default_clickhouse_url() -> String { "http://localhost:8123".to_string() }
fn default_clickhouse_database() -> String { "default".to_string() }
fn default_clickhouse_user() -> String { "default".to_string() }
fn default_clickhouse_timeout() -> u64 { 10 }
fn default_clickhouse_idle() -> usize { 16 }
fn default_max_query_size() -> usize { 10_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "fedq".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__EXECUTOR__MAX_ATTEMPTS=5
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl ExecutorConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_max_concurrent_queries(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            attempt_timeout_ms: default_attempt_timeout(),
            default_deadline_ms: default_deadline(),
        }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: default_mongo_uri(),
            database: default_mongo_database(),
            app_name: default_service_name(),
            max_pool_size: default_mongo_pool_size(),
            connect_timeout_ms: default_mongo_connect_timeout(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_database(),
            user: default_clickhouse_user(),
            password: String::new(),
            timeout_secs: default_clickhouse_timeout(),
            pool_max_idle_per_host: default_clickhouse_idle(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_query_size: default_max_query_size(),
            enable_write_operations: false,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            executor: ExecutorConfig::default(),
            mongodb: MongoConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            guard: GuardConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
