//! Configuration management for Floodgate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};
use crate::floodcontrol::{KeySpace, RateLimitPolicy};

/// Prefix for environment variable overrides, e.g.
/// `FLOODGATE_FLOOD_CONTROL__MAX_NUMBER_OF_REQUESTS=10`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Shared store connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Flood control limits
    #[serde(default)]
    pub flood_control: FloodControlConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL; takes precedence over host/port/db
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RedisConfig {
    /// The URL to hand to the Redis client.
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout() -> u64 {
    5000
}

/// Flood control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodControlConfig {
    /// Requests allowed per user within one window
    #[serde(default = "default_max_requests")]
    pub max_number_of_requests: u64,

    /// Attempts made to take a user's lock before giving up
    #[serde(default = "default_max_retries")]
    pub max_number_of_retries: u32,

    /// Pause between lock attempts in milliseconds
    #[serde(default = "default_time_interval")]
    pub time_interval_ms: u64,

    /// Window length in seconds; the counter expires after this
    #[serde(default = "default_ttl")]
    pub flood_control_ttl_secs: u64,

    /// Lock lease in milliseconds
    #[serde(default = "default_lock_lease")]
    pub lock_lease_ms: u64,

    /// Upper bound of random delay added to each pause, in milliseconds
    #[serde(default)]
    pub retry_jitter_ms: u64,

    /// Namespace prepended to every store key
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for FloodControlConfig {
    fn default() -> Self {
        Self {
            max_number_of_requests: default_max_requests(),
            max_number_of_retries: default_max_retries(),
            time_interval_ms: default_time_interval(),
            flood_control_ttl_secs: default_ttl(),
            lock_lease_ms: default_lock_lease(),
            retry_jitter_ms: 0,
            key_prefix: String::new(),
        }
    }
}

fn default_max_requests() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_time_interval() -> u64 {
    100
}

fn default_ttl() -> u64 {
    60
}

fn default_lock_lease() -> u64 {
    8000
}

impl FloodControlConfig {
    /// Build the checker policy, validating the limits.
    pub fn policy(&self) -> Result<RateLimitPolicy> {
        RateLimitPolicy::builder()
            .max_requests_per_window(self.max_number_of_requests)
            .window(Duration::from_secs(self.flood_control_ttl_secs))
            .lock_retry_limit(self.max_number_of_retries)
            .lock_retry_interval(Duration::from_millis(self.time_interval_ms))
            .lock_lease(Duration::from_millis(self.lock_lease_ms))
            .retry_jitter(Duration::from_millis(self.retry_jitter_ms))
            .build()
    }

    /// Key namespace for counters and locks.
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(&self.key_prefix)
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FloodgateConfig {
    /// Load configuration from a YAML file, applying `FLOODGATE_*`
    /// environment overrides on top.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.as_ref()).format(config::FileFormat::Yaml),
            );
        }

        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.flood_control.policy().map(|_| ())
    }
}
