/// Configuration management for docwire

use crate::core::{ConnectionOptions, Endpoint, PoolOptions};
use crate::error::ConfigError;
use crate::executor::{ExecutorOptions, RetryPolicy};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::topology::{ReadPreference, TopologyOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const URI_SCHEME: &str = "mongodb://";

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoints and client behavior
    pub client: ClientConfig,
    /// Connection pool configuration
    pub pool: PoolConfig,
    /// Timeouts, all in milliseconds
    pub timeouts: TimeoutConfig,
    /// Server monitoring configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed list of `host[:port]` endpoints
    pub endpoints: Vec<String>,
    /// Application name sent in the handshake
    pub app_name: String,
    /// Retry eligible operations once after a transient failure
    pub retry_enabled: bool,
    pub max_retries: u32,
    /// primary, primaryPreferred, secondary, secondaryPreferred or nearest
    pub read_preference: String,
    /// Local ceiling on wire frame size
    pub max_message_size_bytes: usize,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    /// Idle connections older than this are closed; 0 keeps them forever
    pub max_idle_ms: u64,
    pub wait_queue_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub selection_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Background probe interval
    pub heartbeat_interval_ms: u64,
    /// Minimum gap between probe rounds
    pub min_heartbeat_interval_ms: u64,
    /// Number of consecutive failures before marking unreachable
    pub failure_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:27017".to_string()],
            app_name: "docwire".to_string(),
            retry_enabled: true,
            max_retries: 1,
            read_preference: "primary".to_string(),
            max_message_size_bytes: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            min_pool_size: 0,
            max_idle_ms: 60_000,
            wait_queue_timeout_ms: 5_000,
            maintenance_interval_ms: 1_000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            socket_timeout_ms: 30_000,
            selection_timeout_ms: 30_000,
            operation_timeout_ms: 60_000,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            min_heartbeat_interval_ms: 500,
            failure_threshold: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Every section and key the configuration accepts
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "client",
        &[
            "endpoints",
            "app_name",
            "retry_enabled",
            "max_retries",
            "read_preference",
            "max_message_size_bytes",
        ],
    ),
    (
        "pool",
        &[
            "max_pool_size",
            "min_pool_size",
            "max_idle_ms",
            "wait_queue_timeout_ms",
            "maintenance_interval_ms",
        ],
    ),
    (
        "timeouts",
        &[
            "connect_timeout_ms",
            "socket_timeout_ms",
            "selection_timeout_ms",
            "operation_timeout_ms",
        ],
    ),
    (
        "health",
        &["heartbeat_interval_ms", "min_heartbeat_interval_ms", "failure_threshold"],
    ),
    ("logging", &["level", "format"]),
];

fn check_known_keys(table: &toml::Table) -> Result<(), ConfigError> {
    for (section, value) in table {
        let keys = KNOWN_KEYS
            .iter()
            .find(|(name, _)| *name == section.as_str())
            .map(|(_, keys)| *keys)
            .ok_or_else(|| ConfigError::UnknownOption {
                section: "configuration".to_string(),
                key: section.clone(),
            })?;

        let Some(entries) = value.as_table() else {
            return Err(ConfigError::ParseError(format!(
                "section [{}] must be a table",
                section
            )));
        };
        if let Some(key) = entries.keys().find(|key| !keys.contains(&key.as_str())) {
            return Err(ConfigError::UnknownOption {
                section: format!("[{}]", section),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

impl Config {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| {
            ConfigError::IoError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse a TOML document, rejecting keys outside the known structure
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = content
            .parse()
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;
        check_known_keys(&table)?;

        let config: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&path, content).map_err(|e| {
            ConfigError::IoError(format!(
                "Failed to write config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Build a configuration from a `mongodb://h1[:p],h2/?opt=v` string
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let rest = uri.strip_prefix(URI_SCHEME).ok_or_else(|| {
            ConfigError::ParseError(format!("connection string must start with {}", URI_SCHEME))
        })?;

        let (hosts, query) = match rest.split_once('?') {
            Some((hosts, query)) => (hosts, query),
            None => (rest, ""),
        };
        let hosts = hosts.trim_end_matches('/');
        if hosts.contains('@') {
            return Err(ConfigError::ValidationError(
                "credentials in the connection string are not supported".to_string(),
            ));
        }
        if hosts.contains('/') {
            return Err(ConfigError::ParseError(format!(
                "unexpected path in connection string host list '{}'",
                hosts
            )));
        }

        let mut config = Config::default();
        config.client.endpoints = hosts
            .split(',')
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect();

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ConfigError::ParseError(format!("option '{}' has no value", pair))
            })?;
            config.apply_uri_option(key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_uri_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key.to_ascii_lowercase().as_str() {
            "appname" => self.client.app_name = value.to_string(),
            "maxpoolsize" => self.pool.max_pool_size = parse_option(key, value)?,
            "minpoolsize" => self.pool.min_pool_size = parse_option(key, value)?,
            "maxidletimems" => self.pool.max_idle_ms = parse_option(key, value)?,
            "waitqueuetimeoutms" => self.pool.wait_queue_timeout_ms = parse_option(key, value)?,
            "connecttimeoutms" => self.timeouts.connect_timeout_ms = parse_option(key, value)?,
            "sockettimeoutms" => self.timeouts.socket_timeout_ms = parse_option(key, value)?,
            "serverselectiontimeoutms" => {
                self.timeouts.selection_timeout_ms = parse_option(key, value)?
            }
            "heartbeatfrequencyms" => self.health.heartbeat_interval_ms = parse_option(key, value)?,
            "retrywrites" => self.client.retry_enabled = parse_option(key, value)?,
            "readpreference" => self.client.read_preference = value.to_string(),
            _ => {
                return Err(ConfigError::UnknownOption {
                    section: "connection string".to_string(),
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate client config
        self.endpoints()?;
        self.read_preference()?;

        if self.client.app_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "app_name cannot be empty".to_string(),
            ));
        }

        if self.client.max_message_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size_bytes must be greater than 0".to_string(),
            ));
        }

        // Validate pool config
        if self.pool.max_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.min_pool_size > self.pool.max_pool_size {
            return Err(ConfigError::ValidationError(format!(
                "min_pool_size ({}) cannot exceed max_pool_size ({})",
                self.pool.min_pool_size, self.pool.max_pool_size
            )));
        }

        // Validate timeouts; max_idle_ms is allowed to be 0
        let timeouts = [
            ("wait_queue_timeout_ms", self.pool.wait_queue_timeout_ms),
            ("maintenance_interval_ms", self.pool.maintenance_interval_ms),
            ("connect_timeout_ms", self.timeouts.connect_timeout_ms),
            ("socket_timeout_ms", self.timeouts.socket_timeout_ms),
            ("selection_timeout_ms", self.timeouts.selection_timeout_ms),
            ("operation_timeout_ms", self.timeouts.operation_timeout_ms),
            ("heartbeat_interval_ms", self.health.heartbeat_interval_ms),
            ("min_heartbeat_interval_ms", self.health.min_heartbeat_interval_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ValidationError(format!(
                "{} must be greater than 0",
                name
            )));
        }

        if self.health.min_heartbeat_interval_ms > self.health.heartbeat_interval_ms {
            return Err(ConfigError::ValidationError(
                "min_heartbeat_interval_ms cannot exceed heartbeat_interval_ms".to_string(),
            ));
        }

        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Parsed seed list
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        if self.client.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one endpoint must be specified".to_string(),
            ));
        }
        self.client
            .endpoints
            .iter()
            .map(|endpoint| endpoint.parse().map_err(ConfigError::ValidationError))
            .collect()
    }

    pub fn read_preference(&self) -> Result<ReadPreference, ConfigError> {
        self.client
            .read_preference
            .parse()
            .map_err(ConfigError::ValidationError)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(self.timeouts.connect_timeout_ms),
            app_name: self.client.app_name.clone(),
            max_message_size: self.client.max_message_size_bytes,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_size: self.pool.max_pool_size,
            min_size: self.pool.min_pool_size,
            max_idle: Duration::from_millis(self.pool.max_idle_ms),
            wait_queue_timeout: Duration::from_millis(self.pool.wait_queue_timeout_ms),
            maintenance_interval: Duration::from_millis(self.pool.maintenance_interval_ms),
        }
    }

    pub fn topology_options(&self) -> TopologyOptions {
        TopologyOptions {
            selection_timeout: Duration::from_millis(self.timeouts.selection_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.health.heartbeat_interval_ms),
            min_heartbeat_interval: Duration::from_millis(self.health.min_heartbeat_interval_ms),
            failure_threshold: self.health.failure_threshold,
            pool: self.pool_options(),
            connection: self.connection_options(),
        }
    }

    pub fn executor_options(&self) -> Result<ExecutorOptions, ConfigError> {
        let retry = if self.client.retry_enabled {
            RetryPolicy {
                enabled: true,
                max_retries: self.client.max_retries,
            }
        } else {
            RetryPolicy::disabled()
        };
        Ok(ExecutorOptions {
            socket_timeout: Duration::from_millis(self.timeouts.socket_timeout_ms),
            wait_queue_timeout: Duration::from_millis(self.pool.wait_queue_timeout_ms),
            operation_timeout: Duration::from_millis(self.timeouts.operation_timeout_ms),
            read_preference: self.read_preference()?,
            retry,
        })
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "single" => Config::default(),
            "replica-set" => Config {
                client: ClientConfig {
                    endpoints: vec![
                        "10.0.1.10:27017".to_string(),
                        "10.0.1.11:27017".to_string(),
                        "10.0.1.12:27017".to_string(),
                    ],
                    read_preference: "primaryPreferred".to_string(),
                    ..Default::default()
                },
                pool: PoolConfig {
                    min_pool_size: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
            _ => return Err(ConfigError::ValidationError(
                "Mode must be 'single' or 'replica-set'".to_string(),
            )),
        };

        config.save_to_file(path)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| {
        ConfigError::ValidationError(format!("invalid value '{}' for option {}", value, key))
    })
}
