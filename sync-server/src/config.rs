//! Configuration loading for sync-server.
//!
//! Configuration is loaded from a TOML file (default: `sync-server.toml`).
//! Every section and field is optional; missing values use the defaults
//! below.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for sync-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Orchestrator and ingestion worker pool configuration.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Rate limiting and request validation configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Credential verification configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Number of ingestion workers (default: 5).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the ingestion job queue (default: 10).
    /// Submissions wait while the queue is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum seconds to wait for a group lock (default: 0 = wait forever).
    #[serde(default)]
    pub lock_timeout_secs: u64,
}

impl ServiceConfig {
    /// Lock acquisition deadline, if one is configured.
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_secs > 0).then(|| Duration::from_secs(self.lock_timeout_secs))
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connections per endpoint per minute (default: 10).
    #[serde(default = "default_connections_per_endpoint")]
    pub connections_per_endpoint: u32,
    /// Maximum requests per device per minute (default: 100).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Maximum requests per second across all devices (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Seconds to wait for the request frame on a new stream (default: 10).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum concurrently connected sessions (default: 10000).
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Maximum operations in one inbound batch (default: 500).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum length of a device token in bytes (default: 256).
    #[serde(default = "default_max_device_token_len")]
    pub max_device_token_len: usize,
}

/// Credential verification configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 secret used to verify caller credentials.
    #[serde(default)]
    pub jwt_secret: String,
    /// Required `iss` claim, if set.
    #[serde(default)]
    pub issuer: Option<String>,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("sync.db")
}

fn default_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    10
}

fn default_connections_per_endpoint() -> u32 {
    10
}

fn default_requests_per_minute() -> u32 {
    100
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_sessions() -> usize {
    10_000
}

fn default_max_batch_size() -> usize {
    500
}

fn default_max_device_token_len() -> usize {
    256
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            lock_timeout_secs: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_endpoint: default_connections_per_endpoint(),
            requests_per_minute: default_requests_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_batch_size: default_max_batch_size(),
            max_device_token_len: default_max_device_token_len(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check values that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.jwt_secret",
                reason: "must be set".to_string(),
            });
        }
        if self.service.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "service.workers",
                reason: "must be > 0".to_string(),
            });
        }
        if self.service.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "service.queue_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        for (field, value) in [
            (
                "limits.connections_per_endpoint",
                self.limits.connections_per_endpoint,
            ),
            ("limits.requests_per_minute", self.limits.requests_per_minute),
            (
                "limits.global_requests_per_second",
                self.limits.global_requests_per_second,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is present but unusable.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
