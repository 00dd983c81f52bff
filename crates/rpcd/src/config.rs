//! Configuration management for the SealRPC node.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sealrpc/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("{field} is not a valid socket address: {value}")]
    InvalidListenAddress { field: &'static str, value: String },

    #[error("endpoint must start with http:// or https://, got {0}")]
    InvalidEndpoint(String),

    #[error("http_path must be non-empty and start with '/', got {0:?}")]
    InvalidHttpPath(String),

    #[error("server_public_key is not a valid 32-byte base64 key: {0}")]
    InvalidServerKey(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// File name of the node's identity key inside `data_dir`.
pub const IDENTITY_FILE: &str = "identity.key";

/// File name of the authorized keys list inside `data_dir`.
pub const AUTHORIZED_KEYS_FILE: &str = "authorized_keys.json";

/// Main configuration structure for a SealRPC node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General node configuration.
    pub node: NodeConfig,

    /// Listener configuration for `serve`.
    pub server: ServerConfig,

    /// Target configuration for `call`.
    pub client: ClientConfig,
}

/// General node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the identity key and the authorized keys list.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; empty logs to stderr only.
    pub log_file: String,
}

/// Server listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the stream binding listener.
    pub stream_listen: String,

    /// Address of the HTTP binding listener.
    pub http_listen: String,

    /// Route serving envelopes over HTTP.
    pub http_path: String,

    /// Per-connection read/write deadline in seconds.
    pub io_timeout_secs: u64,
}

/// Client target configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP endpoint of the server.
    pub endpoint: String,

    /// Stream address of the server.
    pub stream_addr: String,

    /// Server static public key (base64).
    pub server_public_key: String,

    /// Overall call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_listen: "127.0.0.1:10000".to_string(),
            http_listen: "127.0.0.1:10001".to_string(),
            http_path: "/rpc".to_string(),
            io_timeout_secs: 3,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:10001/rpc".to_string(),
            stream_addr: "127.0.0.1:10000".to_string(),
            server_public_key: String::new(),
            timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Returns the per-connection I/O deadline.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl ClientConfig {
    /// Returns the overall call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parses the configured server key.
    ///
    /// Fails if the key is unset, since no call can be made without it.
    pub fn server_key(&self) -> Result<PublicKey> {
        if self.server_public_key.trim().is_empty() {
            anyhow::bail!(
                "client.server_public_key is not set (config file or SEALRPC_SERVER_PUBLIC_KEY)"
            );
        }
        PublicKey::from_base64(&self.server_public_key).context("Invalid client.server_public_key")
    }
}

impl NodeConfig {
    /// Path of the identity key file.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILE)
    }

    /// Path of the authorized keys file.
    pub fn authorized_keys_path(&self) -> PathBuf {
        self.data_dir.join(AUTHORIZED_KEYS_FILE)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sealrpc")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sealrpc")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SEALRPC_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SEALRPC_ENDPOINT: Override the HTTP endpoint used by `call`
    /// - SEALRPC_SERVER_PUBLIC_KEY: Override the server key used by `call`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SEALRPC_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }

        if let Ok(endpoint) = std::env::var("SEALRPC_ENDPOINT") {
            if !endpoint.is_empty() {
                tracing::info!("Overriding endpoint from environment: {}", endpoint);
                self.client.endpoint = endpoint;
            }
        }

        if let Ok(key) = std::env::var("SEALRPC_SERVER_PUBLIC_KEY") {
            if !key.is_empty() {
                tracing::info!("Overriding server_public_key from environment");
                self.client.server_public_key = key;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        if self.server.io_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("server.io_timeout_secs"));
        }
        if self.client.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("client.timeout_secs"));
        }

        for (field, value) in [
            ("server.stream_listen", &self.server.stream_listen),
            ("server.http_listen", &self.server.http_listen),
        ] {
            if value.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::InvalidListenAddress {
                    field,
                    value: value.clone(),
                });
            }
        }

        if !self.server.http_path.starts_with('/') {
            return Err(ConfigError::InvalidHttpPath(self.server.http_path.clone()));
        }

        let endpoint = &self.client.endpoint;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
        }

        let key = self.client.server_public_key.trim();
        if !key.is_empty() {
            if let Err(e) = PublicKey::from_base64(key) {
                return Err(ConfigError::InvalidServerKey(e.to_string()));
            }
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
