//! Configuration management for the Tether hub.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/server.toml`.

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port the hub listens on.
pub const DEFAULT_PORT: u16 = 8768;

/// Default handshake deadline in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Smallest frame limit accepted by validation.
const MIN_FRAME_SIZE: usize = 1024;

/// Largest frame limit accepted by validation (256 MiB).
const MAX_FRAME_SIZE_LIMIT: usize = 256 * 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be non-zero")]
    InvalidPort,

    #[error("listen_address must be an IP address, got {0}")]
    InvalidListenAddress(String),

    #[error("tls is enabled but {0} is not set")]
    MissingTlsFile(&'static str),

    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("max_frame_size must be between 1024 and 268435456 bytes, got {0}")]
    InvalidMaxFrameSize(usize),

    #[error("password_sha256 for user {0} must be 64 hex characters")]
    InvalidPasswordHash(String),

    #[error("user {0} is listed more than once")]
    DuplicateUser(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// TLS configuration.
    pub tls: TlsConfig,

    /// Connection handling.
    pub network: NetworkConfig,

    /// Viewer login.
    pub auth: AuthConfig,

    /// Logging output.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub listen_address: String,

    /// Port to bind. Zero is only valid in tests (ephemeral port).
    pub port: u16,

    /// Long-term hub uuid reported during the handshake. Random per start if unset.
    pub uuid: Option<String>,
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap accepted sockets in TLS.
    pub enabled: bool,

    /// PEM certificate chain.
    pub cert_path: Option<PathBuf>,

    /// PEM private key.
    pub key_path: Option<PathBuf>,
}

/// Connection handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Seconds a new connection has to finish its handshake.
    pub handshake_timeout_secs: u64,

    /// Largest accepted frame body in bytes.
    pub max_frame_size: usize,

    /// Answer envelopes for unknown recipients with `EndpointClosed`
    /// instead of dropping them.
    pub notify_endpoint_closed: bool,
}

/// Login configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Viewers must log in before they are established.
    pub require_login: bool,

    /// Accepted accounts.
    pub users: Vec<UserEntry>,
}

/// One accepted account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserEntry {
    pub username: String,

    /// Lowercase hex SHA-256 of the password (see `tether-server hash-password`).
    pub password_sha256: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rotated log files. Logs go to stderr only if unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            uuid: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            max_frame_size: protocol::MAX_FRAME_SIZE,
            notify_endpoint_closed: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_login: true,
            users: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("server.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_LISTEN_ADDRESS: Override the bind address
    /// - TETHER_PORT: Override the bind port
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("TETHER_LISTEN_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding listen_address from environment: {}", address);
                self.server.listen_address = address;
            }
        }

        if let Ok(port) = std::env::var("TETHER_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.server.port = port;
                    }
                    Err(_) => tracing::warn!("Ignoring invalid TETHER_PORT: {}", port),
                }
            }
        }

        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.server.listen_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddress(
                self.server.listen_address.clone(),
            ));
        }

        if self.tls.enabled {
            if self.tls.cert_path.is_none() {
                return Err(ConfigError::MissingTlsFile("cert_path"));
            }
            if self.tls.key_path.is_none() {
                return Err(ConfigError::MissingTlsFile("key_path"));
            }
        }

        let timeout = self.network.handshake_timeout_secs;
        if !(1..=300).contains(&timeout) {
            return Err(ConfigError::InvalidHandshakeTimeout(timeout));
        }

        let frame = self.network.max_frame_size;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&frame) {
            return Err(ConfigError::InvalidMaxFrameSize(frame));
        }

        let mut seen = HashSet::new();
        for user in &self.auth.users {
            let hash = &user.password_sha256;
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::InvalidPasswordHash(user.username.clone()));
            }
            if !seen.insert(user.username.as_str()) {
                return Err(ConfigError::DuplicateUser(user.username.clone()));
            }
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
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
