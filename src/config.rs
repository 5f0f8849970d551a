//! # Configuration Management
//!
//! Centralized configuration for peer connections.
//!
//! This module provides structured configuration for the connection layer,
//! the listener, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Security Considerations
//! - Unauthenticated peers are limited to 4 KiB messages so they cannot force large allocations
//! - The idle timeout bounds how long a silent peer can hold a socket
//! - The read yield budget keeps one busy connection from monopolizing the reactor

use crate::core::framing::SizeLimits;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max message size accepted from a peer that has not authenticated yet (4 KiB)
pub const MAX_UNAUTH_MESSAGE_SIZE: usize = 0x1000;

/// Max message size accepted from any peer (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 0x0100_0000;

/// Stream buffering per direction (256 KiB)
pub const STREAM_BUFFER_SIZE: usize = 0x40000;

/// Default idle window before a silent connection is dropped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on outbound connect attempts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time one connection may spend draining buffered input before yielding
pub const DEFAULT_READ_YIELD_BUDGET: Duration = Duration::from_millis(1);

/// Default number of messages one connection may deliver synchronously before yielding
pub const DEFAULT_READ_YIELD_MAX_MESSAGES: usize = 1000;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OverlayConfig {
    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Listener settings
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OverlayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEER_TRANSPORT_LISTEN_ADDRESS") {
            config.listener.address = addr;
        }

        if let Ok(max) = std::env::var("PEER_TRANSPORT_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.listener.max_connections = val;
            }
        }

        if let Ok(timeout) = std::env::var("PEER_TRANSPORT_IDLE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.idle_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("PEER_TRANSPORT_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(budget) = std::env::var("PEER_TRANSPORT_READ_YIELD_BUDGET_US") {
            if let Ok(val) = budget.parse::<u64>() {
                config.connection.read_yield_budget = Duration::from_micros(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.listener.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Max incoming message size before the peer authenticates
    pub max_unauth_message_size: usize,

    /// Max incoming or outgoing message size for any peer
    pub max_message_size: usize,

    /// Bytes of stream buffering per direction
    pub buffer_size: usize,

    /// Drop the connection after this long without reads or writes
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Bound on outbound connect attempts
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Time one read cycle may spend on already-buffered messages before yielding
    #[serde(with = "micros_serde")]
    pub read_yield_budget: Duration,

    /// Messages one read cycle may deliver synchronously before yielding
    pub read_yield_max_messages: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_unauth_message_size: MAX_UNAUTH_MESSAGE_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            buffer_size: STREAM_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_yield_budget: DEFAULT_READ_YIELD_BUDGET,
            read_yield_max_messages: DEFAULT_READ_YIELD_MAX_MESSAGES,
        }
    }
}

impl ConnectionConfig {
    /// Inbound size ceilings derived from this configuration
    pub fn size_limits(&self) -> SizeLimits {
        SizeLimits {
            unauthenticated: self.max_unauth_message_size,
            authenticated: self.max_message_size,
        }
    }

    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > MAX_MESSAGE_SIZE {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum: {} bytes)",
                self.max_message_size, MAX_MESSAGE_SIZE
            ));
        }

        if self.max_unauth_message_size == 0 {
            errors.push("Max unauthenticated message size cannot be 0".to_string());
        } else if self.max_unauth_message_size > self.max_message_size {
            errors.push(
                "Max unauthenticated message size cannot exceed max message size".to_string(),
            );
        }

        if self.buffer_size < 1024 {
            errors.push("Buffer size too small (minimum: 1 KB)".to_string());
        } else if self.buffer_size > 64 * 1024 * 1024 {
            errors.push(format!(
                "Buffer size too large: {} bytes (maximum: 64 MB)",
                self.buffer_size
            ));
        }

        if self.idle_timeout.as_millis() < 100 {
            errors.push("Idle timeout too short (minimum: 100ms)".to_string());
        } else if self.idle_timeout.as_secs() > 3600 {
            errors.push("Idle timeout too long (maximum: 1 hour)".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.read_yield_budget.is_zero() {
            errors.push("Read yield budget must be greater than 0".to_string());
        } else if self.read_yield_budget.as_millis() > 100 {
            errors.push("Read yield budget too long (maximum: 100ms)".to_string());
        }

        if self.read_yield_max_messages == 0 {
            errors.push("Read yield message allowance must be greater than 0".to_string());
        }

        errors
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen address (e.g., "127.0.0.1:11625")
    pub address: String,

    /// Maximum number of concurrently accepted connections
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:11625"),
            max_connections: 1000,
        }
    }
}

impl ListenerConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Listen address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listen address format: '{}' (expected format: '0.0.0.0:11625')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peer-transport"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Sub-millisecond durations, serialized as microseconds
mod micros_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_micros(u64::deserialize(deserializer)?))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
