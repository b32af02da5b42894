// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Broker configuration: transport binding plus the options the core
/// recognizes (heartbeat timing, request timeouts, backpressure limits,
/// payload sizing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Milliseconds of silence before a `HEALTHY` service is probed.
    #[serde(default = "default_heartbeat_retry_timeout_ms")]
    pub heartbeat_retry_timeout_ms: u64,

    /// Milliseconds after entering `PROBING` before deregistration.
    #[serde(default = "default_heartbeat_deregister_timeout_ms")]
    pub heartbeat_deregister_timeout_ms: u64,

    /// Default per-request TTL, in milliseconds, when the sender does
    /// not specify one.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_default_ms: u64,

    /// Hard cap on any requested TTL, in milliseconds.
    #[serde(default = "default_request_timeout_max_ms")]
    pub request_timeout_max_ms: u64,

    /// Maximum number of outstanding requests before oldest-eviction
    /// kicks in.
    #[serde(default = "default_max_outstanding_requests")]
    pub max_outstanding_requests: usize,

    /// Maximum message payload length, in bytes.
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    /// Maximum header line length, in bytes.
    #[serde(default = "default_max_header_len")]
    pub max_header_len: usize,

    /// Maximum accepted frame size (`max_payload + max_header` unless
    /// overridden); exceeding it closes the connection.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// `tracing` filter directive, e.g. `"info"` or `"topic_broker=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    7600
}

fn default_heartbeat_retry_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_deregister_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_max_ms() -> u64 {
    60_000
}

fn default_max_outstanding_requests() -> usize {
    10_000
}

fn default_max_payload_len() -> usize {
    1024 * 1024
}

fn default_max_header_len() -> usize {
    512
}

fn default_max_frame_len() -> usize {
    default_max_payload_len() + default_max_header_len()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            heartbeat_retry_timeout_ms: default_heartbeat_retry_timeout_ms(),
            heartbeat_deregister_timeout_ms: default_heartbeat_deregister_timeout_ms(),
            request_timeout_default_ms: default_request_timeout_ms(),
            request_timeout_max_ms: default_request_timeout_max_ms(),
            max_outstanding_requests: default_max_outstanding_requests(),
            max_payload_len: default_max_payload_len(),
            max_header_len: default_max_header_len(),
            max_frame_len: default_max_frame_len(),
            log_level: default_log_level(),
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Saves configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn heartbeat_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_retry_timeout_ms)
    }

    pub fn heartbeat_deregister_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_deregister_timeout_ms)
    }

    /// Clamps a requested per-request timeout to the configured default
    /// and maximum.
    pub fn effective_request_timeout(&self, requested: Option<u64>) -> Duration {
        let ms = requested.unwrap_or(self.request_timeout_default_ms);
        Duration::from_millis(ms.min(self.request_timeout_max_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.heartbeat_retry_timeout_ms == 0 || self.heartbeat_deregister_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat timeouts must be nonzero".into(),
            ));
        }
        if self.request_timeout_default_ms == 0 || self.request_timeout_max_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "request timeouts must be nonzero".into(),
            ));
        }
        if self.request_timeout_default_ms > self.request_timeout_max_ms {
            return Err(ConfigError::InvalidValue(
                "request.response.timeout.default cannot exceed request.response.timeout.max".into(),
            ));
        }
        if self.max_outstanding_requests == 0 {
            return Err(ConfigError::InvalidValue(
                "max.outstanding.requests cannot be 0".into(),
            ));
        }
        if self.max_payload_len == 0 {
            return Err(ConfigError::InvalidValue(
                "message.payload.maxLength cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {s}"),
            Self::Parse(s) => write!(f, "parse error: {s}"),
            Self::Serialize(s) => write!(f, "serialize error: {s}"),
            Self::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
