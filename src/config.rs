//! Engine configuration parameters
//!
//! All tunable parameters for the protocol engine.
//! Loaded through [`ConfigPort`](crate::app::ports::ConfigPort); missing
//! fields take their defaults.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;
use crate::rpc::codec::DEFAULT_MAX_FRAME_SIZE;

/// Where the controller is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionTarget {
    /// TCP endpoint, e.g. a controller on the LAN.
    Tcp { host: String, port: u16 },
    /// USB-serial device path.
    Serial { path: String, baud_rate: u32 },
    /// In-process simulated controller.
    Simulation,
}

/// Core engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // --- Connection ---
    pub target: ConnectionTarget,
    /// Expected controller device id; any device is accepted when unset
    pub device_id: Option<String>,

    // --- Framing ---
    /// Largest frame payload accepted or sent (bytes)
    pub max_frame_size: usize,

    // --- Commands ---
    /// Per-attempt response deadline (milliseconds)
    pub command_timeout_ms: u64,
    /// Extra attempts after the first one times out
    pub retry_limit: u32,

    // --- Handshake ---
    /// Protocol version this host speaks (first 8 chars compared)
    pub proto_version: String,
    pub skip_version_check: bool,
    /// Version prompt interval while waiting for the handshake (milliseconds)
    pub handshake_ping_ms: u64,
    pub handshake_timeout_ms: u64,

    // --- Reconnect ---
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_connect_attempts: u32,

    // --- Broadcast ---
    /// Snapshot interval (milliseconds); 0 disables broadcasting
    pub broadcast_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Connection
            target: ConnectionTarget::Tcp {
                host: "localhost".into(),
                port: 8332,
            },
            device_id: None,

            // Framing
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,

            // Commands
            command_timeout_ms: 5_000,
            retry_limit: 2,

            // Handshake
            proto_version: "3f2243a".into(),
            skip_version_check: false,
            handshake_ping_ms: 1_000,
            handshake_timeout_ms: 120_000,

            // Reconnect
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 30_000,
            max_connect_attempts: 20,

            // Broadcast
            broadcast_interval_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn handshake_ping(&self) -> Duration {
        Duration::from_millis(self.handshake_ping_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Option<Duration> {
        (self.broadcast_interval_ms > 0).then(|| Duration::from_millis(self.broadcast_interval_ms))
    }
}

/// Range-check every field.  Callers validate before use and before persisting.
pub fn validate_config(cfg: &EngineConfig) -> Result<(), ConfigError> {
    if !(16..=65_535).contains(&cfg.max_frame_size) {
        return Err(ConfigError::ValidationFailed(
            "max_frame_size must be 16–65535",
        ));
    }
    if !(10..=600_000).contains(&cfg.command_timeout_ms) {
        return Err(ConfigError::ValidationFailed(
            "command_timeout_ms must be 10–600000",
        ));
    }
    if cfg.retry_limit > 10 {
        return Err(ConfigError::ValidationFailed("retry_limit must be 0–10"));
    }
    if cfg.proto_version.is_empty() && !cfg.skip_version_check {
        return Err(ConfigError::ValidationFailed(
            "proto_version is required unless skip_version_check is set",
        ));
    }
    if cfg.handshake_ping_ms == 0 || cfg.handshake_ping_ms > cfg.handshake_timeout_ms {
        return Err(ConfigError::ValidationFailed(
            "handshake_ping_ms must be > 0 and <= handshake_timeout_ms",
        ));
    }
    if cfg.reconnect_base_ms == 0 || cfg.reconnect_base_ms > cfg.reconnect_max_ms {
        return Err(ConfigError::ValidationFailed(
            "reconnect_base_ms must be > 0 and <= reconnect_max_ms",
        ));
    }
    if cfg.max_connect_attempts == 0 {
        return Err(ConfigError::ValidationFailed(
            "max_connect_attempts must be at least 1",
        ));
    }
    match &cfg.target {
        ConnectionTarget::Tcp { host, port } if host.is_empty() || *port == 0 => Err(
            ConfigError::ValidationFailed("tcp target needs a host and a non-zero port"),
        ),
        ConnectionTarget::Serial { path, baud_rate } if path.is_empty() || *baud_rate == 0 => Err(
            ConfigError::ValidationFailed("serial target needs a path and a baud rate"),
        ),
        _ => Ok(()),
    }
}
