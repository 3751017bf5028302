//! Port traits: the boundary between the protocol engine and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Datastore / Synchronizer / Broadcaster
//! ```
//!
//! Driven adapters (storage, event sinks, clocks) implement these traits.
//! The engine consumes them via generics, so the core never touches the
//! filesystem or the system clock directly.
//!
//! - **ConfigPort** implementations MUST validate before persisting.
//! - **StoragePort** writes MUST be atomic: a reader sees the old value or
//!   the new one, never a mix.

use crate::app::events::EngineEvent;
use crate::config::EngineConfig;

// ───────────────────────────────────────────────────────────────
// Event sink port (engine → pub/sub, logging)
// ───────────────────────────────────────────────────────────────

/// The engine emits structured [`EngineEvent`]s through this port.
/// Adapters decide where they go (log, message broker, test recorder).
pub trait EventSink {
    fn emit(&mut self, event: &EngineEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (engine ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists engine configuration.
///
/// Invalid values are rejected with [`ConfigError::ValidationFailed`],
/// not silently clamped.
pub trait ConfigPort {
    /// Load configuration from persistent storage.
    /// Returns [`EngineConfig::default()`] if no stored config exists.
    fn load(&self) -> Result<EngineConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&self, config: &EngineConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (engine ↔ disk)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value storage, namespaced per subsystem.
pub trait StoragePort {
    /// Read a whole value.
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Clock port (host time for the controller clock)
// ───────────────────────────────────────────────────────────────

pub trait ClockPort {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Stored config failed deserialization.
    Corrupted,
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    IoError,
}

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage device is full.
    Full,
    /// Generic I/O error.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::StorageFull => Self::Full,
            _ => Self::IoError,
        }
    }
}
