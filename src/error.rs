//! Unified error types for the protocol engine.
//!
//! A single `Error` enum that every subsystem converts into, so the REST
//! collaborator and the supervisor handle failures uniformly.  Subsystem
//! errors stay small and cloneable: a `CommandError` is delivered to a
//! waiting caller through a signal and must not borrow anything.
//!
//! Frame corruption is deliberately absent here.  The framer reports it as
//! an event ([`FrameFault`](crate::rpc::codec::FrameFault)) that is counted
//! and dropped, never returned to a caller.

use core::fmt;

use crate::app::ports::{ConfigError, StorageError};
use crate::rpc::command::{ErrorCode, Opcode};

// ---------------------------------------------------------------------------
// Top-level engine error
// ---------------------------------------------------------------------------

/// Every fallible engine operation funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Object encoding or decoding failed.
    Codec(CodecError),
    /// A command could not be completed.
    Command(CommandError),
    /// An identity lookup or mutation failed.
    Store(StoreError),
    /// A synchronization step rejected the controller.
    Sync(SyncError),
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
    /// The supervisor gave up reconnecting.
    RetriesExhausted(u32),
    /// The engine thread could not be started or stopped cleanly.
    Runtime(String),
}

/// Coarse classification used at the REST boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownType,
    DecodeError,
    EncodeError,
    Timeout,
    ConnectionLost,
    NotReady,
    Rejected,
    NotFound,
    Conflict,
    InvalidId,
    IncompatibleFirmware,
    InvalidDeviceId,
    Storage,
    Config,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(CodecError::UnknownType(_)) => ErrorKind::UnknownType,
            Self::Codec(CodecError::Decode { .. }) => ErrorKind::DecodeError,
            Self::Codec(CodecError::Encode { .. } | CodecError::DuplicateType(_)) => {
                ErrorKind::EncodeError
            }
            Self::Command(CommandError::Timeout { .. }) => ErrorKind::Timeout,
            Self::Command(CommandError::ConnectionLost) => ErrorKind::ConnectionLost,
            Self::Command(CommandError::NotReady(_)) => ErrorKind::NotReady,
            Self::Command(CommandError::Rejected { .. } | CommandError::Malformed(_)) => {
                ErrorKind::Rejected
            }
            Self::Command(CommandError::Oversize(_)) => ErrorKind::EncodeError,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::Store(StoreError::InvalidId(_)) => ErrorKind::InvalidId,
            Self::Store(StoreError::Storage(_) | StoreError::Corrupted) => ErrorKind::Storage,
            Self::Sync(SyncError::IncompatibleFirmware { .. }) => ErrorKind::IncompatibleFirmware,
            Self::Sync(SyncError::InvalidDeviceId { .. }) => ErrorKind::InvalidDeviceId,
            Self::Sync(SyncError::HandshakeTimeout) => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            Self::RetriesExhausted(_) => ErrorKind::ConnectionLost,
            Self::Runtime(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-style status category for the REST collaborator.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidId
            | ErrorKind::UnknownType
            | ErrorKind::DecodeError
            | ErrorKind::EncodeError => 400,
            ErrorKind::Timeout => 504,
            ErrorKind::ConnectionLost | ErrorKind::NotReady => 503,
            ErrorKind::Rejected => 502,
            ErrorKind::IncompatibleFirmware | ErrorKind::InvalidDeviceId => 424,
            ErrorKind::Storage | ErrorKind::Config | ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "codec: {e}"),
            Self::Command(e) => write!(f, "command: {e}"),
            Self::Store(e) => write!(f, "datastore: {e}"),
            Self::Sync(e) => write!(f, "synchronization: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::RetriesExhausted(n) => write!(f, "gave up after {n} connection attempts"),
            Self::Runtime(msg) => write!(f, "engine runtime: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Reference to an object type, by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Id(u16),
    Name(String),
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No transcoder is registered for the type.
    UnknownType(TypeRef),
    /// Bytes could not be decoded into fields.
    Decode { type_id: u16, reason: String },
    /// Fields could not be encoded into bytes.
    Encode { type_id: u16, reason: String },
    /// Two transcoders were registered for one type id.
    DuplicateType(u16),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown object type {t}"),
            Self::Decode { type_id, reason } => write!(f, "decode #{type_id} failed: {reason}"),
            Self::Encode { type_id, reason } => write!(f, "encode #{type_id} failed: {reason}"),
            Self::DuplicateType(id) => write!(f, "duplicate transcoder for #{id}"),
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No matching response after every attempt.
    Timeout { opcode: Opcode, attempts: u32 },
    /// The connection dropped while the command was queued or in flight.
    ConnectionLost,
    /// The connection is not in a state that accepts this caller.
    NotReady(crate::fsm::ConnectionState),
    /// The controller answered with an error status.
    Rejected { opcode: Opcode, code: ErrorCode },
    /// The controller answered with something that is not a response.
    Malformed(&'static str),
    /// The encoded command exceeds the maximum frame size.
    Oversize(usize),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { opcode, attempts } => {
                write!(f, "{opcode:?} timed out after {attempts} attempts")
            }
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::NotReady(state) => write!(f, "connection not ready ({state:?})"),
            Self::Rejected { opcode, code } => write!(f, "{opcode:?} rejected: {code}"),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
            Self::Oversize(len) => write!(f, "command of {len} bytes exceeds frame limit"),
        }
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

// ---------------------------------------------------------------------------
// Datastore errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record resolves the given identity.
    NotFound(String),
    /// The stable identity is already taken.
    Conflict(String),
    /// The stable identity is not acceptable.
    InvalidId(String),
    /// The persisted snapshot failed its integrity check.
    Corrupted,
    /// The storage backend failed.
    Storage(StorageError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "'{id}' not found"),
            Self::Conflict(id) => write!(f, "'{id}' already exists"),
            Self::InvalidId(id) => write!(f, "'{id}' is not a valid id"),
            Self::Corrupted => write!(f, "persisted snapshot is corrupted"),
            Self::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Synchronization errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The controller never announced itself.
    HandshakeTimeout,
    /// Protocol versions differ.
    IncompatibleFirmware { expected: String, actual: String },
    /// The controller is not the configured device.
    InvalidDeviceId { expected: String, actual: String },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeTimeout => write!(f, "no handshake from controller"),
            Self::IncompatibleFirmware { expected, actual } => {
                write!(f, "incompatible firmware: protocol '{actual}', expected '{expected}'")
            }
            Self::InvalidDeviceId { expected, actual } => {
                write!(f, "device id '{actual}' does not match '{expected}'")
            }
        }
    }
}

impl From<SyncError> for Error {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Engine-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
