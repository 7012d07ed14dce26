//! Error types for presence-core operations.
//!
//! Transport errors (`ConnectError`, `SendError`) never leave the connection
//! supervisor; they exist so the supervisor can log and classify failures.
//! Only `ControllerError` and `ConfigError` reach callers.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Transport Errors (absorbed by the supervisor)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Presence service did not acknowledge handshake within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("Presence service endpoint unavailable: {details}")]
    EndpointUnavailable { details: String },

    #[error("Presence service rejected handshake: {details}")]
    ProtocolMismatch { details: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Presence service connection closed")]
    ConnectionClosed,

    #[error("Failed to write presence update: {details}")]
    SendFailure { details: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Controller Errors (contract violations)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Presence controller already started")]
    AlreadyStarted,

    #[error("Presence controller not started")]
    NotStarted,

    #[error("Presence controller already disposed")]
    Disposed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn {name} worker: {source}")]
    WorkerSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience type alias for Results using ControllerError.
pub type Result<T> = std::result::Result<T, ControllerError>;
