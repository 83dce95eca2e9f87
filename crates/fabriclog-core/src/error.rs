//! Error types for the fabriclog pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or persisting checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid checkpoint value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to serialize checkpoints: {0}")]
    Serialize(String),

    #[error("Checkpoint writer has shut down")]
    WriterClosed,
}

/// Errors from a single structured decode step.
///
/// These never leave the decoder's fallback functions; they exist so each
/// step can be tested on its own.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to decode {message}: {reason}")]
    Protobuf {
        message: &'static str,
        reason: String,
    },

    #[error("Decoded {message} has unexpected shape: {reason}")]
    Shape {
        message: &'static str,
        reason: String,
    },
}

/// Errors surfaced by the ledger client boundary.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("Connection to channel '{channel}' failed: {reason}")]
    ConnectionFailed { channel: String, reason: String },

    #[error("Peer with name \"{peer}\" not assigned to channel '{channel}'")]
    PeerNotAssigned { peer: String, channel: String },

    #[error("Event stream for '{channel}' closed")]
    Closed { channel: String },

    #[error("Ledger client not initialized")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

impl LedgerError {
    /// Returns `true` for the connection-profile quirk where the peer has to
    /// be associated with the channel object before subscribing.
    pub fn is_peer_not_assigned(&self) -> bool {
        matches!(self, Self::PeerNotAssigned { .. })
    }
}

/// Errors from the listener manager.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Subscription '{key}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: LedgerError,
    },

    #[error("Subscription '{key}' was removed while registering")]
    Cancelled { key: String },

    #[error("Listener manager is shut down")]
    ShutDown,
}

/// Errors from the record router and its sinks.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Sink endpoint not available after {ms}ms")]
    Unavailable { ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Sink is closed")]
    Closed,
}
