//! Error types for the bridge.
//!
//! Transient errors (connection, timeout, send, protocol) are recovered inside
//! the endpoint that hit them. Only [`BridgeError::ProcessGone`] and
//! [`BridgeError::Closed`] propagate outward as shutdown.

use std::time::Duration;
use thiserror::Error;

use crate::state::ConnectionState;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bind, accept or connect failed.
    #[error("connection error at {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A bounded connect or read exceeded its limit.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed payload (not JSON, missing or unknown `type`).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The monitored host process disappeared from the process table.
    #[error("host process {0} is no longer running")]
    ProcessGone(u32),

    /// Writing to the peer failed with a broken-pipe class error.
    #[error("send failed: {0}")]
    SendFailure(#[source] std::io::Error),

    /// Rejected connection state change.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("endpoint is already running")]
    AlreadyRunning,

    /// The endpoint has quit; its queues no longer accept messages.
    #[error("endpoint is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    /// The compute backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the error is recovered locally by the endpoint that raised it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection { .. }
                | BridgeError::Timeout(_)
                | BridgeError::SendFailure(_)
                | BridgeError::Protocol(_)
        )
    }

    /// Whether the error shuts the endpoint down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, BridgeError::ProcessGone(_) | BridgeError::Closed)
    }
}

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;
