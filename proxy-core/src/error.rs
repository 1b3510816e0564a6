//! Error types for session pipeline operations

use proxy_common::ConnectionId;
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Reset, refused, TLS failure, short write
    #[error("Transport error: {details}")]
    Transport { details: String },

    /// Bytes sat unconsumed in an engine buffer past the watchdog deadline
    #[error("Watchdog stall: {buffered} bytes unconsumed after {timeout_ms}ms")]
    Watchdog { buffered: usize, timeout_ms: u64 },

    /// A codec refused to decode or encode a message
    #[error("Codec error in {codec}: {reason}")]
    Codec { codec: String, reason: String },

    /// A pipeline hook could not complete
    #[error("Hook error: {reason}")]
    Hook { reason: String },

    #[error("Unknown codec: {name}")]
    UnknownCodec { name: String },

    /// The session a replay wanted to reuse is no longer registered
    #[error("Connection {conn} is already closed")]
    ConnectionGone { conn: ConnectionId },

    #[error("Timeout occurred: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Replay error: {reason}")]
    Replay { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Plugin error in {path}: {reason}")]
    Plugin { path: String, reason: String },

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn transport(details: impl Into<String>) -> Self {
        Self::Transport {
            details: details.into(),
        }
    }

    pub fn codec(codec: &str, reason: impl Into<String>) -> Self {
        Self::Codec {
            codec: codec.to_string(),
            reason: reason.into(),
        }
    }

    pub fn hook(reason: impl Into<String>) -> Self {
        Self::Hook {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn timeout(operation: &str, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Faults that end a session without being retried
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Watchdog { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }
}
