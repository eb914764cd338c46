//! Error types for transports.

use std::time::Duration;

use sowlink_message::CodecError;
use thiserror::Error;

use crate::ConnectionEpoch;

/// Transport operation errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection is live.
    #[error("Not connected")]
    NotConnected,

    /// The connection of the given epoch was lost.
    #[error("Connection {epoch} lost: {reason}")]
    Disconnected {
        /// Epoch of the lost connection.
        epoch: ConnectionEpoch,
        /// Why it was lost.
        reason: String,
    },

    /// Connecting failed.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connecting took too long.
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The transport was shut down.
    #[error("Transport shut down")]
    Shutdown,

    /// A frame exceeded the configured maximum.
    #[error("Frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a later reconnect could make the operation succeed.
    #[must_use]
    pub const fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::Disconnected { .. }
                | Self::ConnectionFailed(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }
}
