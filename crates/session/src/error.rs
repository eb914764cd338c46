//! Error types for the session.

use std::time::Duration;

use sowlink_journal::JournalError;
use sowlink_message::{AckReason, Command, CommandKind, Identifier, MessageError};
use sowlink_transport::TransportError;
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Session operation errors
#[derive(Debug, Error)]
pub enum Error {
    /// The call was malformed.
    #[error("Invalid usage: {0}")]
    Usage(String),

    /// No connection exists, or the connection a wait depended on was lost.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The deadline passed without the expected response.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// The server rejected the command.
    #[error("Server rejected {command}: {reason}")]
    ServerFailure {
        /// Kind of the rejected command.
        command: CommandKind,
        /// Why the server rejected it.
        reason: AckReason,
        /// A corrected copy of the command worth retrying, if the session
        /// could derive one.
        retry: Option<Box<Command>>,
    },

    /// Resuming would skip publishes the server never persisted.
    #[error("Publish gap: sequence {requested} is needed but oldest retained is {oldest_retained}")]
    Gap {
        /// First sequence number the server is missing.
        requested: u64,
        /// First sequence number the journal still holds.
        oldest_retained: u64,
    },

    /// A live subscription already uses this id.
    #[error("Subscription {0} already exists")]
    SubscriptionExists(Identifier),

    /// Subscriptions are being re-established; try again later.
    #[error("Resubscription in progress")]
    ResubscriptionInProgress,

    /// The session was closed.
    #[error("Session closed")]
    Shutdown,

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Journal failure.
    #[error(transparent)]
    Journal(JournalError),
}

impl Error {
    /// Whether retrying after a reconnect could succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Disconnected(_) | Self::TimedOut(_) | Self::ResubscriptionInProgress => true,
            Self::Transport(err) => err.is_connection_loss(),
            _ => false,
        }
    }

    /// The server's reason, if the server rejected the command.
    #[must_use]
    pub const fn reason(&self) -> Option<&AckReason> {
        match self {
            Self::ServerFailure { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<JournalError> for Error {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Gap {
                requested,
                oldest_retained,
            } => Self::Gap {
                requested,
                oldest_retained,
            },
            JournalError::Timeout(after) => Self::TimedOut(after),
            other => Self::Journal(other),
        }
    }
}

impl From<MessageError> for Error {
    fn from(err: MessageError) -> Self {
        Self::Usage(err.to_string())
    }
}

/// Why a message handler did not accept a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler's buffer is full; redeliver later.
    #[error("Stream full")]
    StreamFull,

    /// The handler no longer accepts messages.
    #[error("Handler closed")]
    Closed,

    /// The handler failed.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}
