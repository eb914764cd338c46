//! Error types for journals.

use std::time::Duration;

use thiserror::Error;

/// Journal operation errors
#[derive(Debug, Error)]
pub enum JournalError {
    /// The requested position is older than what the journal retains.
    #[error("Journal gap: sequence {requested} requested but oldest retained is {oldest_retained}")]
    Gap {
        /// First sequence number that was needed.
        requested: u64,
        /// First sequence number actually retained.
        oldest_retained: u64,
    },

    /// A flush did not complete in time.
    #[error("Journal flush timed out after {0:?}")]
    Timeout(Duration),

    /// A message lacks a field the journal keys on.
    #[error("Message has no {0}")]
    MissingField(&'static str),

    /// The replay sink stopped the replay.
    #[error("Replay interrupted: {0}")]
    ReplayInterrupted(String),

    /// Underlying storage failed.
    #[error("Storage error: {0}")]
    Storage(String),
}
