//! Durable journals consumed by the session engine.
//!
//! The publish journal keeps guaranteed publishes until the server reports
//! them persisted, so they can be replayed after a disconnect or crash.
//! The bookmark journal tracks how far each bookmark subscription has been
//! consumed, so a resubscribe can resume at the right log position.
//!
//! The session is the only writer and never issues two writes to the same
//! journal concurrently. Diagnostic reads may happen at any time.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Error types.
pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use sowlink_message::{Identifier, Message};

pub use error::JournalError;

/// A stored guaranteed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedPublish {
    /// Sequence number assigned at store time.
    pub sequence: u64,
    /// The publish, with its `sequence` field set.
    pub message: Message,
}

/// Receives entries during a replay.
#[async_trait]
pub trait ReplaySink: Send {
    /// Accept one entry. An error stops the replay and is returned by it.
    async fn replay(&mut self, entry: SequencedPublish) -> Result<(), JournalError>;
}

/// Local record of guaranteed publishes awaiting persistence.
#[async_trait]
pub trait PublishJournal: Send + Sync + 'static {
    /// Assign the next sequence number to `message` and store it.
    ///
    /// Sequence numbers are strictly increasing.
    async fn store(&self, message: Message) -> Result<u64, JournalError>;

    /// Drop every entry with a sequence number at or below `sequence`.
    async fn discard_up_to(&self, sequence: u64) -> Result<(), JournalError>;

    /// Feed every retained entry to `sink` in ascending order.
    async fn replay(&self, sink: &mut dyn ReplaySink) -> Result<(), JournalError>;

    /// Feed the entry numbered `sequence` to `sink`.
    ///
    /// Returns `false` if the entry was already discarded or never stored.
    /// Fails with [`JournalError::Gap`] if the entry was lost before being
    /// persisted.
    async fn replay_single(
        &self,
        sink: &mut dyn ReplaySink,
        sequence: u64,
    ) -> Result<bool, JournalError>;

    /// Entries stored but not yet discarded.
    fn unpersisted_count(&self) -> usize;

    /// Highest sequence number discarded as persisted.
    fn last_persisted(&self) -> u64;

    /// Highest sequence number assigned.
    fn last_stored(&self) -> u64;

    /// Lowest retained sequence number, if any entry is retained.
    fn oldest_retained(&self) -> Option<u64>;

    /// Ensure the next stored entry is numbered above `sequence`.
    ///
    /// Used when the server knows of sequence numbers this journal does not.
    async fn advance_to(&self, sequence: u64) -> Result<(), JournalError>;

    /// Wait until every entry has been discarded.
    async fn flush(&self, timeout: Duration) -> Result<(), JournalError>;

    /// Check that resuming after the server's last persisted `server_last`
    /// leaves no hole.
    ///
    /// Fails with [`JournalError::Gap`] when entries the server never
    /// persisted are no longer retained.
    fn verify_resume(&self, server_last: u64) -> Result<(), JournalError> {
        let last_stored = self.last_stored();
        let first_available = self.oldest_retained().unwrap_or(last_stored + 1);
        if server_last < last_stored && server_last + 1 < first_available {
            return Err(JournalError::Gap {
                requested: server_last + 1,
                oldest_retained: first_available,
            });
        }
        Ok(())
    }
}

/// Per-subscription record of consumed transaction log positions.
#[async_trait]
pub trait BookmarkJournal: Send + Sync + 'static {
    /// Record the arrival of `message`. Returns its index within the
    /// subscription.
    async fn log(&self, message: &Message) -> Result<u64, JournalError>;

    /// Mark `message` consumed by the application.
    async fn discard(&self, message: &Message) -> Result<(), JournalError>;

    /// Record that the server persisted the subscription up to `bookmark`.
    async fn persisted(&self, sub_id: &Identifier, bookmark: &str) -> Result<(), JournalError>;

    /// Whether `message` was already logged or consumed.
    async fn is_discarded(&self, message: &Message) -> Result<bool, JournalError>;

    /// The bookmark to resume `sub_id` from, if any.
    async fn most_recent(&self, sub_id: &Identifier) -> Result<Option<String>, JournalError>;

    /// Forget everything about `sub_id`.
    async fn purge(&self, sub_id: &Identifier) -> Result<(), JournalError>;
}
