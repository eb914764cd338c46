use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use sowlink_journal::{BookmarkJournal, JournalError};
use sowlink_message::{Identifier, Message};
use tracing::trace;

#[derive(Debug)]
struct Logged {
    bookmark: String,
    discarded: bool,
}

/// Bookmarks of one subscription.
#[derive(Debug, Default)]
struct SubscriptionLog {
    /// Logged but not contiguously discarded, oldest first.
    outstanding: VecDeque<Logged>,
    /// Arrival index of every bookmark ever logged.
    index_of: HashMap<String, u64>,
    next_index: u64,
    /// Newest bookmark with everything before it discarded.
    recent: Option<(u64, String)>,
    persisted: Option<String>,
}

impl SubscriptionLog {
    fn compact(&mut self) {
        while self.outstanding.front().is_some_and(|l| l.discarded) {
            if let Some(done) = self.outstanding.pop_front() {
                let index = self.index_of.get(&done.bookmark).copied().unwrap_or(0);
                self.recent = Some((index, done.bookmark));
            }
        }
    }

    fn most_recent(&self) -> Option<String> {
        let persisted = self
            .persisted
            .as_ref()
            .map(|b| (self.index_of.get(b).copied(), b));
        match (&self.recent, persisted) {
            (Some((recent_index, _)), Some((Some(persisted_index), persisted)))
                if persisted_index > *recent_index =>
            {
                Some(persisted.clone())
            }
            (Some((_, recent)), _) => Some(recent.clone()),
            (None, Some((_, persisted))) => Some(persisted.clone()),
            (None, None) => None,
        }
    }
}

/// Bookmark journal held in memory.
#[derive(Debug, Default)]
pub struct MemoryBookmarkJournal {
    subscriptions: Mutex<HashMap<Identifier, SubscriptionLog>>,
}

impl MemoryBookmarkJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(message: &Message) -> Result<(Identifier, String), JournalError> {
    let sub_id = message
        .subscription_ids()
        .next()
        .cloned()
        .ok_or(JournalError::MissingField("subscription id"))?;
    let bookmark = message
        .bookmark
        .clone()
        .filter(|b| !b.is_empty())
        .ok_or(JournalError::MissingField("bookmark"))?;
    Ok((sub_id, bookmark))
}

#[async_trait]
impl BookmarkJournal for MemoryBookmarkJournal {
    async fn log(&self, message: &Message) -> Result<u64, JournalError> {
        let (sub_id, bookmark) = key(message)?;
        let mut subscriptions = self.subscriptions.lock();
        let log = subscriptions.entry(sub_id).or_default();
        if let Some(&index) = log.index_of.get(&bookmark) {
            return Ok(index);
        }
        let index = log.next_index;
        log.next_index += 1;
        log.index_of.insert(bookmark.clone(), index);
        log.outstanding.push_back(Logged {
            bookmark,
            discarded: false,
        });
        Ok(index)
    }

    async fn discard(&self, message: &Message) -> Result<(), JournalError> {
        let (sub_id, bookmark) = key(message)?;
        let mut subscriptions = self.subscriptions.lock();
        if let Some(log) = subscriptions.get_mut(&sub_id) {
            if let Some(entry) = log.outstanding.iter_mut().find(|l| l.bookmark == bookmark) {
                entry.discarded = true;
            }
            log.compact();
            trace!(%sub_id, %bookmark, "discarded bookmark");
        }
        Ok(())
    }

    async fn persisted(&self, sub_id: &Identifier, bookmark: &str) -> Result<(), JournalError> {
        self.subscriptions
            .lock()
            .entry(sub_id.clone())
            .or_default()
            .persisted = Some(bookmark.to_string());
        Ok(())
    }

    async fn is_discarded(&self, message: &Message) -> Result<bool, JournalError> {
        let (sub_id, bookmark) = key(message)?;
        Ok(self
            .subscriptions
            .lock()
            .get(&sub_id)
            .is_some_and(|log| log.index_of.contains_key(&bookmark)))
    }

    async fn most_recent(&self, sub_id: &Identifier) -> Result<Option<String>, JournalError> {
        Ok(self
            .subscriptions
            .lock()
            .get(sub_id)
            .and_then(SubscriptionLog::most_recent))
    }

    async fn purge(&self, sub_id: &Identifier) -> Result<(), JournalError> {
        self.subscriptions.lock().remove(sub_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sowlink_message::CommandKind;

    use super::*;

    fn delivery(bookmark: &str) -> Message {
        Message::new(CommandKind::Publish)
            .with_sub_id("s1")
            .with_bookmark(bookmark)
    }

    #[tokio::test]
    async fn test_most_recent_waits_for_contiguous_discards() {
        let journal = MemoryBookmarkJournal::new();
        let sub = Identifier::from("s1");
        for b in ["1|10|", "1|11|", "1|12|"] {
            journal.log(&delivery(b)).await.unwrap();
        }
        assert_eq!(journal.most_recent(&sub).await.unwrap(), None);

        journal.discard(&delivery("1|11|")).await.unwrap();
        assert_eq!(journal.most_recent(&sub).await.unwrap(), None);

        journal.discard(&delivery("1|10|")).await.unwrap();
        assert_eq!(
            journal.most_recent(&sub).await.unwrap().as_deref(),
            Some("1|11|")
        );
    }

    #[tokio::test]
    async fn test_newer_persisted_bookmark_wins() {
        let journal = MemoryBookmarkJournal::new();
        let sub = Identifier::from("s1");
        for b in ["1|10|", "1|11|", "1|12|"] {
            journal.log(&delivery(b)).await.unwrap();
        }
        journal.discard(&delivery("1|10|")).await.unwrap();
        journal.persisted(&sub, "1|12|").await.unwrap();
        assert_eq!(
            journal.most_recent(&sub).await.unwrap().as_deref(),
            Some("1|12|")
        );

        journal.persisted(&sub, "1|09|").await.unwrap();
        assert_eq!(
            journal.most_recent(&sub).await.unwrap().as_deref(),
            Some("1|10|")
        );
    }

    #[tokio::test]
    async fn test_logged_bookmarks_are_duplicates() {
        let journal = MemoryBookmarkJournal::new();
        assert!(!journal.is_discarded(&delivery("1|10|")).await.unwrap());
        assert_eq!(journal.log(&delivery("1|10|")).await.unwrap(), 0);
        assert!(journal.is_discarded(&delivery("1|10|")).await.unwrap());
        assert_eq!(journal.log(&delivery("1|10|")).await.unwrap(), 0);

        journal.purge(&Identifier::from("s1")).await.unwrap();
        assert!(!journal.is_discarded(&delivery("1|10|")).await.unwrap());
    }

    #[tokio::test]
    async fn test_message_without_bookmark_is_rejected() {
        let journal = MemoryBookmarkJournal::new();
        let message = Message::new(CommandKind::Publish).with_sub_id("s1");
        assert!(matches!(
            journal.log(&message).await,
            Err(JournalError::MissingField("bookmark"))
        ));
    }
}
