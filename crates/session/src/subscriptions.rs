//! Subscription bookkeeping for resubscribe.
//!
//! Subscriptions delivered to a handler are remembered by a
//! [`SubscriptionManager`] so that after a reconnect they can be
//! re-established on the new connection. Subscriptions read through a
//! result stream are not remembered; their stream ends on disconnect.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use sowlink_message::{Command, Identifier};
use tracing::{debug, info};

use crate::error::Result;
use crate::handler::MessageHandler;

/// Re-issues one remembered subscription on the current connection.
#[async_trait]
pub trait Resubscriber: Send + Sync {
    /// Re-establish the subscription `command`, delivering to `handler`.
    async fn resubscribe(&self, command: Command, handler: Arc<dyn MessageHandler>) -> Result<()>;
}

/// Remembers active handler subscriptions.
#[async_trait]
pub trait SubscriptionManager: Send + Sync + 'static {
    /// Remember a subscription.
    fn subscribe(&self, sub_id: Identifier, command: Command, handler: Arc<dyn MessageHandler>);

    /// Forget a subscription.
    fn unsubscribe(&self, sub_id: &Identifier);

    /// Forget every subscription.
    fn clear(&self);

    /// Number of remembered subscriptions.
    fn len(&self) -> usize;

    /// Whether nothing is remembered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-establish every remembered subscription through `resubscriber`.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failure.
    async fn resubscribe(&self, resubscriber: &dyn Resubscriber) -> Result<()>;
}

struct Entry {
    command: Command,
    handler: Arc<dyn MessageHandler>,
}

/// Subscription manager held in memory, resubscribing in the order
/// subscriptions were made.
#[derive(Default)]
pub struct MemorySubscriptionManager {
    entries: Mutex<IndexMap<Identifier, Entry>>,
}

impl MemorySubscriptionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemorySubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubscriptionManager")
            .field("subscriptions", &self.entries.lock().len())
            .finish()
    }
}

#[async_trait]
impl SubscriptionManager for MemorySubscriptionManager {
    fn subscribe(&self, sub_id: Identifier, command: Command, handler: Arc<dyn MessageHandler>) {
        debug!(%sub_id, "remembering subscription");
        self.entries.lock().insert(sub_id, Entry { command, handler });
    }

    fn unsubscribe(&self, sub_id: &Identifier) {
        self.entries.lock().shift_remove(sub_id);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    async fn resubscribe(&self, resubscriber: &dyn Resubscriber) -> Result<()> {
        let snapshot: Vec<(Command, Arc<dyn MessageHandler>)> = self
            .entries
            .lock()
            .values()
            .map(|entry| (entry.command.clone(), entry.handler.clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }
        info!(count = snapshot.len(), "resubscribing");
        for (command, handler) in snapshot {
            resubscriber.resubscribe(command, handler).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sowlink_message::Message;

    use super::*;
    use crate::error::{Error, HandlerError};

    #[derive(Default)]
    struct Recorder {
        topics: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Resubscriber for Recorder {
        async fn resubscribe(&self, command: Command, _: Arc<dyn MessageHandler>) -> Result<()> {
            let topic = command.message().topic.clone().unwrap_or_default();
            if self.fail_on.as_deref() == Some(topic.as_str()) {
                return Err(Error::Disconnected("lost".to_string()));
            }
            self.topics.lock().push(topic);
            Ok(())
        }
    }

    fn handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_: &Message| Ok::<(), HandlerError>(()))
    }

    #[tokio::test]
    async fn test_resubscribes_in_subscription_order() {
        let manager = MemorySubscriptionManager::new();
        manager.subscribe("1".into(), Command::subscribe("b"), handler());
        manager.subscribe("2".into(), Command::subscribe("a"), handler());
        manager.subscribe("3".into(), Command::subscribe("c"), handler());
        manager.unsubscribe(&"3".into());

        let recorder = Recorder::default();
        manager.resubscribe(&recorder).await.unwrap();
        assert_eq!(*recorder.topics.lock(), vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_resubscribe() {
        let manager = MemorySubscriptionManager::new();
        manager.subscribe("1".into(), Command::subscribe("a"), handler());
        manager.subscribe("2".into(), Command::subscribe("b"), handler());
        manager.subscribe("3".into(), Command::subscribe("c"), handler());

        let recorder = Recorder {
            fail_on: Some("b".to_string()),
            ..Recorder::default()
        };
        let err = manager.resubscribe(&recorder).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(*recorder.topics.lock(), vec!["a".to_string()]);
        assert_eq!(manager.len(), 3);
    }
}
