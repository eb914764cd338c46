use std::time::Duration;

use bytes::Bytes;

use crate::ack::AckTypes;
use crate::error::MessageError;
use crate::identifier::Identifier;
use crate::kind::CommandKind;
use crate::message::Message;

/// An outbound request plus the client-side settings that never reach
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    message: Message,
    timeout: Option<Duration>,
}

impl Command {
    /// Create a command of the given kind.
    #[must_use]
    pub fn new(kind: CommandKind) -> Self {
        Self {
            message: Message::new(kind),
            timeout: None,
        }
    }

    /// Publish `data` to `topic`.
    #[must_use]
    pub fn publish(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::Publish)
            .with_topic(topic)
            .with_data(data)
    }

    /// Delta-publish `data` to `topic`.
    #[must_use]
    pub fn delta_publish(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::DeltaPublish)
            .with_topic(topic)
            .with_data(data)
    }

    /// Subscribe to `topic`.
    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::new(CommandKind::Subscribe).with_topic(topic)
    }

    /// Delta-subscribe to `topic`.
    #[must_use]
    pub fn delta_subscribe(topic: impl Into<String>) -> Self {
        Self::new(CommandKind::DeltaSubscribe).with_topic(topic)
    }

    /// Query the cached records of `topic`.
    #[must_use]
    pub fn sow(topic: impl Into<String>) -> Self {
        Self::new(CommandKind::Sow).with_topic(topic)
    }

    /// Query `topic`, then subscribe to it.
    #[must_use]
    pub fn sow_and_subscribe(topic: impl Into<String>) -> Self {
        Self::new(CommandKind::SowAndSubscribe).with_topic(topic)
    }

    /// Query `topic`, then delta-subscribe to it.
    #[must_use]
    pub fn sow_and_delta_subscribe(topic: impl Into<String>) -> Self {
        Self::new(CommandKind::SowAndDeltaSubscribe).with_topic(topic)
    }

    /// Delete the cached records of `topic` matching `filter`.
    #[must_use]
    pub fn sow_delete(topic: impl Into<String>, filter: impl Into<String>) -> Self {
        Self::new(CommandKind::SowDelete)
            .with_topic(topic)
            .with_filter(filter)
    }

    /// Delete the cached records of `topic` with the given keys.
    #[must_use]
    pub fn sow_delete_by_keys(topic: impl Into<String>, keys: impl Into<String>) -> Self {
        let mut command = Self::new(CommandKind::SowDelete).with_topic(topic);
        command.message.sow_keys = Some(keys.into());
        command
    }

    /// Delete the cached record of `topic` matching the key of `data`.
    #[must_use]
    pub fn sow_delete_by_data(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::SowDelete)
            .with_topic(topic)
            .with_data(data)
    }

    /// Stop the subscription `sub_id`.
    #[must_use]
    pub fn unsubscribe(sub_id: impl Into<Identifier>) -> Self {
        Self::new(CommandKind::Unsubscribe).with_sub_id(sub_id)
    }

    /// Command kind.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.message.command
    }

    /// Client-side timeout, if set.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Requested acks.
    #[must_use]
    pub const fn ack_types(&self) -> AckTypes {
        self.message.ack_type
    }

    /// The wire message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Mutable access to the wire message.
    pub const fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Consume into the wire message.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Check the fields this kind requires.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::MissingField`] naming the first absent field.
    pub fn validate(&self) -> Result<(), MessageError> {
        let kind = self.kind();
        let missing = |field| MessageError::MissingField {
            kind: kind.as_str(),
            field,
        };

        let needs_topic = kind.is_publish()
            || kind.is_subscribe()
            || kind.is_query()
            || kind == CommandKind::SowDelete;
        if needs_topic && self.message.topic.as_deref().is_none_or(str::is_empty) {
            return Err(missing("topic"));
        }

        match kind {
            CommandKind::Unsubscribe if self.message.sub_id.is_none() => Err(missing("sub_id")),
            CommandKind::SowDelete
                if self.message.filter.is_none()
                    && self.message.sow_keys.is_none()
                    && self.message.data.is_empty() =>
            {
                Err(missing("filter, sow_keys or data"))
            }
            _ => Ok(()),
        }
    }

    /// Set the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.message.topic = Some(topic.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.message.data = data.into();
        self
    }

    /// Set the content filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.message.filter = Some(filter.into());
        self
    }

    /// Set the query ordering.
    #[must_use]
    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.message.order_by = Some(order_by.into());
        self
    }

    /// Set the bookmark.
    #[must_use]
    pub fn with_bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.message.bookmark = Some(bookmark.into());
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.message.options = Some(options.into());
        self
    }

    /// Request `ack_types` in addition to those already requested.
    #[must_use]
    pub fn add_ack_type(mut self, ack_types: AckTypes) -> Self {
        self.message.ack_type |= ack_types;
        self
    }

    /// Replace the requested acks.
    #[must_use]
    pub const fn with_ack_types(mut self, ack_types: AckTypes) -> Self {
        self.message.ack_type = ack_types;
        self
    }

    /// Set the client-side timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the query batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.message.batch_size = Some(batch_size);
        self
    }

    /// Limit the records a query returns.
    #[must_use]
    pub const fn with_top_n(mut self, top_n: u32) -> Self {
        self.message.top_n = Some(top_n);
        self
    }

    /// Set the command id.
    #[must_use]
    pub fn with_command_id(mut self, id: impl Into<Identifier>) -> Self {
        self.message.command_id = Some(id.into());
        self
    }

    /// Set the subscription id.
    #[must_use]
    pub fn with_sub_id(mut self, id: impl Into<Identifier>) -> Self {
        self.message.sub_id = Some(id.into());
        self
    }

    /// Set the query id.
    #[must_use]
    pub fn with_query_id(mut self, id: impl Into<Identifier>) -> Self {
        self.message.query_id = Some(id.into());
        self
    }

    /// Set the cache key of a published record.
    #[must_use]
    pub fn with_sow_key(mut self, key: impl Into<String>) -> Self {
        self.message.sow_key = Some(key.into());
        self
    }

    /// Assert an identity for this command.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.message.user_id = Some(user_id.into());
        self
    }

    /// Attach application correlation data.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.message.correlation_id = Some(correlation_id.into());
        self
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        command.message
    }
}
