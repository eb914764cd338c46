use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ack::{AckReason, AckStatus, AckTypes};
use crate::identifier::Identifier;
use crate::kind::CommandKind;

/// A protocol message, outbound command or inbound response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Command kind.
    pub command: CommandKind,
    /// Correlates acks with the command that requested them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Identifier>,
    /// Subscription this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<Identifier>,
    /// Every subscription an inbound publish satisfies, in wire order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_ids: Vec<Identifier>,
    /// Query this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<Identifier>,
    /// Topic name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Content filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Ordering for query results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Transaction log position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    /// Comma-separated command options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    /// Requested acks on a command, the single ack type on an ack.
    #[serde(default, skip_serializing_if = "no_acks")]
    pub ack_type: AckTypes,
    /// Ack status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AckStatus>,
    /// Ack failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<AckReason>,
    /// Publish sequence number; on a logon ack, the server's last persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Records per query batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    /// Maximum records a query returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
    /// Cache key of a record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sow_key: Option<String>,
    /// Cache keys a command targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sow_keys: Option<String>,
    /// Application correlation data, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Client name, sent on logon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Identity asserted by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Logon credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client or server version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Record counters echoed on acks.
    #[serde(default, skip_serializing_if = "RecordCounts::is_empty")]
    pub records: RecordCounts,
    /// Server timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub data: Bytes,
}

/// Counters the server reports on acks and group markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    /// Records returned by a query.
    pub returned: u64,
    /// Records inserted by a publish.
    pub inserted: u64,
    /// Records updated by a publish.
    pub updated: u64,
    /// Records deleted.
    pub deleted: u64,
    /// Records matching a query.
    pub matches: u64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn no_acks(types: &AckTypes) -> bool {
    types.is_empty()
}

impl RecordCounts {
    /// Whether every counter is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.returned == 0
            && self.inserted == 0
            && self.updated == 0
            && self.deleted == 0
            && self.matches == 0
    }
}

impl Message {
    /// Create an empty message of the given kind.
    #[must_use]
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            command_id: None,
            sub_id: None,
            sub_ids: Vec::new(),
            query_id: None,
            topic: None,
            filter: None,
            order_by: None,
            bookmark: None,
            options: None,
            ack_type: AckTypes::NONE,
            status: None,
            reason: None,
            sequence: None,
            batch_size: None,
            top_n: None,
            sow_key: None,
            sow_keys: None,
            correlation_id: None,
            client_name: None,
            user_id: None,
            password: None,
            version: None,
            records: RecordCounts::default(),
            timestamp: None,
            data: Bytes::new(),
        }
    }

    /// An ack of `ack_type` for `command_id`.
    #[must_use]
    pub fn ack(command_id: Identifier, ack_type: AckTypes, status: AckStatus) -> Self {
        Self {
            command_id: Some(command_id),
            ack_type,
            status: Some(status),
            ..Self::new(CommandKind::Ack)
        }
    }

    /// Subscription ids of an inbound message in wire order.
    ///
    /// Uses the id set when present, the single subscription id otherwise.
    pub fn subscription_ids(&self) -> impl Iterator<Item = &Identifier> {
        let single = if self.sub_ids.is_empty() {
            self.sub_id.as_ref()
        } else {
            None
        };
        self.sub_ids.iter().chain(single)
    }

    /// Whether `option` appears in the comma-separated options.
    #[must_use]
    pub fn has_option(&self, option: &str) -> bool {
        self.options
            .as_deref()
            .is_some_and(|opts| opts.split(',').any(|o| o.trim() == option))
    }

    /// Append `option` to the options unless already present.
    pub fn add_option(&mut self, option: &str) {
        if self.has_option(option) {
            return;
        }
        self.options = Some(match self.options.take() {
            Some(existing) if !existing.is_empty() => format!("{existing},{option}"),
            _ => option.to_string(),
        });
    }

    /// Payload as UTF-8, lossy.
    #[must_use]
    pub fn data_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Set the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the command id.
    #[must_use]
    pub fn with_command_id(mut self, id: impl Into<Identifier>) -> Self {
        self.command_id = Some(id.into());
        self
    }

    /// Set the subscription id.
    #[must_use]
    pub fn with_sub_id(mut self, id: impl Into<Identifier>) -> Self {
        self.sub_id = Some(id.into());
        self
    }

    /// Set the query id.
    #[must_use]
    pub fn with_query_id(mut self, id: impl Into<Identifier>) -> Self {
        self.query_id = Some(id.into());
        self
    }

    /// Set the cache key.
    #[must_use]
    pub fn with_sow_key(mut self, key: impl Into<String>) -> Self {
        self.sow_key = Some(key.into());
        self
    }

    /// Set the bookmark.
    #[must_use]
    pub fn with_bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.bookmark = Some(bookmark.into());
        self
    }

    /// Set the sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Set the failure reason.
    #[must_use]
    pub fn with_reason(mut self, reason: AckReason) -> Self {
        self.reason = Some(reason);
        self
    }
}
