use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of a command or inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Authenticate the connection.
    Logon,
    /// Publish a record.
    #[serde(rename = "p")]
    Publish,
    /// Publish a partial update merged into the cached record.
    DeltaPublish,
    /// Start a standing subscription.
    Subscribe,
    /// Start a subscription that receives only changed fields.
    DeltaSubscribe,
    /// One-shot query of a state-of-the-world topic. Inbound, a query record.
    Sow,
    /// Query followed atomically by a subscription.
    SowAndSubscribe,
    /// Query followed atomically by a delta subscription.
    SowAndDeltaSubscribe,
    /// Delete cached records.
    SowDelete,
    /// Stop a subscription.
    Unsubscribe,
    /// Keepalive in either direction.
    Heartbeat,
    /// Ask the server to acknowledge once prior publishes are processed.
    Flush,
    /// Inbound acknowledgment.
    Ack,
    /// Inbound marker preceding query results.
    GroupBegin,
    /// Inbound marker terminating query results.
    GroupEnd,
    /// Inbound notice that a record no longer matches a subscription.
    Oof,
    /// Anything this client does not recognize.
    #[serde(other)]
    Unknown,
}

/// How the dispatcher treats an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchClass {
    /// Query results, routed by query id.
    QueryResult,
    /// Publish family, routed by each subscription id in wire order.
    Publish,
    /// Acknowledgment, routed by command id.
    Ack,
    /// Server heartbeat.
    Heartbeat,
    /// Any other kind, routed by command id.
    Other,
}

impl CommandKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logon => "logon",
            Self::Publish => "p",
            Self::DeltaPublish => "delta_publish",
            Self::Subscribe => "subscribe",
            Self::DeltaSubscribe => "delta_subscribe",
            Self::Sow => "sow",
            Self::SowAndSubscribe => "sow_and_subscribe",
            Self::SowAndDeltaSubscribe => "sow_and_delta_subscribe",
            Self::SowDelete => "sow_delete",
            Self::Unsubscribe => "unsubscribe",
            Self::Heartbeat => "heartbeat",
            Self::Flush => "flush",
            Self::Ack => "ack",
            Self::GroupBegin => "group_begin",
            Self::GroupEnd => "group_end",
            Self::Oof => "oof",
            Self::Unknown => "unknown",
        }
    }

    /// Classify an inbound message of this kind.
    #[must_use]
    pub const fn dispatch_class(self) -> DispatchClass {
        match self {
            Self::Sow | Self::GroupBegin | Self::GroupEnd => DispatchClass::QueryResult,
            Self::Publish | Self::DeltaPublish | Self::Oof => DispatchClass::Publish,
            Self::Ack => DispatchClass::Ack,
            Self::Heartbeat => DispatchClass::Heartbeat,
            _ => DispatchClass::Other,
        }
    }

    /// Whether the command establishes a standing subscription.
    #[must_use]
    pub const fn is_subscribe(self) -> bool {
        matches!(
            self,
            Self::Subscribe
                | Self::DeltaSubscribe
                | Self::SowAndSubscribe
                | Self::SowAndDeltaSubscribe
        )
    }

    /// Whether the command produces query results.
    #[must_use]
    pub const fn is_query(self) -> bool {
        matches!(
            self,
            Self::Sow | Self::SowAndSubscribe | Self::SowAndDeltaSubscribe
        )
    }

    /// Whether the command publishes data.
    #[must_use]
    pub const fn is_publish(self) -> bool {
        matches!(self, Self::Publish | Self::DeltaPublish)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "logon" => Self::Logon,
            "p" | "publish" => Self::Publish,
            "delta_publish" => Self::DeltaPublish,
            "subscribe" => Self::Subscribe,
            "delta_subscribe" => Self::DeltaSubscribe,
            "sow" => Self::Sow,
            "sow_and_subscribe" => Self::SowAndSubscribe,
            "sow_and_delta_subscribe" => Self::SowAndDeltaSubscribe,
            "sow_delete" => Self::SowDelete,
            "unsubscribe" => Self::Unsubscribe,
            "heartbeat" => Self::Heartbeat,
            "flush" => Self::Flush,
            "ack" => Self::Ack,
            "group_begin" => Self::GroupBegin,
            "group_end" => Self::GroupEnd,
            "oof" => Self::Oof,
            _ => Self::Unknown,
        })
    }
}
