//! Connection state.

use std::fmt;

/// Lifecycle of the session's connection.
///
/// States are ordered by recovery progress; [`ConnectionState::Shutdown`]
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Physically connected, not yet logged on.
    Connected,
    /// The server accepted the logon.
    LoggedOn,
    /// Unpersisted publishes were replayed.
    PublishReplayed,
    /// Subscriptions were re-established. The session is fully recovered.
    Resubscribed,
    /// The session was closed or gave up reconnecting.
    Shutdown,
}

impl ConnectionState {
    /// Whether commands can be sent in this state.
    #[must_use]
    pub const fn is_logged_on(self) -> bool {
        matches!(
            self,
            Self::LoggedOn | Self::PublishReplayed | Self::Resubscribed
        )
    }

    /// Whether the state has reached `target` without shutting down.
    #[must_use]
    pub fn has_reached(self, target: Self) -> bool {
        self != Self::Shutdown && self >= target
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::LoggedOn => "logged_on",
            Self::PublishReplayed => "publish_replayed",
            Self::Resubscribed => "resubscribed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}
