//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`Session`](crate::Session)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name the server knows this client by. Keys the server's record of
    /// persisted publishes, so it must be stable across restarts.
    pub client_name: String,
    /// Identity sent on logon and attached to commands the server refuses
    /// as not entitled.
    pub user_id: Option<String>,
    /// Credential handed to the authenticator.
    pub password: Option<String>,
    /// Version string sent on logon.
    pub client_version: String,
    /// Deadline for synchronous calls whose command carries none.
    /// Zero waits indefinitely.
    pub default_timeout: Duration,
    /// Deadline for each logon attempt.
    pub logon_timeout: Duration,
    /// Logon attempts the server may ask to retry before giving up.
    pub logon_retry_limit: u32,
    /// How often an indefinite wait re-checks its condition.
    pub wait_recheck_interval: Duration,
    /// Heartbeat interval negotiated with the server, if any.
    pub heartbeat_interval: Option<Duration>,
    /// Messages a result stream buffers before pushing back.
    pub stream_capacity: usize,
    /// Pause between redeliveries to a full stream.
    pub stream_full_retry_delay: Duration,
    /// Minimum spacing of keepalives sent while a stream stays full.
    pub stream_full_heartbeat: Duration,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: "sowlink-client".to_string(),
            user_id: None,
            password: None,
            client_version: concat!("sowlink-", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout: Duration::from_secs(10),
            logon_timeout: Duration::from_secs(10),
            logon_retry_limit: 5,
            wait_recheck_interval: Duration::from_secs(1),
            heartbeat_interval: None,
            stream_capacity: 1000,
            stream_full_retry_delay: Duration::from_millis(10),
            stream_full_heartbeat: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration for a client called `client_name`.
    #[must_use]
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Self::default()
        }
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the default synchronous deadline.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the logon deadline.
    #[must_use]
    pub const fn with_logon_timeout(mut self, timeout: Duration) -> Self {
        self.logon_timeout = timeout;
        self
    }

    /// Negotiate heartbeats at `interval`.
    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Set the stream buffer bound.
    #[must_use]
    pub const fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Deadline for a call with the given per-command timeout.
    pub(crate) fn deadline(&self, timeout: Option<Duration>) -> Deadline {
        let timeout = timeout.unwrap_or(self.default_timeout);
        Deadline {
            at: (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout),
            timeout,
        }
    }
}

/// When a synchronous call gives up. `at` is `None` for an indefinite wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    pub(crate) at: Option<tokio::time::Instant>,
    pub(crate) timeout: Duration,
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Attempts per outage before giving up. Zero retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Delay after `attempt` failed attempts.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `attempts` failed attempts exhaust the policy.
    #[must_use]
    pub const fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: 3,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(!ReconnectConfig::default().exhausted(u32::MAX));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"client_name":"pricing","stream_capacity":16}"#).unwrap();
        assert_eq!(config.client_name, "pricing");
        assert_eq!(config.stream_capacity, 16);
        assert_eq!(config.default_timeout, Duration::from_secs(10));
        assert!(config.heartbeat_interval.is_none());
    }

    #[test]
    fn test_zero_timeout_waits_indefinitely() {
        let config = SessionConfig::default().with_default_timeout(Duration::ZERO);
        assert!(config.deadline(None).at.is_none());
        assert!(config.deadline(Some(Duration::from_millis(5))).at.is_some());
    }
}
