//! Transport abstraction for the session engine.
//!
//! A transport owns one physical connection at a time to the messaging
//! server and numbers each successful connection with a
//! [`ConnectionEpoch`]. Specific transports (in-memory, TCP) are provided
//! in separate crates.
//!
//! Transports handle:
//! - Connection setup and teardown
//! - Framing and encoding of outbound messages
//! - Decoding inbound messages onto a single event stream that outlives
//!   individual connections

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Error types.
pub mod error;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sowlink_message::Message;

pub use error::TransportError;

/// Numbers one physical connection's lifetime.
///
/// Strictly increasing across the reconnects of one transport. Epoch 0
/// means "never connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ConnectionEpoch(u64);

impl ConnectionEpoch {
    /// The epoch before any connection.
    pub const NONE: Self = Self(0);

    /// Create an epoch from its counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Counter value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The epoch after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ConnectionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that happened on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection was established.
    Connected(ConnectionEpoch),
    /// A message arrived on the connection of the given epoch.
    Message(ConnectionEpoch, Message),
    /// The connection of the given epoch was lost.
    Disconnected(ConnectionEpoch, String),
}

/// Transport trait for talking to the messaging server
///
/// Transports handle:
/// - Establishing and re-establishing the connection
/// - Encoding outbound messages
/// - Delivering decoded inbound messages and connection events on one stream
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection.
    ///
    /// Emits [`TransportEvent::Connected`] before returning.
    async fn connect(&self) -> Result<ConnectionEpoch, TransportError>;

    /// Re-establish the connection after `failed` was lost.
    ///
    /// If a connection newer than `failed` is already live it is returned
    /// as is, so concurrent reconnect attempts converge on one connection.
    async fn reconnect(&self, failed: ConnectionEpoch) -> Result<ConnectionEpoch, TransportError>;

    /// Send a message on the current connection.
    ///
    /// Returns the epoch of the connection the message was written to.
    async fn send(&self, message: &Message) -> Result<ConnectionEpoch, TransportError>;

    /// Drop the current connection.
    ///
    /// Emits [`TransportEvent::Disconnected`]; the transport may reconnect.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Close the transport for good. The incoming stream ends.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// Take the incoming event stream.
    ///
    /// The stream spans every connection of the transport. It can be taken
    /// once; later calls return `None`.
    fn incoming(&self) -> Option<BoxStream<'static, TransportEvent>>;

    /// Epoch of the live connection, if any.
    fn epoch(&self) -> Option<ConnectionEpoch>;
}

/// Configuration for transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum encoded message size in bytes
    pub max_frame_size: usize,
    /// Outbound messages buffered per connection
    pub outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 10 * 1024 * 1024, // 10MB
            outbound_buffer: 1000,
        }
    }
}
