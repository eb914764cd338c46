//! Client session protocol engine for a state-of-the-world pub/sub server.
//!
//! A [`Session`] turns application calls (publish, subscribe, query,
//! delete) into correctly sequenced commands on a [`Transport`], matches
//! asynchronous server responses back to the calls that requested them,
//! and survives connection loss without losing or duplicating guaranteed
//! publishes.
//!
//! Shared state lives behind one lock with one broadcast wakeup; exactly
//! one receive task dispatches inbound messages while any number of
//! callers issue commands.
//!
//! [`Transport`]: sowlink_transport::Transport

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Synchronous acknowledgment waits.
pub mod ack;

/// Logon credential callbacks.
pub mod auth;

/// Session configuration.
pub mod config;

/// Error types.
pub mod error;

/// Message handler trait.
pub mod handler;

/// Heartbeat exchange and liveness watchdog.
mod heartbeat;

/// Listener traits for connection state and handler failures.
pub mod listener;

/// Reconnect state machine.
mod orchestrator;

/// Inbound dispatch on the receive task.
mod receive;

/// Identifier routing of inbound messages.
pub mod routing;

/// Guaranteed publish sequencing.
pub mod sequencer;

/// The application-facing session.
mod session;

/// Lock and wakeup shared by every component.
mod shared;

/// Connection state.
pub mod state;

/// Pull-style result streams.
pub mod stream;

/// Subscription bookkeeping for resubscribe.
pub mod subscriptions;

pub use ack::{AckCoordinator, AckFields, AckOutcome, PendingAck};
pub use auth::{Authenticator, DefaultAuthenticator};
pub use config::{ReconnectConfig, SessionConfig};
pub use error::{Error, HandlerError, Result};
pub use handler::MessageHandler;
pub use listener::{ConnectionStateListener, ExceptionListener};
pub use routing::{Dispatcher, Route, RouteTable};
pub use sequencer::{PublishSender, PublishSequencer};
pub use session::{PublishReceipt, Session, SessionBuilder};
pub use state::ConnectionState;
pub use stream::{PushError, ResultStream, StreamItem, StreamOptions, StreamState};
pub use subscriptions::{MemorySubscriptionManager, Resubscriber, SubscriptionManager};
