//! Message model for the sowlink session engine.
//!
//! Both directions of the protocol share one [`Message`] shape: outbound
//! commands fill the request fields, inbound acks and data fill the
//! response fields. [`Command`] wraps an outbound message with the
//! client-side settings that never reach the wire.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Acknowledgment types, statuses and reason codes.
pub mod ack;

/// Reserved bookmark values.
pub mod bookmark;

/// CBOR wire codec used by network transports.
pub mod codec;

/// Outbound command builder.
pub mod command;

/// Error types.
pub mod error;

/// Opaque identifiers.
pub mod identifier;

/// Command kinds and their dispatch classes.
pub mod kind;

/// The message type.
pub mod message;

pub use ack::{AckReason, AckStatus, AckTypes};
pub use command::Command;
pub use error::{CodecError, MessageError};
pub use identifier::Identifier;
pub use kind::{CommandKind, DispatchClass};
pub use message::{Message, RecordCounts};
