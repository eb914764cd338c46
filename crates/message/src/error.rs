//! Error types for the message model.

use thiserror::Error;

/// Errors raised while building or interpreting messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Unrecognized acknowledgment type name.
    #[error("Unknown ack type: {0}")]
    UnknownAckType(String),

    /// A command is missing a field its kind requires.
    #[error("{kind} command requires a {field}")]
    MissingField {
        /// Wire name of the command kind.
        kind: &'static str,
        /// The missing field.
        field: &'static str,
    },
}

/// Errors raised by the wire codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("Failed to encode message: {0}")]
    Encode(String),

    /// Decoding failed.
    #[error("Failed to decode message: {0}")]
    Decode(String),
}
