//! Messages travel as CBOR maps. Framing is the transport's concern.

use bytes::Bytes;

use crate::error::CodecError;
use crate::message::Message;

/// Encode a message.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a message.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not a valid message.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
