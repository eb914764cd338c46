use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque identifier naming one outstanding operation.
///
/// The same value may serve as command id, subscription id and query id
/// at once. Identifiers compare by their bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(Bytes);

impl Identifier {
    /// Create an identifier from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes of the identifier.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the identifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<u64> for Identifier {
    fn from(value: u64) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Bytes> for Identifier {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}
