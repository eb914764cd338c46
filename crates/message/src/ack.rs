use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// A set of acknowledgment types.
///
/// Requests carry the set of acks the client wants; each inbound ack
/// carries exactly one type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckTypes(u8);

impl AckTypes {
    /// No acknowledgment.
    pub const NONE: Self = Self(0);
    /// The server received the command.
    pub const RECEIVED: Self = Self(1);
    /// The server parsed the command.
    pub const PARSED: Self = Self(2);
    /// The server finished processing the command.
    pub const PROCESSED: Self = Self(4);
    /// The server durably persisted a publish.
    pub const PERSISTED: Self = Self(8);
    /// The server finished delivering query results.
    pub const COMPLETED: Self = Self(16);
    /// Query statistics.
    pub const STATS: Self = Self(32);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::RECEIVED, "received"),
        (Self::PARSED, "parsed"),
        (Self::PROCESSED, "processed"),
        (Self::PERSISTED, "persisted"),
        (Self::COMPLETED, "completed"),
        (Self::STATS, "stats"),
    ];

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether no type is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every type in `other` is also in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share any type.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// `self` without the types in `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterate over the single types in the set, weakest first.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::NAMED
            .into_iter()
            .map(|(ty, _)| ty)
            .filter(move |ty| self.contains(*ty))
    }
}

impl BitOr for AckTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AckTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AckTypes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for AckTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (ty, name) in Self::NAMED {
            if self.contains(ty) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AckTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckTypes({self})")
    }
}

impl FromStr for AckTypes {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut types = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (ty, _) = Self::NAMED
                .iter()
                .find(|(_, name)| *name == part)
                .ok_or_else(|| MessageError::UnknownAckType(part.to_string()))?;
            types |= *ty;
        }
        Ok(types)
    }
}

/// Status carried by an inbound ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The command succeeded.
    Success,
    /// The command was rejected; see the reason.
    Failure,
    /// The server asks the client to try again (logon only).
    Retry,
}

/// Why the server rejected a command.
///
/// Parsed from the wire reason text by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AckReason {
    /// The identity lacks permission for the topic.
    NotEntitled,
    /// The publish was already seen.
    Duplicate,
    /// The filter did not parse.
    BadFilter,
    /// The topic regular expression did not parse.
    BadRegexTopic,
    /// The topic does not exist or is not allowed.
    InvalidTopic,
    /// The subscription id names a live subscription.
    NameInUse,
    /// Logon credentials were refused.
    AuthFailure,
    /// A command arrived before logon.
    LogonRequired,
    /// The bookmark is not in the transaction log.
    InvalidBookmark,
    /// An identical subscription already exists.
    SubscriptionAlreadyExists,
    /// Any reason this client does not recognize.
    Other(String),
}

impl AckReason {
    /// Wire text of the reason.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::NotEntitled => "not entitled",
            Self::Duplicate => "duplicate",
            Self::BadFilter => "bad filter",
            Self::BadRegexTopic => "bad regex topic",
            Self::InvalidTopic => "invalid topic",
            Self::NameInUse => "subid in use",
            Self::AuthFailure => "auth failure",
            Self::LogonRequired => "logon required",
            Self::InvalidBookmark => "invalid bookmark",
            Self::SubscriptionAlreadyExists => "subscription already exists",
            Self::Other(reason) => reason,
        }
    }
}

impl From<&str> for AckReason {
    fn from(value: &str) -> Self {
        match value.trim() {
            "not entitled" => Self::NotEntitled,
            "duplicate" => Self::Duplicate,
            "bad filter" => Self::BadFilter,
            "bad regex topic" => Self::BadRegexTopic,
            "invalid topic" => Self::InvalidTopic,
            "subid in use" | "name in use" => Self::NameInUse,
            "auth failure" | "authentication failure" => Self::AuthFailure,
            "logon required" => Self::LogonRequired,
            "invalid bookmark" => Self::InvalidBookmark,
            "subscription already exists" => Self::SubscriptionAlreadyExists,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for AckReason {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<AckReason> for String {
    fn from(value: AckReason) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_ack_types_parse_and_display() {
        let types: AckTypes = "processed, persisted".parse().unwrap();
        assert!(types.contains(AckTypes::PROCESSED));
        assert!(types.contains(AckTypes::PERSISTED));
        assert!(!types.contains(AckTypes::COMPLETED));
        assert_eq!(types.to_string(), "processed,persisted");
        assert!("processed,bogus".parse::<AckTypes>().is_err());
    }

    #[test]
    fn test_ack_types_set_operations() {
        let types = AckTypes::PROCESSED | AckTypes::COMPLETED;
        assert_eq!(types.without(AckTypes::PROCESSED), AckTypes::COMPLETED);
        assert!(types.intersects(AckTypes::COMPLETED | AckTypes::STATS));
        assert_eq!(
            types.iter().collect::<Vec<_>>(),
            vec![AckTypes::PROCESSED, AckTypes::COMPLETED]
        );
        assert!(AckTypes::NONE.is_empty());
    }

    #[test]
    fn test_reason_codes_match_by_name() {
        assert_eq!(AckReason::from("not entitled"), AckReason::NotEntitled);
        assert_eq!(AckReason::from("duplicate"), AckReason::Duplicate);
        assert_eq!(AckReason::from("subid in use"), AckReason::NameInUse);
        assert_eq!(
            AckReason::from("queue full"),
            AckReason::Other("queue full".to_string())
        );
        assert_eq!(String::from(AckReason::BadFilter), "bad filter");
    }

    proptest! {
        #[test]
        fn prop_ack_type_names_round_trip(bits in 0u8..64) {
            let types = AckTypes(bits);
            prop_assert_eq!(types.to_string().parse::<AckTypes>().unwrap(), types);
            prop_assert_eq!(types.iter().fold(AckTypes::NONE, |acc, ty| acc | ty), types);
        }
    }
}
