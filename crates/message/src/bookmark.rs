//! A bookmark is an opaque position in a topic's transaction log. Three
//! values are reserved and interpreted by the client or the server rather
//! than naming a logged message.

/// Replay the transaction log from its beginning.
pub const EPOCH: &str = "0";

/// Start at the end of the transaction log and receive only new messages.
pub const NOW: &str = "0|1|";

/// Resume after the most recent bookmark recorded by the bookmark journal.
///
/// Resolved client-side before the command is sent; falls back to
/// [`EPOCH`] when the journal knows nothing for the subscription.
pub const MOST_RECENT: &str = "recent";

/// Whether `bookmark` is one of the reserved values.
#[must_use]
pub fn is_reserved(bookmark: &str) -> bool {
    matches!(bookmark, EPOCH | NOW | MOST_RECENT)
}
