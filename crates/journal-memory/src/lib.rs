//! In-memory journals.
//!
//! Nothing survives the process, so these journals protect against
//! disconnects but not crashes. Useful for tests and for sessions that only
//! need replay across reconnects.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bookmark;
mod publish;

pub use bookmark::MemoryBookmarkJournal;
pub use publish::MemoryPublishJournal;
