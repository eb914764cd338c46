//! Synchronous acknowledgment waits.
//!
//! A caller that needs the server's answer registers a pending entry
//! before sending, then sleeps on the session wakeup until the receive
//! task resolves the entry, the connection it was sent on is lost, or the
//! deadline passes. Every entry is resolved at most once.

use std::collections::HashMap;
use std::sync::Arc;

use sowlink_message::{AckReason, AckStatus, AckTypes, Identifier, Message, RecordCounts};
use sowlink_transport::ConnectionEpoch;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Error, Result};
use crate::shared::Shared;

/// Fields of the ack that answered a synchronous call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckFields {
    /// Which ack this was.
    pub ack_type: AckTypes,
    /// Outcome reported by the server.
    pub status: Option<AckStatus>,
    /// Failure reason.
    pub reason: Option<AckReason>,
    /// Sequence number; on a logon ack, the server's last persisted.
    pub sequence: Option<u64>,
    /// Record counters.
    pub records: RecordCounts,
    /// Bookmark.
    pub bookmark: Option<String>,
    /// Subscription the ack concerns.
    pub sub_id: Option<Identifier>,
    /// Query the ack concerns.
    pub query_id: Option<Identifier>,
    /// Server version, on logon acks.
    pub version: Option<String>,
}

impl AckFields {
    /// Copy the ack fields out of `message`.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            ack_type: message.ack_type,
            status: message.status,
            reason: message.reason.clone(),
            sequence: message.sequence,
            records: message.records,
            bookmark: message.bookmark.clone(),
            sub_id: message.sub_id.clone(),
            query_id: message.query_id.clone(),
            version: message.version.clone(),
        }
    }

    /// Whether the server reported failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == Some(AckStatus::Failure)
    }
}

/// How a synchronous wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The awaited ack arrived without failure. A logon ack asking for
    /// another attempt also lands here, with a retry status.
    Success(AckFields),
    /// The server rejected the command.
    ServerFailure(AckReason, AckFields),
    /// The deadline passed.
    TimedOut,
    /// The connection the command went out on was lost.
    Abandoned,
}

#[derive(Debug)]
enum Resolution {
    Pending,
    Responded(AckFields),
    Abandoned,
}

#[derive(Debug)]
struct AckRecord {
    epoch: ConnectionEpoch,
    awaited: AckTypes,
    resolution: Resolution,
}

/// Pending synchronous waits, keyed by command id.
#[derive(Debug, Default)]
pub(crate) struct AckTable {
    records: HashMap<Identifier, AckRecord>,
}

impl AckTable {
    fn insert(&mut self, id: Identifier, epoch: ConnectionEpoch, awaited: AckTypes) -> bool {
        if self.records.contains_key(&id) {
            return false;
        }
        self.records.insert(
            id,
            AckRecord {
                epoch,
                awaited,
                resolution: Resolution::Pending,
            },
        );
        true
    }

    /// Record the response for `id` if it is still pending and awaits
    /// `ack_type`.
    pub(crate) fn resolve(&mut self, id: &Identifier, fields: AckFields) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if !matches!(record.resolution, Resolution::Pending)
            || !record.awaited.intersects(fields.ack_type)
        {
            return false;
        }
        record.resolution = Resolution::Responded(fields);
        true
    }

    /// Abandon every pending entry sent on `upto` or earlier.
    pub(crate) fn abandon_all(&mut self, upto: ConnectionEpoch) -> usize {
        let mut abandoned = 0;
        for record in self.records.values_mut() {
            if matches!(record.resolution, Resolution::Pending) && record.epoch <= upto {
                record.resolution = Resolution::Abandoned;
                abandoned += 1;
            }
        }
        abandoned
    }

    fn take_outcome(&mut self, id: &Identifier) -> Option<AckOutcome> {
        let record = self.records.get(id)?;
        if matches!(record.resolution, Resolution::Pending) {
            return None;
        }
        let record = self.records.remove(id)?;
        Some(match record.resolution {
            Resolution::Responded(fields) if fields.is_failure() => {
                let reason = fields
                    .reason
                    .clone()
                    .unwrap_or_else(|| AckReason::Other("unspecified".to_string()));
                AckOutcome::ServerFailure(reason, fields)
            }
            Resolution::Responded(fields) => AckOutcome::Success(fields),
            Resolution::Abandoned | Resolution::Pending => AckOutcome::Abandoned,
        })
    }

    fn remove(&mut self, id: &Identifier) {
        self.records.remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Registers synchronous waits and resolves them from the receive task.
#[derive(Clone)]
pub struct AckCoordinator {
    shared: Arc<Shared>,
}

impl AckCoordinator {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Register interest in `awaited` acks for `id`, stamped with the
    /// current connection epoch.
    ///
    /// Call before sending so a fast response is not missed. The entry is
    /// removed when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] if `id` is already being awaited.
    pub fn begin_wait(&self, id: Identifier, awaited: AckTypes) -> Result<PendingAck> {
        let epoch = {
            let mut state = self.shared.lock();
            let epoch = state.connection.epoch;
            if !state.acks.insert(id.clone(), epoch, awaited) {
                return Err(Error::Usage(format!("command id {id} is already awaiting an ack")));
            }
            epoch
        };
        Ok(PendingAck {
            shared: self.shared.clone(),
            id,
            epoch,
        })
    }

    /// Resolve the wait for `id` with the ack in `fields`.
    ///
    /// Returns `false` if nothing was waiting for this ack, including when
    /// the wait was already resolved.
    pub fn resolve(&self, id: &Identifier, fields: AckFields) -> bool {
        let resolved = self.shared.lock().acks.resolve(id, fields);
        if resolved {
            trace!(%id, "ack resolved");
            self.shared.notify_all();
        }
        resolved
    }

    /// Abandon every wait sent on connection `upto` or earlier.
    pub fn abandon_all(&self, upto: ConnectionEpoch) -> usize {
        let abandoned = self.shared.lock().acks.abandon_all(upto);
        if abandoned > 0 {
            self.shared.notify_all();
        }
        abandoned
    }

    /// Wait for `pending` to be resolved or abandoned, or for `deadline`.
    pub async fn await_synchronously(
        &self,
        pending: PendingAck,
        deadline: Option<Instant>,
    ) -> AckOutcome {
        self.shared
            .wait_for(deadline, |state| state.acks.take_outcome(&pending.id))
            .await
            .unwrap_or(AckOutcome::TimedOut)
    }
}

/// A registered wait. Dropping it forgets the wait.
#[derive(Debug)]
pub struct PendingAck {
    shared: Arc<Shared>,
    id: Identifier,
    epoch: ConnectionEpoch,
}

impl PendingAck {
    /// Command id being awaited.
    #[must_use]
    pub const fn id(&self) -> &Identifier {
        &self.id
    }

    /// Connection epoch the wait was registered under.
    #[must_use]
    pub const fn epoch(&self) -> ConnectionEpoch {
        self.epoch
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.shared.lock().acks.remove(&self.id);
    }
}
