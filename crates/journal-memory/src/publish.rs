use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sowlink_journal::{JournalError, PublishJournal, ReplaySink, SequencedPublish};
use sowlink_message::Message;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PublishState {
    entries: BTreeMap<u64, Message>,
    last_stored: u64,
    last_persisted: u64,
    /// Highest sequence dropped by the retention limit before persistence.
    evicted_up_to: u64,
}

/// Publish journal held in memory.
#[derive(Debug, Default)]
pub struct MemoryPublishJournal {
    state: Mutex<PublishState>,
    drained: Notify,
    retain_limit: Option<usize>,
}

impl MemoryPublishJournal {
    /// Create an unbounded journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a journal that keeps at most `limit` entries, evicting the
    /// oldest. Replaying an evicted entry fails with a gap.
    #[must_use]
    pub fn with_retain_limit(limit: usize) -> Self {
        Self {
            retain_limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    fn snapshot(&self) -> Vec<SequencedPublish> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(&sequence, message)| SequencedPublish {
                sequence,
                message: message.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl PublishJournal for MemoryPublishJournal {
    async fn store(&self, mut message: Message) -> Result<u64, JournalError> {
        let mut state = self.state.lock();
        state.last_stored += 1;
        let sequence = state.last_stored;
        message.sequence = Some(sequence);
        state.entries.insert(sequence, message);

        if let Some(limit) = self.retain_limit {
            while state.entries.len() > limit {
                if let Some((evicted, _)) = state.entries.pop_first() {
                    warn!(sequence = evicted, "evicting unpersisted publish");
                    state.evicted_up_to = evicted;
                }
            }
        }
        Ok(sequence)
    }

    async fn discard_up_to(&self, sequence: u64) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if sequence <= state.last_persisted {
            return Ok(());
        }
        let retained = state.entries.split_off(&(sequence + 1));
        let discarded = std::mem::replace(&mut state.entries, retained).len();
        state.last_persisted = sequence;
        debug!(sequence, discarded, "discarded persisted publishes");

        if state.entries.is_empty() {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    async fn replay(&self, sink: &mut dyn ReplaySink) -> Result<(), JournalError> {
        for entry in self.snapshot() {
            sink.replay(entry).await?;
        }
        Ok(())
    }

    async fn replay_single(
        &self,
        sink: &mut dyn ReplaySink,
        sequence: u64,
    ) -> Result<bool, JournalError> {
        let entry = {
            let state = self.state.lock();
            if sequence <= state.last_persisted {
                return Ok(false);
            }
            match state.entries.get(&sequence) {
                Some(message) => SequencedPublish {
                    sequence,
                    message: message.clone(),
                },
                None if sequence <= state.evicted_up_to => {
                    return Err(JournalError::Gap {
                        requested: sequence,
                        oldest_retained: state
                            .entries
                            .keys()
                            .next()
                            .copied()
                            .unwrap_or(state.last_stored + 1),
                    });
                }
                None => return Ok(false),
            }
        };
        sink.replay(entry).await?;
        Ok(true)
    }

    fn unpersisted_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn last_persisted(&self) -> u64 {
        self.state.lock().last_persisted
    }

    fn last_stored(&self) -> u64 {
        self.state.lock().last_stored
    }

    fn oldest_retained(&self) -> Option<u64> {
        self.state.lock().entries.keys().next().copied()
    }

    async fn advance_to(&self, sequence: u64) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        if sequence > state.last_stored {
            debug!(from = state.last_stored, to = sequence, "advancing publish sequence");
            state.last_stored = sequence;
        }
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), JournalError> {
        let wait = async {
            loop {
                let drained = self.drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();
                if self.state.lock().entries.is_empty() {
                    return;
                }
                drained.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| JournalError::Timeout(timeout))
    }
}
