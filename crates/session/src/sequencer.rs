//! Guaranteed publish sequencing.
//!
//! Every guaranteed publish is numbered and journaled before it is sent.
//! The sequencer keeps the numbers the server sees contiguous and
//! ascending: a publish is never sent twice on one connection, and one
//! numbered above the last sent is preceded by everything in between.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sowlink_journal::{JournalError, PublishJournal, ReplaySink, SequencedPublish};
use sowlink_message::Message;
use sowlink_transport::{ConnectionEpoch, Transport, TransportError};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};

/// Where sequenced publishes are written.
#[async_trait]
pub trait PublishSender: Send + Sync {
    /// Send one publish. Returns the epoch of the connection it went out on.
    async fn send_publish(
        &self,
        message: &Message,
    ) -> std::result::Result<ConnectionEpoch, TransportError>;
}

#[async_trait]
impl<T: Transport> PublishSender for T {
    async fn send_publish(
        &self,
        message: &Message,
    ) -> std::result::Result<ConnectionEpoch, TransportError> {
        self.send(message).await
    }
}

#[derive(Debug, Default)]
struct SequencerState {
    /// Highest sequence number written to the current connection.
    last_sent: u64,
    /// Connection whose replay finished; direct sends wait for it.
    replayed: Option<ConnectionEpoch>,
}

/// Feeds journal entries to a sender, skipping any already sent.
struct SendSink<'a> {
    sender: &'a dyn PublishSender,
    last_sent: u64,
    sent: usize,
    failure: Option<TransportError>,
}

impl<'a> SendSink<'a> {
    fn new(sender: &'a dyn PublishSender, last_sent: u64) -> Self {
        Self {
            sender,
            last_sent,
            sent: 0,
            failure: None,
        }
    }

    fn into_error(self, err: JournalError) -> Error {
        self.failure.map_or_else(|| err.into(), Error::Transport)
    }
}

#[async_trait]
impl ReplaySink for SendSink<'_> {
    async fn replay(&mut self, entry: SequencedPublish) -> std::result::Result<(), JournalError> {
        if entry.sequence <= self.last_sent {
            return Ok(());
        }
        let mut message = entry.message;
        message.sequence = Some(entry.sequence);
        match self.sender.send_publish(&message).await {
            Ok(_) => {
                trace!(sequence = entry.sequence, "replayed publish");
                self.last_sent = entry.sequence;
                self.sent += 1;
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                self.failure = Some(err);
                Err(JournalError::ReplayInterrupted(reason))
            }
        }
    }
}

/// Numbers, journals and sends guaranteed publishes.
pub struct PublishSequencer {
    journal: Arc<dyn PublishJournal>,
    state: Mutex<SequencerState>,
}

impl PublishSequencer {
    /// Sequence publishes through `journal`.
    #[must_use]
    pub fn new(journal: Arc<dyn PublishJournal>) -> Self {
        Self {
            journal,
            state: Mutex::new(SequencerState::default()),
        }
    }

    /// The backing journal.
    #[must_use]
    pub const fn journal(&self) -> &Arc<dyn PublishJournal> {
        &self.journal
    }

    /// Number and journal `message` without sending it.
    ///
    /// # Errors
    ///
    /// Returns the journal's error if storing fails.
    pub async fn assign_and_store(&self, message: Message) -> Result<u64> {
        let _state = self.state.lock().await;
        Ok(self.journal.store(message).await?)
    }

    /// The server persisted everything up to `sequence`.
    ///
    /// # Errors
    ///
    /// Returns the journal's error if discarding fails.
    pub async fn on_ack_persisted(&self, sequence: u64) -> Result<()> {
        trace!(sequence, "publishes persisted");
        Ok(self.journal.discard_up_to(sequence).await?)
    }

    /// Send the publish numbered `sequence`, first replaying any journaled
    /// publishes numbered between the last sent and it.
    ///
    /// Returns `false` without sending if `sequence` was already sent on
    /// this connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gap`] if a publish in between is no longer
    /// journaled, or the sender's error.
    pub async fn send_or_replay(
        &self,
        sequence: u64,
        message: &Message,
        sender: &dyn PublishSender,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.send_locked(&mut state, sequence, message, sender).await
    }

    /// Journal `message` and, once the current connection has been
    /// replayed, send it.
    ///
    /// Without a replayed connection, or if sending fails for want of a
    /// connection, the publish stays queued in the journal for the next
    /// replay. Returns the sequence number assigned.
    ///
    /// # Errors
    ///
    /// Returns journal errors, and sender errors other than connection
    /// loss.
    pub async fn publish(&self, message: Message, sender: &dyn PublishSender) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut outbound = message.clone();
        let sequence = self.journal.store(message).await?;
        outbound.sequence = Some(sequence);

        if state.replayed.is_none() {
            trace!(sequence, "publish queued until replay");
            return Ok(sequence);
        }
        match self.send_locked(&mut state, sequence, &outbound, sender).await {
            Ok(_) => Ok(sequence),
            Err(Error::Transport(err)) if err.is_connection_loss() => {
                debug!(sequence, %err, "publish queued after send failure");
                state.replayed = None;
                Ok(sequence)
            }
            Err(err) => Err(err),
        }
    }

    /// Resume on connection `epoch`, whose server reported `server_last`
    /// as its last persisted sequence number.
    ///
    /// Discards what the server already has, makes sure new numbers start
    /// above it, then replays every remaining entry in order. Returns the
    /// number of publishes replayed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gap`] if entries the server never persisted are
    /// gone from the journal, or the sender's error if replay is cut
    /// short.
    pub async fn begin_epoch(
        &self,
        epoch: ConnectionEpoch,
        server_last: u64,
        sender: &dyn PublishSender,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.replayed = None;

        self.journal.verify_resume(server_last)?;
        self.journal.discard_up_to(server_last).await?;
        self.journal.advance_to(server_last).await?;
        state.last_sent = server_last;

        let mut sink = SendSink::new(sender, server_last);
        if let Err(err) = self.journal.replay(&mut sink).await {
            return Err(sink.into_error(err));
        }
        state.last_sent = sink.last_sent;
        state.replayed = Some(epoch);
        info!(%epoch, server_last, replayed = sink.sent, "publish journal replayed");
        Ok(sink.sent)
    }

    /// Run `work` with direct sends held off, marking the connection as
    /// not yet replayed.
    ///
    /// Connection changes go through here so no publish can slip onto a
    /// new connection ahead of its replay.
    pub async fn suspend_while<F: Future>(&self, work: F) -> F::Output {
        let mut state = self.state.lock().await;
        state.replayed = None;
        work.await
    }

    /// Highest sequence number sent on the current connection.
    pub async fn last_sent(&self) -> u64 {
        self.state.lock().await.last_sent
    }

    /// Publishes journaled and not yet persisted.
    #[must_use]
    pub fn unpersisted_count(&self) -> usize {
        self.journal.unpersisted_count()
    }

    /// Wait until every journaled publish is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if `timeout` passes first.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        Ok(self.journal.flush(timeout).await?)
    }

    async fn send_locked(
        &self,
        state: &mut SequencerState,
        sequence: u64,
        message: &Message,
        sender: &dyn PublishSender,
    ) -> Result<bool> {
        if sequence <= state.last_sent {
            trace!(sequence, last_sent = state.last_sent, "already sent");
            return Ok(false);
        }
        while state.last_sent + 1 < sequence {
            let next = state.last_sent + 1;
            let mut sink = SendSink::new(sender, state.last_sent);
            if let Err(err) = self.journal.replay_single(&mut sink, next).await {
                return Err(sink.into_error(err));
            }
            state.last_sent = next;
        }
        sender.send_publish(message).await?;
        state.last_sent = sequence;
        Ok(true)
    }
}

impl std::fmt::Debug for PublishSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishSequencer")
            .field("unpersisted", &self.journal.unpersisted_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use sowlink_journal_memory::MemoryPublishJournal;
    use sowlink_message::CommandKind;

    use super::*;

    #[derive(Default)]
    struct RecordingSender {
        sent: SyncMutex<Vec<u64>>,
        offline: AtomicBool,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<u64> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl PublishSender for RecordingSender {
        async fn send_publish(
            &self,
            message: &Message,
        ) -> std::result::Result<ConnectionEpoch, TransportError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(message.sequence.unwrap_or_default());
            Ok(ConnectionEpoch::new(1))
        }
    }

    fn publish(data: &str) -> Message {
        Message::new(CommandKind::Publish)
            .with_topic("orders")
            .with_data(data.to_string())
    }

    fn sequencer() -> PublishSequencer {
        PublishSequencer::new(Arc::new(MemoryPublishJournal::new()))
    }

    #[tokio::test]
    async fn test_publishes_queue_until_replay() {
        let sequencer = sequencer();
        let sender = RecordingSender::default();
        for n in 1..=3 {
            assert_eq!(sequencer.publish(publish("x"), &sender).await.unwrap(), n);
        }
        assert!(sender.sent().is_empty());

        let replayed = sequencer
            .begin_epoch(ConnectionEpoch::new(1), 0, &sender)
            .await
            .unwrap();
        assert_eq!(replayed, 3);

        sequencer.publish(publish("y"), &sender).await.unwrap();
        assert_eq!(sender.sent(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_send_fills_holes_in_order() {
        let sequencer = sequencer();
        let sender = RecordingSender::default();
        sequencer
            .begin_epoch(ConnectionEpoch::new(1), 0, &sender)
            .await
            .unwrap();

        let mut last = publish("x");
        for _ in 0..3 {
            let sequence = sequencer.assign_and_store(publish("x")).await.unwrap();
            last.sequence = Some(sequence);
        }
        assert!(sequencer.send_or_replay(3, &last, &sender).await.unwrap());
        assert_eq!(sender.sent(), vec![1, 2, 3]);

        assert!(!sequencer.send_or_replay(2, &last, &sender).await.unwrap());
        assert!(!sequencer.send_or_replay(3, &last, &sender).await.unwrap());
        assert_eq!(sender.sent(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_resume_skips_what_the_server_persisted() {
        let sequencer = sequencer();
        let sender = RecordingSender::default();
        for _ in 0..3 {
            sequencer.publish(publish("x"), &sender).await.unwrap();
        }
        sequencer
            .begin_epoch(ConnectionEpoch::new(1), 2, &sender)
            .await
            .unwrap();
        assert_eq!(sender.sent(), vec![3]);
        assert_eq!(sequencer.unpersisted_count(), 1);
        assert_eq!(sequencer.last_sent().await, 3);
    }

    #[tokio::test]
    async fn test_server_ahead_of_journal_advances_numbering() {
        let sequencer = sequencer();
        let sender = RecordingSender::default();
        sequencer
            .begin_epoch(ConnectionEpoch::new(1), 40, &sender)
            .await
            .unwrap();
        assert_eq!(sequencer.publish(publish("x"), &sender).await.unwrap(), 41);
        assert_eq!(sender.sent(), vec![41]);
    }

    #[tokio::test]
    async fn test_lost_connection_queues_for_next_replay() {
        let sequencer = sequencer();
        let sender = RecordingSender::default();
        sequencer
            .begin_epoch(ConnectionEpoch::new(1), 0, &sender)
            .await
            .unwrap();
        sequencer.publish(publish("x"), &sender).await.unwrap();

        sender.offline.store(true, Ordering::SeqCst);
        assert_eq!(sequencer.publish(publish("y"), &sender).await.unwrap(), 2);
        sender.offline.store(false, Ordering::SeqCst);
        sequencer.publish(publish("z"), &sender).await.unwrap();
        assert_eq!(sender.sent(), vec![1]);

        sequencer
            .begin_epoch(ConnectionEpoch::new(2), 1, &sender)
            .await
            .unwrap();
        assert_eq!(sender.sent(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_evicted_publish_is_a_gap() {
        let sequencer = PublishSequencer::new(Arc::new(MemoryPublishJournal::with_retain_limit(1)));
        let sender = RecordingSender::default();
        sequencer.publish(publish("x"), &sender).await.unwrap();
        sequencer.publish(publish("y"), &sender).await.unwrap();

        let err = sequencer
            .begin_epoch(ConnectionEpoch::new(1), 0, &sender)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Gap {
                requested: 1,
                oldest_retained: 2
            }
        ));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_persisted_ack_discards() {
        let sequencer = sequencer();
        let sender = RecordingSender::default();
        for _ in 0..3 {
            sequencer.publish(publish("x"), &sender).await.unwrap();
        }
        sequencer.on_ack_persisted(2).await.unwrap();
        assert_eq!(sequencer.unpersisted_count(), 1);
        sequencer.on_ack_persisted(3).await.unwrap();
        sequencer.flush(Duration::from_millis(10)).await.unwrap();
    }
}
