//! Pull-style result streams.
//!
//! A [`ResultStream`] is a bounded buffer between the receive task, which
//! pushes, and one consumer, which pulls. A full buffer pushes back on the
//! receive task instead of dropping messages. A conflating stream keeps
//! only the newest message per record key.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use sowlink_message::{AckStatus, AckTypes, CommandKind, Identifier, Message};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::HandlerError;
use crate::handler::MessageHandler;

/// Where a stream is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, not yet attached to a command.
    Unset,
    /// Receiving a standing subscription.
    Subscribed,
    /// Receiving query results; ends after the group end marker.
    QueryOnly,
    /// Receiving acks; ends once every requested ack arrived.
    AckOnly,
    /// Receiving a subscription, newest message per record key.
    Conflating,
    /// Ended normally or closed by the consumer.
    Closed,
    /// Ended by a connection change.
    Disconnected,
}

impl StreamState {
    /// Whether the stream accepts no further messages.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Disconnected)
    }
}

/// Result of a bounded wait on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// The next message.
    Message(Message),
    /// Nothing arrived in time; the stream is still open.
    NoDataYet,
    /// The stream ended and is drained.
    End,
}

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The buffer is at capacity.
    #[error("Stream full")]
    Full,
    /// The stream ended.
    #[error("Stream closed")]
    Closed,
}

/// How a stream created by a session buffers.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Buffer bound; the session's configured capacity when unset.
    pub capacity: Option<usize>,
    /// Keep only the newest message per record key.
    pub conflate: bool,
}

impl StreamOptions {
    /// Set the buffer bound.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Conflate by record key.
    #[must_use]
    pub const fn conflated(mut self) -> Self {
        self.conflate = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConflationKey {
    Record(String),
    Unkeyed(u64),
}

#[derive(Debug)]
struct Buffer {
    state: StreamState,
    capacity: usize,
    queue: VecDeque<Message>,
    conflated: IndexMap<ConflationKey, Message>,
    next_unkeyed: u64,
    requested_acks: AckTypes,
    received_acks: AckTypes,
}

impl Buffer {
    fn len(&self) -> usize {
        self.queue.len() + self.conflated.len()
    }

    fn pop(&mut self) -> Option<Message> {
        self.queue
            .pop_front()
            .or_else(|| self.conflated.shift_remove_index(0).map(|(_, m)| m))
    }

    fn enqueue(&mut self, message: Message) -> Result<(), PushError> {
        if self.state != StreamState::Conflating {
            if self.queue.len() >= self.capacity {
                return Err(PushError::Full);
            }
            self.queue.push_back(message);
            return Ok(());
        }

        let key = match message.sow_key.clone() {
            Some(key) => ConflationKey::Record(key),
            None => {
                self.next_unkeyed += 1;
                ConflationKey::Unkeyed(self.next_unkeyed)
            }
        };
        if let Some(slot) = self.conflated.get_mut(&key) {
            *slot = message;
            return Ok(());
        }
        if self.conflated.len() >= self.capacity {
            return Err(PushError::Full);
        }
        self.conflated.insert(key, message);
        Ok(())
    }

    fn advance(&mut self, command: CommandKind, ack_type: AckTypes, status: Option<AckStatus>) {
        match self.state {
            StreamState::QueryOnly if command == CommandKind::GroupEnd => {
                self.state = StreamState::Closed;
            }
            StreamState::AckOnly if command == CommandKind::Ack => {
                self.received_acks |= ack_type;
                if status == Some(AckStatus::Failure)
                    || self.received_acks.contains(self.requested_acks)
                {
                    self.state = StreamState::Closed;
                }
            }
            _ => {}
        }
    }
}

/// Buffer and wakeup shared between a stream and its handler.
#[derive(Debug)]
pub(crate) struct StreamShared {
    buffer: Mutex<Buffer>,
    available: Notify,
}

impl StreamShared {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(Buffer {
                state: StreamState::Unset,
                capacity: capacity.max(1),
                queue: VecDeque::new(),
                conflated: IndexMap::new(),
                next_unkeyed: 0,
                requested_acks: AckTypes::NONE,
                received_acks: AckTypes::NONE,
            }),
            available: Notify::new(),
        }
    }

    fn push(&self, message: Message) -> Result<(), PushError> {
        {
            let mut buffer = self.buffer.lock();
            if buffer.state.is_terminal() {
                return Err(PushError::Closed);
            }
            let (command, ack_type, status) = (message.command, message.ack_type, message.status);
            buffer.enqueue(message)?;
            buffer.advance(command, ack_type, status);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Leave the unset state. Has no effect on a stream already running.
    pub(crate) fn begin(&self, state: StreamState, requested_acks: AckTypes) {
        let mut buffer = self.buffer.lock();
        if buffer.state == StreamState::Unset {
            buffer.state = state;
            buffer.requested_acks = requested_acks;
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        self.terminate(StreamState::Disconnected);
    }

    fn terminate(&self, state: StreamState) -> bool {
        let changed = {
            let mut buffer = self.buffer.lock();
            let changed = !buffer.state.is_terminal();
            if changed {
                buffer.state = state;
            }
            changed
        };
        self.available.notify_one();
        changed
    }

    fn state(&self) -> StreamState {
        self.buffer.lock().state
    }
}

struct StreamHandler(Arc<StreamShared>);

impl MessageHandler for StreamHandler {
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let pushed = self.0.push(message.clone());
        pushed.map_err(|err| match err {
            PushError::Full => HandlerError::StreamFull,
            PushError::Closed => HandlerError::Closed,
        })
    }
}

/// Undoes a stream's registration when the consumer lets go of it.
pub(crate) trait StreamCloser: Send + Sync + 'static {
    /// Remove the route `handler` was registered under, unsubscribing if
    /// it was a live subscription.
    fn close_stream(&self, route_id: &Identifier, handler: &Arc<dyn MessageHandler>);
}

/// Messages produced by one command, pulled one at a time.
pub struct ResultStream {
    shared: Arc<StreamShared>,
    handler: Arc<dyn MessageHandler>,
    route_id: Option<Identifier>,
    command_id: Option<Identifier>,
    closer: Option<Arc<dyn StreamCloser>>,
}

impl ResultStream {
    /// A stream not attached to any session, fed through
    /// [`ResultStream::handler`] or [`ResultStream::push`].
    #[must_use]
    pub fn standalone(capacity: usize) -> Self {
        let shared = Arc::new(StreamShared::new(capacity));
        let handler: Arc<dyn MessageHandler> = Arc::new(StreamHandler(shared.clone()));
        Self {
            shared,
            handler,
            route_id: None,
            command_id: None,
            closer: None,
        }
    }

    pub(crate) fn attach(
        &mut self,
        route_id: Identifier,
        command_id: Identifier,
        closer: Arc<dyn StreamCloser>,
    ) {
        self.route_id = Some(route_id);
        self.command_id = Some(command_id);
        self.closer = Some(closer);
    }

    pub(crate) const fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// The handler that feeds this stream.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }

    /// Start the stream in `state`, ending once `requested_acks` arrive
    /// for an ack-only stream.
    pub fn begin(&self, state: StreamState, requested_acks: AckTypes) {
        self.shared.begin(state, requested_acks);
    }

    /// Offer a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] at capacity and [`PushError::Closed`]
    /// once the stream ended.
    pub fn push(&self, message: Message) -> Result<(), PushError> {
        self.shared.push(message)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Messages buffered and not yet pulled.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Id the stream's route is registered under: the subscription id,
    /// query id or command id.
    #[must_use]
    pub const fn id(&self) -> Option<&Identifier> {
        self.route_id.as_ref()
    }

    /// Id of the command that created the stream.
    #[must_use]
    pub const fn command_id(&self) -> Option<&Identifier> {
        self.command_id.as_ref()
    }

    /// Next message, or `None` once the stream ended and is drained.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            let notified = self.shared.available.notified();
            {
                let mut buffer = self.shared.buffer.lock();
                if let Some(message) = buffer.pop() {
                    return Some(message);
                }
                if buffer.state.is_terminal() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Next message, waiting at most `timeout`.
    pub async fn next_timeout(&mut self, timeout: Duration) -> StreamItem {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.available.notified();
            {
                let mut buffer = self.shared.buffer.lock();
                if let Some(message) = buffer.pop() {
                    return StreamItem::Message(message);
                }
                if buffer.state.is_terminal() {
                    return StreamItem::End;
                }
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return StreamItem::NoDataYet,
            }
        }
    }

    /// Stop the stream. Buffered messages can still be pulled; a live
    /// subscription is ended on the server.
    pub fn close(&mut self) {
        self.shared.terminate(StreamState::Closed);
        self.release();
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|message| (message, stream))
        })
    }

    fn release(&mut self) {
        if let (Some(closer), Some(route_id)) = (self.closer.take(), self.route_id.as_ref()) {
            closer.close_stream(route_id, &self.handler);
        }
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("id", &self.route_id)
            .field("state", &self.state())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.shared.terminate(StreamState::Closed);
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(key: &str, data: &str) -> Message {
        Message::new(CommandKind::Publish)
            .with_sow_key(key)
            .with_data(data.to_string())
    }

    #[tokio::test]
    async fn test_full_stream_refuses_until_drained() {
        let mut stream = ResultStream::standalone(2);
        stream.begin(StreamState::Subscribed, AckTypes::NONE);
        stream.push(record("a", "1")).unwrap();
        stream.push(record("b", "2")).unwrap();
        assert_eq!(stream.push(record("c", "3")), Err(PushError::Full));
        assert_eq!(stream.depth(), 2);

        assert_eq!(stream.next().await.unwrap().data_str(), "1");
        stream.push(record("c", "3")).unwrap();
        assert_eq!(stream.next().await.unwrap().data_str(), "2");
        assert_eq!(stream.next().await.unwrap().data_str(), "3");
    }

    #[tokio::test]
    async fn test_conflation_keeps_newest_per_key() {
        let mut stream = ResultStream::standalone(2);
        stream.begin(StreamState::Conflating, AckTypes::NONE);
        stream.push(record("a", "1")).unwrap();
        stream.push(record("b", "1")).unwrap();
        stream.push(record("a", "2")).unwrap();
        stream.push(record("a", "3")).unwrap();
        assert_eq!(stream.depth(), 2);
        assert_eq!(stream.push(record("c", "1")), Err(PushError::Full));

        let first = stream.next().await.unwrap();
        assert_eq!(first.sow_key.as_deref(), Some("a"));
        assert_eq!(first.data_str(), "3");
        assert_eq!(stream.next().await.unwrap().sow_key.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_query_stream_ends_after_group_end() {
        let stream = ResultStream::standalone(10);
        stream.begin(StreamState::QueryOnly, AckTypes::NONE);
        stream.push(Message::new(CommandKind::GroupBegin)).unwrap();
        stream.push(record("a", "1")).unwrap();
        stream.push(Message::new(CommandKind::GroupEnd)).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(stream.push(record("b", "1")), Err(PushError::Closed));

        let kinds: Vec<_> = stream
            .into_stream()
            .map(|m| m.command)
            .collect()
            .await;
        assert_eq!(
            kinds,
            vec![
                CommandKind::GroupBegin,
                CommandKind::Publish,
                CommandKind::GroupEnd
            ]
        );
    }

    #[tokio::test]
    async fn test_ack_stream_ends_when_every_ack_arrived() {
        let mut stream = ResultStream::standalone(10);
        stream.begin(
            StreamState::AckOnly,
            AckTypes::PROCESSED | AckTypes::PERSISTED,
        );
        stream
            .push(Message::ack("1".into(), AckTypes::PROCESSED, AckStatus::Success))
            .unwrap();
        assert_eq!(stream.state(), StreamState::AckOnly);
        stream
            .push(Message::ack("1".into(), AckTypes::PERSISTED, AckStatus::Success))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Closed);

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_wakes_blocked_consumer() {
        let mut stream = ResultStream::standalone(10);
        stream.begin(StreamState::Subscribed, AckTypes::NONE);
        let shared = stream.shared().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            shared.mark_disconnected();
        });
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), StreamState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_reports_no_data() {
        let mut stream = ResultStream::standalone(10);
        stream.begin(StreamState::Subscribed, AckTypes::NONE);
        assert_eq!(
            stream.next_timeout(Duration::from_millis(50)).await,
            StreamItem::NoDataYet
        );
        stream.push(record("a", "1")).unwrap();
        assert!(matches!(
            stream.next_timeout(Duration::from_millis(50)).await,
            StreamItem::Message(_)
        ));
        stream.close();
        assert_eq!(
            stream.next_timeout(Duration::from_millis(50)).await,
            StreamItem::End
        );
    }

    #[test]
    fn test_terminal_states_absorb() {
        let stream = ResultStream::standalone(1);
        stream.begin(StreamState::Subscribed, AckTypes::NONE);
        stream.shared().mark_disconnected();
        stream.begin(StreamState::QueryOnly, AckTypes::NONE);
        assert_eq!(stream.state(), StreamState::Disconnected);
        assert!(!stream.shared().terminate(StreamState::Closed));
        assert_eq!(stream.state(), StreamState::Disconnected);
    }
}
