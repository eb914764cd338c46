use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sowlink_journal::{BookmarkJournal, PublishJournal};
use sowlink_message::{
    AckReason, AckTypes, Command, CommandKind, Identifier, Message, bookmark,
};
use sowlink_transport::{ConnectionEpoch, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::ack::{AckCoordinator, AckFields, AckOutcome};
use crate::auth::{Authenticator, DefaultAuthenticator};
use crate::config::{Deadline, SessionConfig};
use crate::error::{Error, Result};
use crate::handler::MessageHandler;
use crate::heartbeat::{self, Liveness};
use crate::listener::{ConnectionStateListener, ExceptionListener, Listeners};
use crate::receive;
use crate::routing::{Dispatcher, Route};
use crate::sequencer::PublishSequencer;
use crate::shared::Shared;
use crate::state::ConnectionState;
use crate::stream::{ResultStream, StreamCloser, StreamOptions, StreamState};
use crate::subscriptions::{MemorySubscriptionManager, Resubscriber, SubscriptionManager};

/// What a synchronous publish learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Sequence number assigned by the publish journal, if one is in use.
    pub sequence: Option<u64>,
    /// The server's processed ack. `None` if the connection was lost first
    /// and the publish stays queued in the journal for replay.
    pub ack: Option<AckFields>,
}

impl PublishReceipt {
    /// Whether the publish is waiting in the journal for a reconnect.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        self.ack.is_none()
    }
}

pub(crate) struct SessionInner<T: Transport> {
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<T>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) acks: AckCoordinator,
    pub(crate) dispatcher: Dispatcher<T>,
    pub(crate) sequencer: Option<PublishSequencer>,
    pub(crate) bookmarks: Option<Arc<dyn BookmarkJournal>>,
    pub(crate) subscriptions: Option<Arc<dyn SubscriptionManager>>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) listeners: Arc<Listeners>,
    pub(crate) liveness: Arc<Liveness>,
    pub(crate) server_version: Mutex<Option<String>>,
    pub(crate) terminal_error: Mutex<Option<String>>,
    /// Set once the first connect succeeded; losses are then repaired in
    /// the background.
    pub(crate) auto_reconnect: AtomicBool,
    pub(crate) reconnect_tx: mpsc::UnboundedSender<ConnectionEpoch>,
    reconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEpoch>>>,
    next_id: AtomicU64,
    started: AtomicBool,
    pub(crate) tasks: TaskTracker,
    pub(crate) cancel: CancellationToken,
    this: Weak<Self>,
}

/// Identifiers a command was given before sending.
struct CommandIds {
    command_id: Identifier,
    route_id: Identifier,
}

/// How a prepared command is routed and confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Subscription,
    Query,
    Publish,
    Other,
}

impl Shape {
    const fn of(kind: CommandKind) -> Self {
        if kind.is_subscribe() {
            Self::Subscription
        } else if kind.is_query() {
            Self::Query
        } else if kind.is_publish() {
            Self::Publish
        } else {
            Self::Other
        }
    }

    /// Acks the session consumes itself.
    fn system_acks(self) -> AckTypes {
        match self {
            Self::Subscription => AckTypes::PROCESSED,
            Self::Query => AckTypes::COMPLETED,
            Self::Publish | Self::Other => AckTypes::NONE,
        }
    }
}

fn lost(err: TransportError) -> Error {
    if err.is_connection_loss() {
        Error::Disconnected(err.to_string())
    } else {
        Error::Transport(err)
    }
}

impl<T: Transport> SessionInner<T> {
    pub(crate) fn next_id(&self) -> Identifier {
        self.next_id.fetch_add(1, Ordering::Relaxed).into()
    }

    pub(crate) fn start_tasks(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let events = self
            .transport
            .incoming()
            .ok_or_else(|| Error::Usage("transport events were already taken".to_string()))?;
        self.tasks.spawn(receive::run(
            self.this.clone(),
            events,
            self.cancel.clone(),
        ));
        if let Some(failures) = self.reconnect_rx.lock().take() {
            self.tasks.spawn(Self::reconnect_loop(
                self.this.clone(),
                failures,
                self.cancel.clone(),
            ));
        }
        if let Some(interval) = self.config.heartbeat_interval {
            self.tasks.spawn(heartbeat::watchdog(
                self.transport.clone(),
                self.shared.clone(),
                self.liveness.clone(),
                interval,
                self.cancel.clone(),
            ));
        }
        Ok(())
    }

    /// Wait until the session reaches `min`, returning the live epoch.
    pub(crate) async fn wait_ready(
        &self,
        min: ConnectionState,
        deadline: Deadline,
    ) -> Result<ConnectionEpoch> {
        if !self.auto_reconnect.load(Ordering::Acquire) {
            let state = self.shared.connection_state();
            if state == ConnectionState::Shutdown {
                return Err(Error::Shutdown);
            }
            if !state.has_reached(min) {
                return Err(Error::Disconnected("not connected".to_string()));
            }
        }
        self.shared
            .wait_for(deadline.at, |state| match state.connection.state {
                ConnectionState::Shutdown => Some(Err(Error::Shutdown)),
                current if current.has_reached(min) => Some(Ok(state.connection.epoch)),
                _ => None,
            })
            .await
            .unwrap_or(Err(Error::TimedOut(deadline.timeout)))
    }

    /// Send on the connection of `epoch`, failing if it is gone.
    pub(crate) async fn send_on_epoch(
        &self,
        epoch: ConnectionEpoch,
        message: &Message,
    ) -> Result<()> {
        let sent = self.transport.send(message).await.map_err(lost)?;
        if sent != epoch {
            return Err(Error::Disconnected(format!(
                "connection {epoch} was replaced by {sent}"
            )));
        }
        Ok(())
    }

    /// Wait for `min`, then send.
    async fn send(
        &self,
        min: ConnectionState,
        message: &Message,
        deadline: Deadline,
    ) -> Result<()> {
        let epoch = self.wait_ready(min, deadline).await?;
        self.send_on_epoch(epoch, message).await
    }

    /// Send and wait for an `awaited` ack.
    async fn request(
        &self,
        min: ConnectionState,
        mut message: Message,
        awaited: AckTypes,
        deadline: Deadline,
    ) -> Result<AckFields> {
        let id = match &message.command_id {
            Some(id) => id.clone(),
            None => {
                let id = self.next_id();
                message.command_id = Some(id.clone());
                id
            }
        };
        message.ack_type |= awaited;
        let pending = self.acks.begin_wait(id, awaited)?;
        self.send(min, &message, deadline).await?;
        let outcome = self.acks.await_synchronously(pending, deadline.at).await;
        self.settle(&message, outcome, deadline)
    }

    fn settle(
        &self,
        message: &Message,
        outcome: AckOutcome,
        deadline: Deadline,
    ) -> Result<AckFields> {
        match outcome {
            AckOutcome::Success(fields) => Ok(fields),
            AckOutcome::ServerFailure(reason, _) => Err(self.rejection(message, reason)),
            AckOutcome::TimedOut => Err(Error::TimedOut(deadline.timeout)),
            AckOutcome::Abandoned => Err(Error::Disconnected(
                "connection lost before the server responded".to_string(),
            )),
        }
    }

    /// The error for a rejected command. A command refused as not
    /// entitled comes back with the configured user id attached.
    fn rejection(&self, message: &Message, reason: AckReason) -> Error {
        let retry = match (&reason, &message.user_id, &self.config.user_id) {
            (AckReason::NotEntitled, None, Some(user_id)) => {
                let mut corrected = message.clone();
                corrected.user_id = Some(user_id.clone());
                corrected.command_id = None;
                corrected.sequence = None;
                let mut command = Command::new(corrected.command);
                *command.message_mut() = corrected;
                Some(Box::new(command))
            }
            _ => None,
        };
        Error::ServerFailure {
            command: message.command,
            reason,
            retry,
        }
    }

    /// Assign the ids a command is routed by.
    fn prepare(&self, command: &mut Command) -> Result<CommandIds> {
        command.validate()?;
        let kind = command.kind();
        let message = command.message_mut();
        let command_id = match &message.command_id {
            Some(id) => id.clone(),
            None => {
                let id = self.next_id();
                message.command_id = Some(id.clone());
                id
            }
        };
        if kind.is_subscribe() && message.sub_id.is_none() {
            message.sub_id = Some(command_id.clone());
        }
        if kind.is_query() && message.query_id.is_none() {
            message.query_id = Some(message.sub_id.clone().unwrap_or_else(|| command_id.clone()));
        }
        let route_id = match Shape::of(kind) {
            Shape::Subscription => message.sub_id.clone(),
            Shape::Query => message.query_id.clone(),
            Shape::Publish | Shape::Other => None,
        }
        .unwrap_or_else(|| command_id.clone());
        Ok(CommandIds {
            command_id,
            route_id,
        })
    }

    /// Resolve the bookmark a subscription starts from.
    ///
    /// The most-recent marker becomes the journal's resume point, or the
    /// start of the log if nothing is recorded. With `resume`, any
    /// bookmark is replaced by the recorded resume point.
    async fn resolve_bookmark(&self, message: &mut Message, resume: bool) -> Result<()> {
        let Some(requested) = message.bookmark.clone() else {
            return Ok(());
        };
        let most_recent = requested == bookmark::MOST_RECENT;
        if !most_recent && !resume {
            return Ok(());
        }
        let recorded = match (&self.bookmarks, &message.sub_id) {
            (Some(journal), Some(sub_id)) => journal.most_recent(sub_id).await?,
            _ => None,
        };
        message.bookmark = Some(recorded.unwrap_or_else(|| {
            if most_recent {
                bookmark::EPOCH.to_string()
            } else {
                requested
            }
        }));
        Ok(())
    }

    fn ensure_not_resubscribing(&self, kind: CommandKind) -> Result<()> {
        if kind.is_subscribe() && self.shared.lock().connection.resubscribing {
            return Err(Error::ResubscriptionInProgress);
        }
        Ok(())
    }

    fn route_for(
        &self,
        shape: Shape,
        handler: Arc<dyn MessageHandler>,
        message: &Message,
    ) -> Route {
        let mut route = Route::new(handler)
            .with_requested_acks(message.ack_type)
            .with_system_acks(shape.system_acks());
        if shape == Shape::Subscription {
            route = route.subscription();
            if self.bookmarks.is_some() && message.bookmark.is_some() {
                route = route.bookmarked();
            }
        }
        route
    }

    /// Send a prepared command the way its shape requires.
    async fn dispatch_command(
        &self,
        shape: Shape,
        mut message: Message,
        deadline: Deadline,
    ) -> Result<()> {
        match shape {
            Shape::Subscription => self
                .request(ConnectionState::Resubscribed, message, AckTypes::PROCESSED, deadline)
                .await
                .map(|_| ()),
            Shape::Query => {
                message.ack_type |= AckTypes::COMPLETED;
                self.send(ConnectionState::Resubscribed, &message, deadline).await
            }
            Shape::Publish => match &self.sequencer {
                Some(sequencer) => sequencer
                    .publish(message, self.transport.as_ref())
                    .await
                    .map(|_| ()),
                None => self.send(ConnectionState::Resubscribed, &message, deadline).await,
            },
            Shape::Other => self.send(ConnectionState::Resubscribed, &message, deadline).await,
        }
    }

    fn closer(&self) -> Arc<dyn StreamCloser> {
        Arc::new(RouteCloser {
            session: self.this.clone(),
        })
    }

    async fn execute(&self, mut command: Command, options: StreamOptions) -> Result<ResultStream> {
        let kind = command.kind();
        self.ensure_not_resubscribing(kind)?;
        let ids = self.prepare(&mut command)?;
        let deadline = self.config.deadline(command.timeout());
        let mut message = command.into_message();
        self.resolve_bookmark(&mut message, false).await?;

        let shape = Shape::of(kind);
        let requested = message.ack_type;
        let mut stream =
            ResultStream::standalone(options.capacity.unwrap_or(self.config.stream_capacity));
        let state = match shape {
            Shape::Subscription if options.conflate => StreamState::Conflating,
            Shape::Subscription => StreamState::Subscribed,
            Shape::Query => StreamState::QueryOnly,
            Shape::Publish | Shape::Other => StreamState::AckOnly,
        };
        stream.begin(state, requested);

        if state == StreamState::AckOnly && requested.is_empty() {
            self.dispatch_command(shape, message, deadline).await?;
            stream.close();
            return Ok(stream);
        }

        let handler = stream.handler();
        let route = self.route_for(shape, handler.clone(), &message);
        self.shared
            .lock()
            .routes
            .add_route(ids.route_id.clone(), route, message.has_option("replace"))?;
        stream.attach(ids.route_id.clone(), ids.command_id, self.closer());

        if let Err(err) = self.dispatch_command(shape, message, deadline).await {
            self.shared.lock().routes.remove_handler(&ids.route_id, &handler);
            return Err(err);
        }
        self.listeners.watch_stream(stream.shared());
        Ok(stream)
    }

    async fn execute_async(
        &self,
        mut command: Command,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Identifier> {
        let kind = command.kind();
        self.ensure_not_resubscribing(kind)?;
        let ids = self.prepare(&mut command)?;
        let shape = Shape::of(kind);
        let deadline = self.config.deadline(command.timeout());
        let remembered = (shape == Shape::Subscription)
            .then(|| self.subscriptions.clone())
            .flatten();
        if let Some(manager) = &remembered {
            manager.subscribe(ids.route_id.clone(), command.clone(), handler.clone());
        }

        let mut message = command.into_message();
        self.resolve_bookmark(&mut message, false).await?;
        let needs_route = matches!(shape, Shape::Subscription | Shape::Query)
            || !message.ack_type.is_empty();
        if needs_route {
            let mut route = self.route_for(shape, handler.clone(), &message);
            if remembered.is_some() {
                route = route.resubscribable();
            }
            let added = self.shared.lock().routes.add_route(
                ids.route_id.clone(),
                route,
                message.has_option("replace"),
            );
            if let Err(err) = added {
                if let Some(manager) = &remembered {
                    manager.unsubscribe(&ids.route_id);
                }
                return Err(err);
            }
        }

        if let Err(err) = self.dispatch_command(shape, message, deadline).await {
            self.shared.lock().routes.remove_handler(&ids.route_id, &handler);
            if let Some(manager) = &remembered {
                manager.unsubscribe(&ids.route_id);
            }
            return Err(err);
        }
        Ok(ids.route_id)
    }

    async fn publish(&self, command: Command) -> Result<Option<u64>> {
        command.validate()?;
        if !command.kind().is_publish() {
            return Err(Error::Usage(format!("{} is not a publish", command.kind())));
        }
        let deadline = self.config.deadline(command.timeout());
        let message = command.into_message();
        match &self.sequencer {
            Some(sequencer) => Ok(Some(
                sequencer.publish(message, self.transport.as_ref()).await?,
            )),
            None => {
                self.send(ConnectionState::Resubscribed, &message, deadline)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn publish_sync(&self, command: Command) -> Result<PublishReceipt> {
        command.validate()?;
        if !command.kind().is_publish() {
            return Err(Error::Usage(format!("{} is not a publish", command.kind())));
        }
        let deadline = self.config.deadline(command.timeout());
        let mut message = command.into_message();
        let id = match &message.command_id {
            Some(id) => id.clone(),
            None => {
                let id = self.next_id();
                message.command_id = Some(id.clone());
                id
            }
        };
        message.ack_type |= AckTypes::PROCESSED;

        let pending = self.acks.begin_wait(id, AckTypes::PROCESSED)?;
        let sequence = match &self.sequencer {
            Some(sequencer) => Some(
                sequencer
                    .publish(message.clone(), self.transport.as_ref())
                    .await?,
            ),
            None => {
                self.send(ConnectionState::Resubscribed, &message, deadline)
                    .await?;
                None
            }
        };

        let outcome = self.acks.await_synchronously(pending, deadline.at).await;
        match (outcome, sequence) {
            (AckOutcome::Abandoned, Some(_)) => {
                debug!(?sequence, "connection lost, publish stays queued for replay");
                Ok(PublishReceipt {
                    sequence,
                    ack: None,
                })
            }
            (outcome, _) => self.settle(&message, outcome, deadline).map(|ack| PublishReceipt {
                sequence,
                ack: Some(ack),
            }),
        }
    }

    async fn unsubscribe(&self, sub_id: &Identifier) -> Result<()> {
        let removed = self.shared.lock().routes.remove_route(sub_id);
        if let Some(manager) = &self.subscriptions {
            manager.unsubscribe(sub_id);
        }
        debug!(%sub_id, removed, "unsubscribing");
        self.send_unsubscribe(sub_id.clone()).await
    }

    /// Tell the server to drop `sub_id`, if there is a server to tell.
    async fn send_unsubscribe(&self, sub_id: Identifier) -> Result<()> {
        if !self.shared.connection_state().is_logged_on() {
            return Ok(());
        }
        let mut message = Command::unsubscribe(sub_id).into_message();
        message.command_id = Some(self.next_id());
        let deadline = self.config.deadline(None);
        match self.send(ConnectionState::LoggedOn, &message, deadline).await {
            Err(Error::Disconnected(reason)) => {
                debug!(%reason, "unsubscribe not sent");
                Ok(())
            }
            other => other,
        }
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        let removed = {
            let mut state = self.shared.lock();
            let ids = state.routes.subscription_ids();
            for id in &ids {
                state.routes.remove_route(id);
            }
            ids.len()
        };
        if let Some(manager) = &self.subscriptions {
            manager.clear();
        }
        debug!(removed, "unsubscribing from everything");
        self.send_unsubscribe(Identifier::from("all")).await
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        if let Some(sequencer) = &self.sequencer {
            return sequencer.flush(timeout).await;
        }
        let deadline = self.config.deadline(Some(timeout));
        self.request(
            ConnectionState::Resubscribed,
            Message::new(CommandKind::Flush),
            AckTypes::PROCESSED,
            deadline,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl<T: Transport> Resubscriber for SessionInner<T> {
    async fn resubscribe(&self, command: Command, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut command = command;
        let ids = self.prepare(&mut command)?;
        let deadline = self.config.deadline(command.timeout());
        let mut message = command.into_message();
        message.command_id = Some(self.next_id());
        message.add_option("replace");
        self.resolve_bookmark(&mut message, true).await?;

        let route = self
            .route_for(Shape::Subscription, handler, &message)
            .resubscribable();
        self.shared
            .lock()
            .routes
            .add_route(ids.route_id.clone(), route, true)?;
        trace!(sub_id = %ids.route_id, bookmark = ?message.bookmark, "resubscribing");
        self.request(ConnectionState::LoggedOn, message, AckTypes::PROCESSED, deadline)
            .await
            .map(|_| ())
    }
}

impl<T: Transport> Drop for SessionInner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RouteCloser<T: Transport> {
    session: Weak<SessionInner<T>>,
}

impl<T: Transport> StreamCloser for RouteCloser<T> {
    fn close_stream(&self, route_id: &Identifier, handler: &Arc<dyn MessageHandler>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let removed = session.shared.lock().routes.remove_handler(route_id, handler);
        let Some(route) = removed else {
            return;
        };
        if !route.is_subscription() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sub_id = route_id.clone();
        let tracker = session.tasks.clone();
        runtime.spawn(tracker.track_future(async move {
            if let Err(err) = session.send_unsubscribe(sub_id).await {
                debug!(%err, "unsubscribe for closed stream failed");
            }
        }));
    }
}

/// A client session with a pub/sub server.
///
/// Cloning yields another handle to the same session.
pub struct Session<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_name", &self.inner.config.client_name)
            .field("state", &self.connection_state())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    /// Start building a session over `transport`.
    pub fn builder(transport: T) -> SessionBuilder<T> {
        SessionBuilder::new(transport)
    }

    /// Connect, log on, replay unpersisted publishes and re-establish
    /// remembered subscriptions.
    ///
    /// After the first successful connect, lost connections are repaired
    /// in the background.
    ///
    /// # Errors
    ///
    /// Returns the transport's connect error, the server's logon
    /// rejection, or [`Error::Gap`] if the publish journal cannot resume.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        match inner.shared.connection_state() {
            ConnectionState::Shutdown => return Err(Error::Shutdown),
            state if state.is_logged_on() => return Ok(()),
            _ => {}
        }
        inner.start_tasks()?;
        let epoch = inner.establish(None).await?;
        inner.auto_reconnect.store(true, Ordering::Release);
        info!(client = %inner.config.client_name, %epoch, "session connected");
        Ok(())
    }

    /// Close the session for good. Pending waits fail and streams end.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for transports
    /// whose shutdown can fail.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.shut_down().await;
        inner.tasks.close();
        inner.tasks.wait().await;
        Ok(())
    }

    /// Run `command`, returning a stream of everything it produces.
    ///
    /// Subscriptions return once the server confirms them. Queries end
    /// after their last record, other commands once every requested ack
    /// arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] for malformed commands,
    /// [`Error::SubscriptionExists`] when reusing a live subscription id
    /// without the replace option, [`Error::ResubscriptionInProgress`]
    /// while subscriptions are being restored, and send or server errors.
    pub async fn execute(&self, command: Command) -> Result<ResultStream> {
        self.inner.execute(command, StreamOptions::default()).await
    }

    /// Like [`Session::execute`], buffering as `options` say.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn execute_with(
        &self,
        command: Command,
        options: StreamOptions,
    ) -> Result<ResultStream> {
        self.inner.execute(command, options).await
    }

    /// Run `command`, delivering everything it produces to `handler` on
    /// the receive task. Returns the id the messages are routed by.
    ///
    /// Handler subscriptions are remembered and restored after a
    /// reconnect.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn execute_async(
        &self,
        command: Command,
        handler: impl MessageHandler,
    ) -> Result<Identifier> {
        self.inner.execute_async(command, Arc::new(handler)).await
    }

    /// Publish `data` to `topic`.
    ///
    /// With a publish journal, returns the assigned sequence number; the
    /// publish is queued rather than failed while disconnected.
    ///
    /// # Errors
    ///
    /// Returns send errors, or journal errors when journaling.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<Option<u64>> {
        self.inner.publish(Command::publish(topic, data)).await
    }

    /// Publish a partial update of a cached record.
    ///
    /// # Errors
    ///
    /// As for [`Session::publish`].
    pub async fn delta_publish(
        &self,
        topic: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<Option<u64>> {
        self.inner.publish(Command::delta_publish(topic, data)).await
    }

    /// Publish with every option a [`Command`] carries.
    ///
    /// # Errors
    ///
    /// As for [`Session::publish`].
    pub async fn publish_command(&self, command: Command) -> Result<Option<u64>> {
        self.inner.publish(command).await
    }

    /// Publish and wait for the server's processed ack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if no ack arrives in time,
    /// [`Error::ServerFailure`] if the server rejects the publish, and
    /// [`Error::Disconnected`] if the connection is lost without a
    /// journal to queue the publish in.
    pub async fn publish_sync(&self, command: Command) -> Result<PublishReceipt> {
        self.inner.publish_sync(command).await
    }

    /// Subscribe to `topic`.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<ResultStream> {
        self.execute(Command::subscribe(topic)).await
    }

    /// Subscribe to `topic`, delivering to `handler`.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn subscribe_with(
        &self,
        topic: impl Into<String>,
        handler: impl MessageHandler,
    ) -> Result<Identifier> {
        self.execute_async(Command::subscribe(topic), handler).await
    }

    /// Subscribe to changed fields of `topic`.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn delta_subscribe(&self, topic: impl Into<String>) -> Result<ResultStream> {
        self.execute(Command::delta_subscribe(topic)).await
    }

    /// Query the cached records of `topic` matching `filter`.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn sow(
        &self,
        topic: impl Into<String>,
        filter: Option<&str>,
    ) -> Result<ResultStream> {
        let mut command = Command::sow(topic);
        if let Some(filter) = filter {
            command = command.with_filter(filter);
        }
        self.execute(command).await
    }

    /// Query `topic`, then atomically subscribe to it.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn sow_and_subscribe(
        &self,
        topic: impl Into<String>,
        filter: Option<&str>,
    ) -> Result<ResultStream> {
        let mut command = Command::sow_and_subscribe(topic);
        if let Some(filter) = filter {
            command = command.with_filter(filter);
        }
        self.execute(command).await
    }

    /// Query `topic`, then atomically subscribe to its changed fields.
    ///
    /// # Errors
    ///
    /// As for [`Session::execute`].
    pub async fn sow_and_delta_subscribe(
        &self,
        topic: impl Into<String>,
        filter: Option<&str>,
    ) -> Result<ResultStream> {
        let mut command = Command::sow_and_delta_subscribe(topic);
        if let Some(filter) = filter {
            command = command.with_filter(filter);
        }
        self.execute(command).await
    }

    /// Delete the cached records of `topic` matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns send, timeout or server errors.
    pub async fn sow_delete(
        &self,
        topic: impl Into<String>,
        filter: impl Into<String>,
    ) -> Result<AckFields> {
        self.delete(Command::sow_delete(topic, filter)).await
    }

    /// Delete the cached records of `topic` with the given comma-separated
    /// keys.
    ///
    /// # Errors
    ///
    /// As for [`Session::sow_delete`].
    pub async fn sow_delete_by_keys(
        &self,
        topic: impl Into<String>,
        keys: impl Into<String>,
    ) -> Result<AckFields> {
        self.delete(Command::sow_delete_by_keys(topic, keys)).await
    }

    /// Delete the cached record of `topic` whose key `data` derives.
    ///
    /// # Errors
    ///
    /// As for [`Session::sow_delete`].
    pub async fn sow_delete_by_data(
        &self,
        topic: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<AckFields> {
        self.delete(Command::sow_delete_by_data(topic, data)).await
    }

    async fn delete(&self, mut command: Command) -> Result<AckFields> {
        let inner = &self.inner;
        inner.prepare(&mut command)?;
        let deadline = inner.config.deadline(command.timeout());
        inner
            .request(
                ConnectionState::Resubscribed,
                command.into_message(),
                AckTypes::PROCESSED,
                deadline,
            )
            .await
    }

    /// Stop the subscription `sub_id`.
    ///
    /// # Errors
    ///
    /// Returns send errors other than a lost connection.
    pub async fn unsubscribe(&self, sub_id: &Identifier) -> Result<()> {
        self.inner.unsubscribe(sub_id).await
    }

    /// Stop every subscription.
    ///
    /// # Errors
    ///
    /// As for [`Session::unsubscribe`].
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.inner.unsubscribe_all().await
    }

    /// Wait until the server has everything published so far.
    ///
    /// With a publish journal, waits for every journaled publish to be
    /// persisted; otherwise asks the server for a flush ack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if `timeout` passes first.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner.flush(timeout).await
    }

    /// Mark a bookmark subscription message as consumed, so a resumed
    /// subscription starts after it.
    ///
    /// # Errors
    ///
    /// Returns the bookmark journal's error.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        match &self.inner.bookmarks {
            Some(journal) => Ok(journal.discard(message).await?),
            None => Ok(()),
        }
    }

    /// Add a connection state listener.
    pub fn add_connection_state_listener(&self, listener: impl ConnectionStateListener) {
        self.inner.listeners.add_connection(Arc::new(listener));
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.shared.connection_state()
    }

    /// Epoch of the most recent connection.
    #[must_use]
    pub fn epoch(&self) -> ConnectionEpoch {
        self.inner.shared.lock().connection.epoch
    }

    /// Client name sent on logon.
    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.inner.config.client_name
    }

    /// Version the server reported on the last logon.
    #[must_use]
    pub fn server_version(&self) -> Option<String> {
        self.inner.server_version.lock().clone()
    }

    /// Why the session shut itself down, if it did.
    #[must_use]
    pub fn terminal_error(&self) -> Option<String> {
        self.inner.terminal_error.lock().clone()
    }

    /// Journaled publishes not yet persisted by the server.
    #[must_use]
    pub fn unpersisted_count(&self) -> usize {
        self.inner
            .sequencer
            .as_ref()
            .map_or(0, PublishSequencer::unpersisted_count)
    }

    /// Registered routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.inner.shared.lock().routes.len()
    }

    /// Synchronous calls waiting for an ack.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.inner.shared.lock().acks.len()
    }

    /// The session's acknowledgment coordinator.
    #[must_use]
    pub fn ack_coordinator(&self) -> &AckCoordinator {
        &self.inner.acks
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder<T: Transport> {
    transport: T,
    config: SessionConfig,
    publish_journal: Option<Arc<dyn PublishJournal>>,
    bookmark_journal: Option<Arc<dyn BookmarkJournal>>,
    subscriptions: Option<Arc<dyn SubscriptionManager>>,
    authenticator: Arc<dyn Authenticator>,
    listeners: Listeners,
}

impl<T: Transport> SessionBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            config: SessionConfig::default(),
            publish_journal: None,
            bookmark_journal: None,
            subscriptions: Some(Arc::new(MemorySubscriptionManager::new())),
            authenticator: Arc::new(DefaultAuthenticator),
            listeners: Listeners::default(),
        }
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Journal guaranteed publishes in `journal`.
    #[must_use]
    pub fn with_publish_journal(mut self, journal: Arc<dyn PublishJournal>) -> Self {
        self.publish_journal = Some(journal);
        self
    }

    /// Track bookmark subscriptions in `journal`.
    #[must_use]
    pub fn with_bookmark_journal(mut self, journal: Arc<dyn BookmarkJournal>) -> Self {
        self.bookmark_journal = Some(journal);
        self
    }

    /// Remember handler subscriptions in `manager`.
    #[must_use]
    pub fn with_subscription_manager(mut self, manager: Arc<dyn SubscriptionManager>) -> Self {
        self.subscriptions = Some(manager);
        self
    }

    /// Do not restore subscriptions after a reconnect.
    #[must_use]
    pub fn without_subscription_manager(mut self) -> Self {
        self.subscriptions = None;
        self
    }

    /// Obtain logon credentials from `authenticator`.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Add a connection state listener.
    #[must_use]
    pub fn with_connection_listener(self, listener: impl ConnectionStateListener) -> Self {
        self.listeners.add_connection(Arc::new(listener));
        self
    }

    /// Report handler failures to `listener`.
    #[must_use]
    pub fn with_exception_listener(self, listener: impl ExceptionListener) -> Self {
        self.listeners.set_exception(Arc::new(listener));
        self
    }

    /// Deliver messages no route claims to `handler`.
    #[must_use]
    pub fn with_last_chance_handler(self, handler: impl MessageHandler) -> Self {
        self.listeners.set_last_chance(Arc::new(handler));
        self
    }

    /// Build the session. Nothing is sent until [`Session::connect`].
    #[must_use]
    pub fn build(self) -> Session<T> {
        let config = self.config;
        let transport = Arc::new(self.transport);
        let shared = Arc::new(Shared::new(config.wait_recheck_interval));
        let listeners = Arc::new(self.listeners);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|this| SessionInner {
            acks: AckCoordinator::new(shared.clone()),
            dispatcher: Dispatcher::new(
                shared.clone(),
                transport.clone(),
                listeners.clone(),
                &config,
            ),
            sequencer: self.publish_journal.map(PublishSequencer::new),
            bookmarks: self.bookmark_journal,
            subscriptions: self.subscriptions,
            authenticator: self.authenticator,
            liveness: Arc::new(Liveness::new()),
            server_version: Mutex::new(None),
            terminal_error: Mutex::new(None),
            auto_reconnect: AtomicBool::new(false),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            this: this.clone(),
            config,
            transport,
            shared,
            listeners,
        });
        Session { inner }
    }
}
