use std::sync::Weak;

use futures::StreamExt;
use futures::stream::BoxStream;
use sowlink_message::{AckTypes, DispatchClass, Identifier, Message};
use sowlink_transport::{ConnectionEpoch, Transport, TransportEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::ack::AckFields;
use crate::heartbeat;
use crate::session::SessionInner;

/// Receive task: the only place inbound messages are dispatched from.
pub(crate) async fn run<T: Transport>(
    session: Weak<SessionInner<T>>,
    mut events: BoxStream<'static, TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            debug!("transport event stream ended");
            break;
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Connected(epoch) => debug!(%epoch, "transport connected"),
            TransportEvent::Message(epoch, message) => {
                if epoch < session.shared.lock().connection.epoch {
                    trace!(
                        %epoch,
                        command = %message.command,
                        "dropping message from an old connection"
                    );
                    continue;
                }
                session.liveness.touch();
                session.dispatch(epoch, &message).await;
            }
            TransportEvent::Disconnected(epoch, reason) => session.connection_lost(epoch, &reason),
        }
    }
}

impl<T: Transport> SessionInner<T> {
    async fn dispatch(&self, epoch: ConnectionEpoch, message: &Message) {
        let delivered = match message.command.dispatch_class() {
            DispatchClass::Ack => self.dispatch_ack(message).await,
            DispatchClass::Heartbeat => {
                if let Err(err) = self.transport.send(&heartbeat::beat()).await {
                    debug!(%epoch, %err, "heartbeat reply not sent");
                }
                return;
            }
            DispatchClass::Publish => self.dispatch_publish(message).await,
            DispatchClass::QueryResult => match &message.query_id {
                Some(id) => self.dispatcher.deliver_data(message, id).await,
                None => 0,
            },
            DispatchClass::Other => match &message.command_id {
                Some(id) => self.dispatcher.deliver_data(message, id).await,
                None => 0,
            },
        };
        if delivered == 0 {
            self.dispatcher.unhandled(message);
        }
    }

    async fn dispatch_ack(&self, message: &Message) -> usize {
        let ack_type = message.ack_type;
        let mut consumed = 0;
        if ack_type.contains(AckTypes::PERSISTED) && self.record_persisted(message).await {
            consumed += 1;
        }

        if let Some(id) = &message.command_id {
            if self.acks.resolve(id, AckFields::from_message(message)) {
                consumed += 1;
            }
        }
        consumed + self.dispatcher.deliver_ack(message, ack_type).await
    }

    /// Let the journals forget what the server has made durable. Returns
    /// whether a journal took the ack.
    async fn record_persisted(&self, message: &Message) -> bool {
        let mut recorded = false;
        if let (Some(sequencer), Some(sequence)) = (&self.sequencer, message.sequence) {
            recorded = true;
            if let Err(err) = sequencer.on_ack_persisted(sequence).await {
                warn!(sequence, %err, "failed to discard persisted publishes");
            }
        }
        if let (Some(journal), Some(sub_id), Some(bookmark)) =
            (&self.bookmarks, &message.sub_id, &message.bookmark)
        {
            recorded = true;
            if let Err(err) = journal.persisted(sub_id, bookmark).await {
                warn!(%sub_id, %err, "failed to record persisted bookmark");
            }
        }
        recorded
    }

    async fn dispatch_publish(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for sub_id in message.subscription_ids() {
            if self.is_duplicate(message, sub_id).await {
                continue;
            }
            delivered += self.dispatcher.deliver_data(message, sub_id).await;
        }
        delivered
    }

    /// Whether a bookmark subscription has already seen `message`. Logs it
    /// in the bookmark journal otherwise.
    async fn is_duplicate(&self, message: &Message, sub_id: &Identifier) -> bool {
        let Some(journal) = &self.bookmarks else {
            return false;
        };
        if message.bookmark.is_none() || !self.shared.lock().routes.is_bookmarked(sub_id) {
            return false;
        }
        let mut scoped = message.clone();
        scoped.sub_id = Some(sub_id.clone());
        match journal.is_discarded(&scoped).await {
            Ok(true) => {
                trace!(%sub_id, bookmark = ?scoped.bookmark, "skipping duplicate");
                return true;
            }
            Ok(false) => {}
            Err(err) => warn!(%sub_id, %err, "bookmark lookup failed"),
        }
        match journal.log(&scoped).await {
            Ok(_) => false,
            Err(err) => {
                warn!(%sub_id, %err, "failed to log bookmark");
                false
            }
        }
    }
}
