use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sowlink_message::{AckStatus, AckTypes, Identifier, Message};
use sowlink_transport::Transport;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::error::HandlerError;
use crate::handler::MessageHandler;
use crate::heartbeat;
use crate::listener::Listeners;
use crate::shared::Shared;
use crate::state::ConnectionState;

struct CachedRoute {
    generation: u64,
    id: Identifier,
    handler: Arc<dyn MessageHandler>,
}

/// Delivers inbound messages to the handlers registered for them.
///
/// Handlers are looked up under the session lock and invoked outside it.
/// A handler that reports its buffer full is offered the message again
/// after a short pause, with keepalives sent to the server meanwhile, so
/// the receive task stalls rather than dropping data.
pub struct Dispatcher<T> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    listeners: Arc<Listeners>,
    generation: Arc<AtomicU64>,
    cache: Mutex<Option<CachedRoute>>,
    retry_delay: Duration,
    beat_every: Duration,
}

impl<T: Transport> Dispatcher<T> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<T>,
        listeners: Arc<Listeners>,
        config: &SessionConfig,
    ) -> Self {
        let generation = shared.lock().routes.generation_handle();
        Self {
            shared,
            transport,
            listeners,
            generation,
            cache: Mutex::new(None),
            retry_delay: config.stream_full_retry_delay,
            beat_every: config.stream_full_heartbeat,
        }
    }

    /// Deliver a data message to the route registered for `id`.
    ///
    /// Returns the number of handlers the message reached.
    pub async fn deliver_data(&self, message: &Message, id: &Identifier) -> usize {
        let Some(handler) = self.lookup(id) else {
            trace!(%id, command = %message.command, "no route");
            return 0;
        };
        self.invoke(&handler, message, id).await;
        1
    }

    /// Apply an ack of `ack_type` to the route of the command it answers.
    ///
    /// Completes the route's ack bookkeeping, and delivers the ack if the
    /// route's handler asked for this type. Returns the number of routes
    /// the ack was applied to.
    pub async fn deliver_ack(&self, message: &Message, ack_type: AckTypes) -> usize {
        let failed = message.status == Some(AckStatus::Failure);
        let candidates = [
            message.command_id.as_ref(),
            message.query_id.as_ref(),
            message.sub_id.as_ref(),
        ];

        let matched = {
            let mut state = self.shared.lock();
            candidates.into_iter().flatten().find_map(|id| {
                state
                    .routes
                    .record_ack(id, ack_type, failed)
                    .map(|routing| (id.clone(), routing))
            })
        };
        let Some((id, routing)) = matched else {
            return 0;
        };
        if routing.removed {
            debug!(%id, "route completed");
        }
        if let Some(handler) = routing.handler {
            self.invoke(&handler, message, &id).await;
        }
        1
    }

    /// Forget the cached route lookup.
    pub fn invalidate_cache(&self) {
        *self.cache.lock() = None;
    }

    /// Offer a message nothing else claimed to the last-chance handler.
    pub(crate) fn unhandled(&self, message: &Message) {
        if !self.listeners.last_chance(message) {
            debug!(command = %message.command, "dropping unroutable message");
        }
    }

    fn lookup(&self, id: &Identifier) -> Option<Arc<dyn MessageHandler>> {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.generation == generation && cached.id == *id {
                return Some(cached.handler.clone());
            }
        }

        let (handler, generation) = {
            let state = self.shared.lock();
            (state.routes.handler(id)?, state.routes.generation())
        };
        *self.cache.lock() = Some(CachedRoute {
            generation,
            id: id.clone(),
            handler: handler.clone(),
        });
        Some(handler)
    }

    async fn invoke(&self, handler: &Arc<dyn MessageHandler>, message: &Message, id: &Identifier) {
        let mut last_beat: Option<Instant> = None;
        loop {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message)));
            match result {
                Ok(Ok(())) | Ok(Err(HandlerError::Closed)) => return,
                Ok(Err(HandlerError::StreamFull)) => {
                    if !self.still_routed(id) {
                        debug!(%id, "route went away while its stream was full");
                        return;
                    }
                    if last_beat.is_none_or(|at| at.elapsed() >= self.beat_every) {
                        trace!(%id, "stream full, sending keepalive");
                        if let Err(err) = self.transport.send(&heartbeat::beat()).await {
                            trace!(%err, "keepalive not sent");
                        }
                        last_beat = Some(Instant::now());
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
                Ok(Err(error)) => {
                    self.listeners.exception(&error, message);
                    return;
                }
                Err(payload) => {
                    let text = payload
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(%id, panic = %text, "message handler panicked");
                    self.listeners
                        .exception(&HandlerError::Panicked(text), message);
                    return;
                }
            }
        }
    }

    fn still_routed(&self, id: &Identifier) -> bool {
        let state = self.shared.lock();
        state.connection.state != ConnectionState::Shutdown && state.routes.has_route(id)
    }
}
