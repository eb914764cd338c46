//! Listener traits for connection state and handler failures.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use sowlink_message::Message;
use tracing::warn;

use crate::error::HandlerError;
use crate::handler::MessageHandler;
use crate::state::ConnectionState;
use crate::stream::StreamShared;

/// Observes connection state transitions.
pub trait ConnectionStateListener: Send + Sync + 'static {
    /// Called after the session enters `state`.
    fn state_changed(&self, state: ConnectionState);
}

impl<F> ConnectionStateListener for F
where
    F: Fn(ConnectionState) + Send + Sync + 'static,
{
    fn state_changed(&self, state: ConnectionState) {
        self(state);
    }
}

/// Observes failures raised by message handlers.
pub trait ExceptionListener: Send + Sync + 'static {
    /// Called when a handler fails on `message`.
    fn exception(&self, error: &HandlerError, message: &Message);
}

impl<F> ExceptionListener for F
where
    F: Fn(&HandlerError, &Message) + Send + Sync + 'static,
{
    fn exception(&self, error: &HandlerError, message: &Message) {
        self(error, message);
    }
}

/// Everything outside the route table that hears about session events.
#[derive(Default)]
pub(crate) struct Listeners {
    connection: RwLock<Vec<Arc<dyn ConnectionStateListener>>>,
    exception: RwLock<Option<Arc<dyn ExceptionListener>>>,
    last_chance: RwLock<Option<Arc<dyn MessageHandler>>>,
    streams: Mutex<Vec<Weak<StreamShared>>>,
}

impl Listeners {
    pub(crate) fn add_connection(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.connection.write().push(listener);
    }

    pub(crate) fn set_exception(&self, listener: Arc<dyn ExceptionListener>) {
        *self.exception.write() = Some(listener);
    }

    pub(crate) fn set_last_chance(&self, handler: Arc<dyn MessageHandler>) {
        *self.last_chance.write() = Some(handler);
    }

    /// Track a live stream so it hears about connection changes.
    pub(crate) fn watch_stream(&self, stream: &Arc<StreamShared>) {
        let mut streams = self.streams.lock();
        streams.retain(|s| s.strong_count() > 0);
        streams.push(Arc::downgrade(stream));
    }

    pub(crate) fn state_changed(&self, state: ConnectionState) {
        let streams: Vec<_> = {
            let mut streams = self.streams.lock();
            streams.retain(|s| s.strong_count() > 0);
            streams.drain(..).filter_map(|s| s.upgrade()).collect()
        };
        for stream in streams {
            stream.mark_disconnected();
        }

        let listeners = self.connection.read().clone();
        for listener in listeners {
            listener.state_changed(state);
        }
    }

    pub(crate) fn exception(&self, error: &HandlerError, message: &Message) {
        let listener = self.exception.read().clone();
        match listener {
            Some(listener) => listener.exception(error, message),
            None => warn!(%error, command = %message.command, "message handler failed"),
        }
    }

    /// Offer an unroutable message to the last-chance handler.
    ///
    /// Returns `false` if no handler is installed.
    pub(crate) fn last_chance(&self, message: &Message) -> bool {
        let handler = self.last_chance.read().clone();
        let Some(handler) = handler else {
            return false;
        };
        if let Err(error) = handler.handle(message) {
            self.exception(&error, message);
        }
        true
    }
}
