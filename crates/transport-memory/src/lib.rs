//! In-memory transport implementation for testing
//!
//! Connects a session to a [`MemoryServer`] in the same process. Every
//! connect opens a fresh server-side connection with its own epoch; the
//! server can drop connections at will to exercise reconnect paths.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod server;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use sowlink_message::Message;
use sowlink_transport::{ConnectionEpoch, Transport, TransportError, TransportEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

pub use server::{MemoryServer, SERVER_VERSION};

#[derive(Debug, Clone, Copy)]
struct Live {
    epoch: ConnectionEpoch,
    connection: server::ConnectionId,
}

#[derive(Debug, Default)]
struct LinkState {
    current: Option<Live>,
    last_epoch: ConnectionEpoch,
    shutdown: bool,
}

/// Memory transport implementation
#[derive(Debug)]
pub struct MemoryTransport {
    server: MemoryServer,
    state: Arc<Mutex<LinkState>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemoryTransport {
    /// Create a transport connecting to `server`.
    #[must_use]
    pub fn new(server: &MemoryServer) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            server: server.clone(),
            state: Arc::new(Mutex::new(LinkState::default())),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// The server this transport connects to.
    #[must_use]
    pub const fn server(&self) -> &MemoryServer {
        &self.server
    }

    fn events(&self) -> Result<mpsc::UnboundedSender<TransportEvent>, TransportError> {
        self.events_tx.lock().clone().ok_or(TransportError::Shutdown)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<ConnectionEpoch, TransportError> {
        let events = self.events()?;
        let (connection, mut rx) = self
            .server
            .accept()
            .ok_or_else(|| TransportError::ConnectionFailed("server refused connection".into()))?;

        let epoch = {
            let mut state = self.state.lock();
            if state.shutdown {
                self.server.close(connection);
                return Err(TransportError::Shutdown);
            }
            if let Some(previous) = state.current.take() {
                self.server.close(previous.connection);
            }
            state.last_epoch = state.last_epoch.next();
            state.current = Some(Live {
                epoch: state.last_epoch,
                connection,
            });
            state.last_epoch
        };
        info!(%epoch, connection, "memory transport connected");
        let _ = events.send(TransportEvent::Connected(epoch));

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if events.send(TransportEvent::Message(epoch, message)).is_err() {
                    return;
                }
            }
            {
                let mut state = state.lock();
                if state.current.is_some_and(|live| live.epoch == epoch) {
                    state.current = None;
                }
            }
            debug!(%epoch, "memory connection closed");
            let _ = events.send(TransportEvent::Disconnected(
                epoch,
                "connection closed".to_string(),
            ));
        });

        Ok(epoch)
    }

    async fn reconnect(&self, failed: ConnectionEpoch) -> Result<ConnectionEpoch, TransportError> {
        let stale = {
            let state = self.state.lock();
            match state.current {
                Some(live) if live.epoch > failed => return Ok(live.epoch),
                Some(live) => Some(live.connection),
                None => None,
            }
        };
        if let Some(connection) = stale {
            self.server.close(connection);
        }
        self.connect().await
    }

    async fn send(&self, message: &Message) -> Result<ConnectionEpoch, TransportError> {
        let live = self.state.lock().current.ok_or(TransportError::NotConnected)?;
        if self.server.receive(live.connection, message.clone()) {
            Ok(live.epoch)
        } else {
            Err(TransportError::Disconnected {
                epoch: live.epoch,
                reason: "server closed the connection".to_string(),
            })
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let live = self.state.lock().current.take();
        if let Some(live) = live {
            debug!(epoch = %live.epoch, "memory transport disconnecting");
            self.server.close(live.connection);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.state.lock().shutdown = true;
        self.disconnect().await?;
        self.events_tx.lock().take();
        Ok(())
    }

    fn incoming(&self) -> Option<BoxStream<'static, TransportEvent>> {
        self.events_rx
            .lock()
            .take()
            .map(|rx| UnboundedReceiverStream::new(rx).boxed())
    }

    fn epoch(&self) -> Option<ConnectionEpoch> {
        self.state.lock().current.map(|live| live.epoch)
    }
}
