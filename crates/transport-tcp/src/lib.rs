//! TCP transport implementation for sowlink
//!
//! Each message travels as a length-prefixed frame: a 4-byte big-endian
//! length followed by the CBOR-encoded message. A reader task decodes
//! inbound frames onto the transport's event stream and a writer task
//! drains an outbound queue, one pair per connection.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use sowlink_message::{Message, codec};
use sowlink_transport::{Config, ConnectionEpoch, Transport, TransportError, TransportEvent};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// TCP-specific configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Generic transport configuration
    pub transport: Config,
    /// Server address, `host:port`
    pub address: String,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl TcpConfig {
    /// Configuration for `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            transport: Config::default(),
            address: address.into(),
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Live {
    epoch: ConnectionEpoch,
    outgoing: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

#[derive(Debug, Default)]
struct LinkState {
    current: Option<Live>,
    last_epoch: ConnectionEpoch,
    shutdown: bool,
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    state: Arc<Mutex<LinkState>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl TcpTransport {
    /// Create a transport; nothing connects until [`Transport::connect`].
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Arc::new(Mutex::new(LinkState::default())),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Read one frame.
    async fn read_raw<R: AsyncRead + Unpin>(
        stream: &mut R,
        max_frame_size: usize,
    ) -> Result<Bytes, TransportError> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: max_frame_size,
            });
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    /// Write one frame.
    async fn write_raw<W: AsyncWrite + Unpin>(
        stream: &mut W,
        data: &Bytes,
    ) -> Result<(), TransportError> {
        let len = u32::try_from(data.len()).map_err(|_| TransportError::FrameTooLarge {
            size: data.len(),
            max: u32::MAX as usize,
        })?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        live: Live,
        events: mpsc::UnboundedSender<TransportEvent>,
        mut outgoing_rx: mpsc::Receiver<Bytes>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let epoch = live.epoch;
        let max_frame_size = self.config.transport.max_frame_size;

        let writer_closed = live.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_closed.cancelled() => break,
                    frame = outgoing_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = Self::write_raw(&mut writer, &frame).await {
                            warn!(%epoch, "write failed: {e}");
                            writer_closed.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        let state = self.state.clone();
        let closed = live.closed;
        tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    () = closed.cancelled() => break "connection closed locally".to_string(),
                    frame = Self::read_raw(&mut reader, max_frame_size) => frame,
                };
                match frame.and_then(|bytes| codec::decode(&bytes).map_err(Into::into)) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(epoch, message)).is_err() {
                            break "transport dropped".to_string();
                        }
                    }
                    Err(e) => break e.to_string(),
                }
            };
            closed.cancel();
            {
                let mut state = state.lock();
                if state.current.as_ref().is_some_and(|live| live.epoch == epoch) {
                    state.current = None;
                }
            }
            debug!(%epoch, %reason, "tcp connection closed");
            let _ = events.send(TransportEvent::Disconnected(epoch, reason));
        });
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<ConnectionEpoch, TransportError> {
        let events = self
            .events_tx
            .lock()
            .clone()
            .ok_or(TransportError::Shutdown)?;
        let connect_timeout = self.config.transport.connect_timeout;

        let stream = match timeout(connect_timeout, TcpStream::connect(&self.config.address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(TransportError::Timeout(connect_timeout)),
        };
        stream.set_nodelay(self.config.nodelay)?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.transport.outbound_buffer);
        let live = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(TransportError::Shutdown);
            }
            if let Some(previous) = state.current.take() {
                previous.closed.cancel();
            }
            state.last_epoch = state.last_epoch.next();
            let live = Live {
                epoch: state.last_epoch,
                outgoing: outgoing_tx,
                closed: CancellationToken::new(),
            };
            state.current = Some(live.clone());
            live
        };
        let epoch = live.epoch;
        info!(%epoch, address = %self.config.address, "tcp transport connected");
        let _ = events.send(TransportEvent::Connected(epoch));
        self.spawn_connection(stream, live, events, outgoing_rx);
        Ok(epoch)
    }

    async fn reconnect(&self, failed: ConnectionEpoch) -> Result<ConnectionEpoch, TransportError> {
        {
            let mut state = self.state.lock();
            match &state.current {
                Some(live) if live.epoch > failed => return Ok(live.epoch),
                Some(_) => {
                    if let Some(stale) = state.current.take() {
                        stale.closed.cancel();
                    }
                }
                None => {}
            }
        }
        self.connect().await
    }

    async fn send(&self, message: &Message) -> Result<ConnectionEpoch, TransportError> {
        let frame = codec::encode(message)?;
        let max = self.config.transport.max_frame_size;
        if frame.len() > max {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }

        let live = self
            .state
            .lock()
            .current
            .clone()
            .ok_or(TransportError::NotConnected)?;
        live.outgoing
            .send(frame)
            .await
            .map_err(|_| TransportError::Disconnected {
                epoch: live.epoch,
                reason: "writer stopped".to_string(),
            })?;
        Ok(live.epoch)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(live) = self.state.lock().current.take() {
            debug!(epoch = %live.epoch, "tcp transport disconnecting");
            live.closed.cancel();
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
        self.state.lock().current.as_ref().map(|live| live.epoch)
    }
}
