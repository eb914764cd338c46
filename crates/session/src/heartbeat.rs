use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sowlink_message::{CommandKind, Message};
use sowlink_transport::Transport;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::shared::Shared;

/// Keepalive sent in reply to a server heartbeat, or while a stream is
/// full.
pub(crate) fn beat() -> Message {
    let mut message = Message::new(CommandKind::Heartbeat);
    message.add_option("beat");
    message
}

/// Ask the server to send heartbeats every `interval`.
pub(crate) fn start(interval: Duration) -> Message {
    let mut message = Message::new(CommandKind::Heartbeat);
    message.options = Some(format!("start,{}", interval.as_secs().max(1)));
    message
}

/// When the connection last showed signs of life.
#[derive(Debug)]
pub(crate) struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Drop the connection once nothing has arrived for two heartbeat
/// intervals. The reconnect machinery takes it from there.
pub(crate) async fn watchdog<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Shared>,
    liveness: Arc<Liveness>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let limit = interval * 2;
    let mut ticker = tokio::time::interval((interval / 2).max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !shared.connection_state().is_logged_on() {
            liveness.touch();
            continue;
        }
        let idle = liveness.idle();
        if idle > limit {
            warn!(?idle, "no traffic within two heartbeat intervals, dropping connection");
            if let Err(err) = transport.disconnect().await {
                debug!(%err, "disconnect after missed heartbeats failed");
            }
            liveness.touch();
        }
    }
}
