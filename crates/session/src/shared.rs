use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use sowlink_transport::ConnectionEpoch;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::ack::AckTable;
use crate::routing::RouteTable;
use crate::state::ConnectionState;

/// Connection facts every component reads.
#[derive(Debug)]
pub(crate) struct ConnectionStatus {
    pub(crate) state: ConnectionState,
    /// Epoch of the most recent physical connection, live or not.
    pub(crate) epoch: ConnectionEpoch,
    pub(crate) resubscribing: bool,
}

/// Everything guarded by the session lock.
pub(crate) struct SessionState {
    pub(crate) routes: RouteTable,
    pub(crate) acks: AckTable,
    pub(crate) connection: ConnectionStatus,
}

/// The session lock and its broadcast wakeup.
///
/// Waiters register for the wakeup before checking their condition, so a
/// change made between the check and the wait is never missed. The lock
/// is never held across an await.
pub(crate) struct Shared {
    state: Mutex<SessionState>,
    changed: Notify,
    recheck: Duration,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn new(recheck: Duration) -> Self {
        Self {
            state: Mutex::new(SessionState {
                routes: RouteTable::new(),
                acks: AckTable::default(),
                connection: ConnectionStatus {
                    state: ConnectionState::Disconnected,
                    epoch: ConnectionEpoch::NONE,
                    resubscribing: false,
                },
            }),
            changed: Notify::new(),
            recheck,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Wake every waiter to re-check its condition.
    pub(crate) fn notify_all(&self) {
        self.changed.notify_waiters();
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection.state
    }

    /// Wait until `check` yields a value or `deadline` passes.
    ///
    /// Without a deadline the condition is re-checked every recheck
    /// interval as well as on every wakeup. Returns `None` only once the
    /// deadline has passed with the condition still unmet.
    pub(crate) async fn wait_for<T>(
        &self,
        deadline: Option<Instant>,
        mut check: impl FnMut(&mut SessionState) -> Option<T>,
    ) -> Option<T> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = check(&mut *self.state.lock());
            if outcome.is_some() {
                return outcome;
            }

            let now = Instant::now();
            let wake = match deadline {
                Some(deadline) if now >= deadline => return None,
                Some(deadline) => deadline.min(now + self.recheck),
                None => now + self.recheck,
            };
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
