use std::sync::Weak;
use std::sync::atomic::Ordering;

use sowlink_message::{AckReason, AckStatus, AckTypes, CommandKind, Message};
use sowlink_transport::{ConnectionEpoch, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ack::{AckFields, AckOutcome};
use crate::error::{Error, Result};
use crate::heartbeat;
use crate::session::SessionInner;
use crate::state::ConnectionState;

impl<T: Transport> SessionInner<T> {
    /// The transport reported connection `epoch` gone.
    pub(crate) fn connection_lost(&self, epoch: ConnectionEpoch, reason: &str) {
        if !self.mark_disconnected(epoch) {
            return;
        }
        warn!(%epoch, reason, "connection lost");
        if self.auto_reconnect.load(Ordering::Acquire) && self.reconnect_tx.send(epoch).is_err() {
            debug!(%epoch, "reconnect task is gone");
        }
    }

    /// Move connection `epoch` to disconnected, failing everything that
    /// depended on it. Returns `false` if `epoch` was already superseded.
    pub(crate) fn mark_disconnected(&self, epoch: ConnectionEpoch) -> bool {
        let (abandoned, dropped) = {
            let mut state = self.shared.lock();
            let connection = &mut state.connection;
            if connection.epoch != epoch
                || matches!(
                    connection.state,
                    ConnectionState::Disconnected | ConnectionState::Shutdown
                )
            {
                return false;
            }
            connection.state = ConnectionState::Disconnected;
            connection.resubscribing = false;
            let abandoned = state.acks.abandon_all(epoch);
            let dropped = state.routes.retain_resubscribable();
            (abandoned, dropped)
        };
        debug!(%epoch, abandoned, dropped, "connection marked disconnected");
        self.shared.notify_all();
        self.dispatcher.invalidate_cache();
        self.listeners.state_changed(ConnectionState::Disconnected);
        true
    }

    /// Connect (or reconnect after `failed`) and bring the session all the
    /// way back up.
    pub(crate) async fn establish(
        &self,
        failed: Option<ConnectionEpoch>,
    ) -> Result<ConnectionEpoch> {
        let connecting = async {
            match failed {
                Some(failed) => self.transport.reconnect(failed).await,
                None => self.transport.connect().await,
            }
        };
        let connected = match &self.sequencer {
            Some(sequencer) => sequencer.suspend_while(connecting).await,
            None => connecting.await,
        };
        let epoch = connected.map_err(Error::from)?;

        {
            let mut state = self.shared.lock();
            if state.connection.state == ConnectionState::Shutdown {
                return Err(Error::Shutdown);
            }
            state.connection.epoch = epoch;
            state.connection.state = ConnectionState::Connected;
        }
        self.liveness.touch();
        self.shared.notify_all();
        self.listeners.state_changed(ConnectionState::Connected);

        if let Err(err) = self.recover(epoch).await {
            warn!(%epoch, %err, "session recovery failed");
            self.mark_disconnected(epoch);
            if self.transport.epoch() == Some(epoch) {
                if let Err(err) = self.transport.disconnect().await {
                    debug!(%err, "disconnect after failed recovery failed");
                }
            }
            return Err(err);
        }
        Ok(epoch)
    }

    async fn recover(&self, epoch: ConnectionEpoch) -> Result<()> {
        let logon = self.logon(epoch).await?;
        *self.server_version.lock() = logon.version.clone();
        self.enter(epoch, ConnectionState::LoggedOn)?;

        if let Some(interval) = self.config.heartbeat_interval {
            self.send_on_epoch(epoch, &heartbeat::start(interval)).await?;
        }

        if let Some(sequencer) = &self.sequencer {
            let server_last = logon.sequence.unwrap_or(0);
            sequencer
                .begin_epoch(epoch, server_last, self.transport.as_ref())
                .await?;
        }
        self.enter(epoch, ConnectionState::PublishReplayed)?;

        self.resubscribe_all(epoch).await?;
        self.enter(epoch, ConnectionState::Resubscribed)?;
        info!(%epoch, version = ?logon.version, "session ready");
        Ok(())
    }

    async fn resubscribe_all(&self, epoch: ConnectionEpoch) -> Result<()> {
        let Some(manager) = &self.subscriptions else {
            return Ok(());
        };
        if manager.is_empty() {
            return Ok(());
        }
        self.shared.lock().connection.resubscribing = true;
        let result = manager.resubscribe(self).await;
        {
            let mut state = self.shared.lock();
            if state.connection.epoch == epoch {
                state.connection.resubscribing = false;
            }
        }
        self.shared.notify_all();
        match &result {
            Ok(()) => debug!(%epoch, count = manager.len(), "subscriptions restored"),
            Err(err) => warn!(%epoch, %err, "resubscribe failed"),
        }
        result
    }

    /// Advance connection `epoch` to `next`.
    fn enter(&self, epoch: ConnectionEpoch, next: ConnectionState) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let connection = &mut state.connection;
            if connection.state == ConnectionState::Shutdown {
                return Err(Error::Shutdown);
            }
            if connection.epoch != epoch || connection.state == ConnectionState::Disconnected {
                return Err(Error::Disconnected(format!(
                    "connection {epoch} lost while entering {next}"
                )));
            }
            connection.state = next;
        }
        self.shared.notify_all();
        self.listeners.state_changed(next);
        Ok(())
    }

    /// Log on over connection `epoch`, retrying as long as the server asks
    /// for another attempt.
    async fn logon(&self, epoch: ConnectionEpoch) -> Result<AckFields> {
        let config = &self.config;
        let user_id = config.user_id.as_deref();
        let mut credential = self
            .authenticator
            .authenticate(user_id, config.password.as_deref())
            .await?;
        let mut attempts = 0;

        loop {
            let id = self.next_id();
            let mut message = Message::new(CommandKind::Logon).with_command_id(id.clone());
            message.client_name = Some(config.client_name.clone());
            message.user_id = config.user_id.clone();
            message.password.clone_from(&credential);
            message.version = Some(config.client_version.clone());
            message.ack_type = AckTypes::PROCESSED;

            let pending = self.acks.begin_wait(id, AckTypes::PROCESSED)?;
            self.send_on_epoch(epoch, &message).await?;
            let deadline = config.deadline(Some(config.logon_timeout));
            let outcome = self.acks.await_synchronously(pending, deadline.at).await;

            match outcome {
                AckOutcome::Success(fields) if fields.status == Some(AckStatus::Retry) => {
                    attempts += 1;
                    if attempts > config.logon_retry_limit {
                        let reason = AckReason::AuthFailure;
                        self.authenticator.completed(user_id, Some(&reason));
                        return Err(Error::ServerFailure {
                            command: CommandKind::Logon,
                            reason,
                            retry: None,
                        });
                    }
                    debug!(%epoch, attempts, "server asked for another logon attempt");
                    credential = self
                        .authenticator
                        .retry(user_id, credential.as_deref())
                        .await?;
                }
                AckOutcome::Success(fields) => {
                    self.authenticator.completed(user_id, None);
                    return Ok(fields);
                }
                AckOutcome::ServerFailure(reason, _) => {
                    self.authenticator.completed(user_id, Some(&reason));
                    return Err(Error::ServerFailure {
                        command: CommandKind::Logon,
                        reason,
                        retry: None,
                    });
                }
                AckOutcome::TimedOut => return Err(Error::TimedOut(deadline.timeout)),
                AckOutcome::Abandoned => {
                    return Err(Error::Disconnected(
                        "connection lost during logon".to_string(),
                    ));
                }
            }
        }
    }

    /// Repairs lost connections until the session shuts down.
    pub(crate) async fn reconnect_loop(
        session: Weak<Self>,
        mut failures: mpsc::UnboundedReceiver<ConnectionEpoch>,
        cancel: CancellationToken,
    ) {
        loop {
            let failed = tokio::select! {
                () = cancel.cancelled() => break,
                failed = failures.recv() => failed,
            };
            let Some(failed) = failed else {
                break;
            };
            let Some(session) = session.upgrade() else {
                break;
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = session.recover_from(failed) => {}
            }
        }
    }

    async fn recover_from(&self, mut failed: ConnectionEpoch) {
        {
            let state = self.shared.lock();
            if state.connection.epoch > failed
                || state.connection.state != ConnectionState::Disconnected
            {
                debug!(%failed, "connection already replaced");
                return;
            }
        }

        let policy = &self.config.reconnect;
        let mut attempts = 0;
        loop {
            match self.establish(Some(failed)).await {
                Ok(epoch) => {
                    info!(%epoch, attempts, "reconnected");
                    return;
                }
                Err(err) if err.is_recoverable() => {
                    attempts += 1;
                    if policy.exhausted(attempts) {
                        self.terminate(format!(
                            "gave up reconnecting after {attempts} attempts: {err}"
                        ))
                        .await;
                        return;
                    }
                    let delay = policy.delay(attempts);
                    warn!(attempts, ?delay, %err, "reconnect failed, retrying");
                    failed = failed.max(self.shared.lock().connection.epoch);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.terminate(format!("reconnect failed: {err}")).await;
                    return;
                }
            }
        }
    }

    /// Shut down because the connection cannot be restored.
    async fn terminate(&self, reason: String) {
        error!(%reason, "session terminated");
        *self.terminal_error.lock() = Some(reason);
        self.shut_down().await;
    }

    /// Enter the terminal state. Every waiter fails and every stream ends.
    pub(crate) async fn shut_down(&self) {
        let epoch = {
            let mut state = self.shared.lock();
            if state.connection.state == ConnectionState::Shutdown {
                return;
            }
            state.connection.state = ConnectionState::Shutdown;
            state.connection.resubscribing = false;
            state.acks.abandon_all(ConnectionEpoch::new(u64::MAX));
            state.routes.clear();
            state.connection.epoch
        };
        info!(%epoch, "session shutting down");
        self.shared.notify_all();
        self.dispatcher.invalidate_cache();
        self.listeners.state_changed(ConnectionState::Shutdown);
        if let Err(err) = self.transport.shutdown().await {
            debug!(%err, "transport shutdown failed");
        }
        self.cancel.cancel();
    }
}
