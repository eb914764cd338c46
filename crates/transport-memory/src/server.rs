//! An in-process stand-in for the messaging server.
//!
//! Implements enough of the server's behavior to exercise a session end to
//! end: logon, a cache of records per topic with a transaction log,
//! subscriptions (including bookmark replay), queries, deletes, acks and
//! persisted acks. Filters match records whose payload contains the filter
//! text.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use sowlink_message::{
    AckReason, AckStatus, AckTypes, CommandKind, Identifier, Message, RecordCounts, bookmark,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub(crate) type ConnectionId = u64;

/// Version the server reports on logon.
pub const SERVER_VERSION: &str = "5.3.4.0-memory";

#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    client_name: Option<String>,
    logged_on: bool,
}

#[derive(Debug, Clone)]
struct Subscription {
    connection: ConnectionId,
    sub_id: Identifier,
    topic: String,
    filter: Option<String>,
}

#[derive(Debug, Default)]
struct Topic {
    records: IndexMap<String, Message>,
    log: Vec<Message>,
}

#[derive(Debug)]
struct ServerState {
    connections: HashMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
    topics: HashMap<String, Topic>,
    subscriptions: Vec<Subscription>,
    persisted: HashMap<String, u64>,
    highest_received: HashMap<String, u64>,
    received: Vec<Message>,
    next_bookmark: u64,
    accepting: bool,
    hold_persisted_acks: bool,
    logon_retries: u32,
    reject_logons: bool,
    entitled_topics: HashSet<String>,
    hold_subscribe_acks: bool,
    reject_subscribes: Option<AckReason>,
    silent: bool,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            next_connection: 0,
            topics: HashMap::new(),
            subscriptions: Vec::new(),
            persisted: HashMap::new(),
            highest_received: HashMap::new(),
            received: Vec::new(),
            next_bookmark: 0,
            accepting: true,
            hold_persisted_acks: false,
            logon_retries: 0,
            reject_logons: false,
            entitled_topics: HashSet::new(),
            hold_subscribe_acks: false,
            reject_subscribes: None,
            silent: false,
        }
    }
}

fn matches_filter(filter: Option<&str>, record: &Message) -> bool {
    filter
        .filter(|f| !f.is_empty())
        .is_none_or(|f| record.data_str().contains(f))
}

impl ServerState {
    fn send(&self, connection: ConnectionId, message: Message) {
        if let Some(conn) = self.connections.get(&connection) {
            let _ = conn.tx.send(message);
        }
    }

    fn client_name(&self, connection: ConnectionId) -> String {
        self.connections
            .get(&connection)
            .and_then(|c| c.client_name.clone())
            .unwrap_or_default()
    }

    /// Ack `request` with `ack_type` if the client asked for it.
    fn reply(
        &self,
        connection: ConnectionId,
        request: &Message,
        ack_type: AckTypes,
        status: AckStatus,
        reason: Option<AckReason>,
        records: RecordCounts,
    ) {
        if self.silent || !request.ack_type.contains(ack_type) {
            return;
        }
        let Some(command_id) = request.command_id.clone() else {
            return;
        };
        let mut ack = Message::ack(command_id, ack_type, status);
        ack.reason = reason;
        ack.records = records;
        ack.sub_id.clone_from(&request.sub_id);
        ack.query_id.clone_from(&request.query_id);
        self.send(connection, ack);
    }

    fn fail(&self, connection: ConnectionId, request: &Message, reason: AckReason) {
        debug!(command = %request.command, %reason, "rejecting command");
        self.reply(
            connection,
            request,
            AckTypes::PROCESSED,
            AckStatus::Failure,
            Some(reason),
            RecordCounts::default(),
        );
    }

    fn succeed(&self, connection: ConnectionId, request: &Message, records: RecordCounts) {
        self.reply(
            connection,
            request,
            AckTypes::PROCESSED,
            AckStatus::Success,
            None,
            records,
        );
    }

    fn send_persisted(
        &self,
        connection: ConnectionId,
        sequence: u64,
        command_id: Option<Identifier>,
    ) {
        if self.silent {
            return;
        }
        let mut ack = Message::new(CommandKind::Ack).with_sequence(sequence);
        ack.ack_type = AckTypes::PERSISTED;
        ack.status = Some(AckStatus::Success);
        ack.command_id = command_id;
        self.send(connection, ack);
    }

    fn handle(&mut self, connection: ConnectionId, message: Message) {
        trace!(connection, command = %message.command, "server received");
        self.received.push(message.clone());

        let logged_on = self
            .connections
            .get(&connection)
            .is_some_and(|c| c.logged_on);

        match message.command {
            CommandKind::Logon => self.logon(connection, &message),
            CommandKind::Heartbeat => {}
            _ if !logged_on => self.fail(connection, &message, AckReason::LogonRequired),
            CommandKind::Publish | CommandKind::DeltaPublish => self.publish(connection, &message),
            CommandKind::Subscribe
            | CommandKind::DeltaSubscribe
            | CommandKind::SowAndSubscribe
            | CommandKind::SowAndDeltaSubscribe => self.subscribe(connection, &message),
            CommandKind::Sow => {
                if let Some(topic) = message.topic.clone() {
                    let query_id = message.query_id.clone().or_else(|| message.command_id.clone());
                    self.query(connection, &message, &topic, query_id);
                } else {
                    self.fail(connection, &message, AckReason::InvalidTopic);
                }
            }
            CommandKind::SowDelete => self.sow_delete(connection, &message),
            CommandKind::Unsubscribe => self.unsubscribe(connection, &message),
            CommandKind::Flush => self.succeed(connection, &message, RecordCounts::default()),
            _ => debug!(command = %message.command, "ignoring unexpected command"),
        }
    }

    fn logon(&mut self, connection: ConnectionId, request: &Message) {
        let client_name = request.client_name.clone().unwrap_or_default();
        let (status, reason) = if self.reject_logons {
            (AckStatus::Failure, Some(AckReason::AuthFailure))
        } else if self.logon_retries > 0 {
            self.logon_retries -= 1;
            (AckStatus::Retry, None)
        } else {
            if let Some(conn) = self.connections.get_mut(&connection) {
                conn.logged_on = true;
                conn.client_name = Some(client_name.clone());
            }
            (AckStatus::Success, None)
        };

        if self.silent {
            return;
        }
        let mut ack = Message::new(CommandKind::Ack);
        ack.command_id.clone_from(&request.command_id);
        ack.ack_type = AckTypes::PROCESSED;
        ack.status = Some(status);
        ack.reason = reason;
        ack.sequence = Some(self.persisted.get(&client_name).copied().unwrap_or(0));
        ack.version = Some(SERVER_VERSION.to_string());
        self.send(connection, ack);
    }

    fn publish(&mut self, connection: ConnectionId, request: &Message) {
        let Some(topic) = request.topic.clone() else {
            self.fail(connection, request, AckReason::InvalidTopic);
            return;
        };
        if self.entitled_topics.contains(&topic) && request.user_id.is_none() {
            self.fail(connection, request, AckReason::NotEntitled);
            return;
        }

        let client = self.client_name(connection);
        if let Some(sequence) = request.sequence {
            let persisted = self.persisted.get(&client).copied().unwrap_or(0);
            if sequence <= persisted {
                self.fail(connection, request, AckReason::Duplicate);
                self.send_persisted(connection, persisted, None);
                return;
            }
            let highest = self.highest_received.entry(client.clone()).or_default();
            *highest = (*highest).max(sequence);
        }

        self.next_bookmark += 1;
        let key = request
            .sow_key
            .clone()
            .unwrap_or_else(|| request.data_str().into_owned());
        let record = Message::new(CommandKind::Publish)
            .with_topic(topic.clone())
            .with_data(request.data.clone())
            .with_sow_key(key.clone())
            .with_bookmark(format!("1|{}|", self.next_bookmark));

        let entry = self.topics.entry(topic.clone()).or_default();
        let replaced = entry.records.insert(key, record.clone()).is_some();
        entry.log.push(record.clone());
        self.deliver(&topic, &record);

        let records = RecordCounts {
            inserted: u64::from(!replaced),
            updated: u64::from(replaced),
            ..RecordCounts::default()
        };
        self.succeed(connection, request, records);

        if let Some(sequence) = request.sequence {
            if !self.hold_persisted_acks {
                self.persisted.insert(client, sequence);
                self.send_persisted(connection, sequence, request.command_id.clone());
            }
        }
    }

    /// Fan a record out to every matching subscription, one message per
    /// connection carrying every satisfied subscription id.
    fn deliver(&self, topic: &str, record: &Message) {
        let mut per_connection: IndexMap<ConnectionId, Vec<Identifier>> = IndexMap::new();
        for sub in &self.subscriptions {
            if sub.topic == topic && matches_filter(sub.filter.as_deref(), record) {
                per_connection
                    .entry(sub.connection)
                    .or_default()
                    .push(sub.sub_id.clone());
            }
        }
        for (connection, sub_ids) in per_connection {
            let mut message = record.clone();
            message.sub_id = sub_ids.first().cloned();
            message.sub_ids = sub_ids;
            self.send(connection, message);
        }
    }

    fn subscribe(&mut self, connection: ConnectionId, request: &Message) {
        let Some(topic) = request.topic.clone() else {
            self.fail(connection, request, AckReason::InvalidTopic);
            return;
        };
        let Some(sub_id) = request.sub_id.clone().or_else(|| request.command_id.clone()) else {
            self.fail(connection, request, AckReason::Other("missing sub id".to_string()));
            return;
        };
        if let Some(reason) = self.reject_subscribes.clone() {
            self.fail(connection, request, reason);
            return;
        }

        let existing = self
            .subscriptions
            .iter()
            .position(|s| s.connection == connection && s.sub_id == sub_id);
        if existing.is_some() && !request.has_option("replace") {
            self.fail(connection, request, AckReason::NameInUse);
            return;
        }

        let replay = match request.bookmark.as_deref() {
            None | Some(bookmark::NOW) => Vec::new(),
            Some(position) => match self.log_after(&topic, position) {
                Some(replay) => replay,
                None => {
                    self.fail(connection, request, AckReason::InvalidBookmark);
                    return;
                }
            },
        };

        if let Some(index) = existing {
            self.subscriptions.remove(index);
        }
        if request.command.is_query() {
            let query_id = request.query_id.clone().unwrap_or_else(|| sub_id.clone());
            self.query(connection, request, &topic, Some(query_id));
        }
        for record in replay {
            if matches_filter(request.filter.as_deref(), &record) {
                let mut message = record;
                message.sub_id = Some(sub_id.clone());
                message.sub_ids = vec![sub_id.clone()];
                self.send(connection, message);
            }
        }

        debug!(connection, %sub_id, %topic, "subscription registered");
        self.subscriptions.push(Subscription {
            connection,
            sub_id,
            topic,
            filter: request.filter.clone(),
        });
        if !self.hold_subscribe_acks {
            self.succeed(connection, request, RecordCounts::default());
        }
    }

    fn log_after(&self, topic: &str, position: &str) -> Option<Vec<Message>> {
        let log = self.topics.get(topic).map(|t| t.log.as_slice()).unwrap_or(&[]);
        if position == bookmark::EPOCH {
            return Some(log.to_vec());
        }
        log.iter()
            .position(|m| m.bookmark.as_deref() == Some(position))
            .map(|index| log[index + 1..].to_vec())
    }

    fn query(
        &self,
        connection: ConnectionId,
        request: &Message,
        topic: &str,
        query_id: Option<Identifier>,
    ) {
        let records: Vec<Message> = self
            .topics
            .get(topic)
            .map(|t| {
                t.records
                    .values()
                    .filter(|r| matches_filter(request.filter.as_deref(), r))
                    .take(request.top_n.map_or(usize::MAX, |n| n as usize))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let marker = |kind| {
            let mut message = Message::new(kind).with_topic(topic);
            message.query_id.clone_from(&query_id);
            message
        };

        self.send(connection, marker(CommandKind::GroupBegin));
        let returned = records.len() as u64;
        for record in records {
            let mut message = record;
            message.command = CommandKind::Sow;
            message.query_id.clone_from(&query_id);
            self.send(connection, message);
        }
        let mut end = marker(CommandKind::GroupEnd);
        end.records.returned = returned;
        self.send(connection, end);

        self.reply(
            connection,
            request,
            AckTypes::COMPLETED,
            AckStatus::Success,
            None,
            RecordCounts {
                returned,
                ..RecordCounts::default()
            },
        );
    }

    fn sow_delete(&mut self, connection: ConnectionId, request: &Message) {
        let Some(topic) = request.topic.as_deref() else {
            self.fail(connection, request, AckReason::InvalidTopic);
            return;
        };
        let deleted = self.topics.get_mut(topic).map_or(0, |entry| {
            let keys: Vec<String> = if let Some(keys) = request.sow_keys.as_deref() {
                keys.split(',').map(|k| k.trim().to_string()).collect()
            } else if !request.data.is_empty() {
                vec![request.data_str().into_owned()]
            } else {
                entry
                    .records
                    .iter()
                    .filter(|(_, r)| matches_filter(request.filter.as_deref(), r))
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            keys.iter()
                .filter(|k| entry.records.shift_remove(k.as_str()).is_some())
                .count() as u64
        });
        self.succeed(
            connection,
            request,
            RecordCounts {
                deleted,
                ..RecordCounts::default()
            },
        );
    }

    fn unsubscribe(&mut self, connection: ConnectionId, request: &Message) {
        let target = request.sub_id.clone();
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| {
            s.connection != connection
                || target
                    .as_ref()
                    .is_some_and(|t| t.as_bytes() != b"all" && *t != s.sub_id)
        });
        debug!(removed = before - self.subscriptions.len(), "unsubscribed");
        self.succeed(connection, request, RecordCounts::default());
    }
}

/// A scriptable in-process server shared by any number of
/// [`MemoryTransport`](crate::MemoryTransport)s.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Create a server that accepts connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn accept(&self) -> Option<(ConnectionId, mpsc::UnboundedReceiver<Message>)> {
        let mut state = self.state.lock();
        if !state.accepting {
            return None;
        }
        state.next_connection += 1;
        let id = state.next_connection;
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            Connection {
                tx,
                client_name: None,
                logged_on: false,
            },
        );
        debug!(connection = id, "server accepted connection");
        Some((id, rx))
    }

    pub(crate) fn close(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.connections.remove(&connection);
        state.subscriptions.retain(|s| s.connection != connection);
    }

    /// Process `message` from `connection`. Returns `false` if the
    /// connection is gone.
    pub(crate) fn receive(&self, connection: ConnectionId, message: Message) -> bool {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&connection) {
            return false;
        }
        state.handle(connection, message);
        true
    }

    /// Accept or refuse new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().accepting = accepting;
    }

    /// Stop (or resume) acknowledging persistence of sequenced publishes.
    pub fn hold_persisted_acks(&self, hold: bool) {
        self.state.lock().hold_persisted_acks = hold;
    }

    /// Persist everything received so far and tell each connected client.
    pub fn persist_all(&self) {
        let mut state = self.state.lock();
        let highest: Vec<(String, u64)> = state
            .highest_received
            .iter()
            .map(|(client, seq)| (client.clone(), *seq))
            .collect();
        for (client, sequence) in highest {
            state.persisted.insert(client.clone(), sequence);
            let targets: Vec<ConnectionId> = state
                .connections
                .iter()
                .filter(|(_, c)| c.client_name.as_deref() == Some(client.as_str()))
                .map(|(id, _)| *id)
                .collect();
            for connection in targets {
                state.send_persisted(connection, sequence, None);
            }
        }
    }

    /// Answer the next `count` logons with a retry status.
    pub fn retry_logons(&self, count: u32) {
        self.state.lock().logon_retries = count;
    }

    /// Refuse (or accept) logon credentials.
    pub fn reject_logons(&self, reject: bool) {
        self.state.lock().reject_logons = reject;
    }

    /// Reject publishes to `topic` that do not assert a user id.
    pub fn require_user_id(&self, topic: impl Into<String>) {
        self.state.lock().entitled_topics.insert(topic.into());
    }

    /// Register subscriptions without acknowledging them.
    pub fn hold_subscribe_acks(&self, hold: bool) {
        self.state.lock().hold_subscribe_acks = hold;
    }

    /// Refuse every subscribe with `reason`, or accept them again with
    /// `None`.
    pub fn reject_subscribes(&self, reason: Option<AckReason>) {
        self.state.lock().reject_subscribes = reason;
    }

    /// Stop (or resume) sending acks.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Drop every connection, as if the server restarted its listener.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        debug!(count = state.connections.len(), "dropping all connections");
        state.connections.clear();
        state.subscriptions.clear();
    }

    /// Set the last persisted sequence the server reports to `client`.
    pub fn set_last_persisted(&self, client: impl Into<String>, sequence: u64) {
        self.state.lock().persisted.insert(client.into(), sequence);
    }

    /// Last persisted sequence for `client`.
    #[must_use]
    pub fn last_persisted(&self, client: &str) -> u64 {
        self.state.lock().persisted.get(client).copied().unwrap_or(0)
    }

    /// Insert a record into the cache as if another client published it.
    pub fn seed(&self, topic: &str, key: &str, data: &str) {
        let mut state = self.state.lock();
        state.next_bookmark += 1;
        let record = Message::new(CommandKind::Publish)
            .with_topic(topic)
            .with_data(data.to_string())
            .with_sow_key(key)
            .with_bookmark(format!("1|{}|", state.next_bookmark));
        let entry = state.topics.entry(topic.to_string()).or_default();
        entry.records.insert(key.to_string(), record.clone());
        entry.log.push(record.clone());
        state.deliver(topic, &record);
    }

    /// Send a raw message to every connection.
    pub fn inject(&self, message: &Message) {
        let state = self.state.lock();
        for conn in state.connections.values() {
            let _ = conn.tx.send(message.clone());
        }
    }

    /// Every message the server has received, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<Message> {
        self.state.lock().received.clone()
    }

    /// Received messages of the publish family.
    #[must_use]
    pub fn received_publishes(&self) -> Vec<Message> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|m| m.command.is_publish())
            .cloned()
            .collect()
    }

    /// Received messages of kind `kind`.
    #[must_use]
    pub fn received_of(&self, kind: CommandKind) -> Vec<Message> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|m| m.command == kind)
            .cloned()
            .collect()
    }

    /// Open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Live subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Cached records of `topic`, in insertion order.
    #[must_use]
    pub fn cached(&self, topic: &str) -> Vec<Message> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.records.values().cloned().collect())
            .unwrap_or_default()
    }
}
