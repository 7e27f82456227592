//! In-process evstore server for integration tests.
//!
//! `FakeServer` speaks the real framed protocol over `127.0.0.1:0` and
//! keeps streams, volatile subscribers and persistent groups in memory.
//! Tests can make it ignore chosen commands, cut every open socket, require
//! credentials, or redirect writes to another node to exercise timeouts,
//! authentication, reconnection and leader changes.
//!
//! Persistent groups push every available event without honouring
//! `allowed_in_flight_messages`, so the client's own buffer limit is what
//! a test observes.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use evstore_client::{
    Connection, EventHandler, PersistentEventHandler, PersistentSubscriptionContext, ResolvedEvent,
    SubscriptionContext, SubscriptionDropReason,
};
use evstore_core::{ConnectionSettings, EndPoint, EventData};
use evstore_proto::messages::{self, NakAction};
use evstore_proto::{Command, Package};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Distance between the global positions of consecutive events.
const POSITION_STEP: i64 = 10;

pub const WAIT: Duration = Duration::from_secs(5);

// ── Store ───────────────────────────────────────────────────────────

struct Subscriber {
    conn: u64,
    correlation_id: Uuid,
    /// Empty for `$all`.
    stream: String,
    tx: mpsc::UnboundedSender<Package>,
}

struct Group {
    id: String,
    stream: String,
    /// Index into the stream of the next event to push.
    cursor: usize,
    consumers: Vec<Subscriber>,
    /// Event id to (log index, retry count).
    unacked: HashMap<Uuid, (usize, i32)>,
}

#[derive(Default)]
struct Store {
    log: Vec<messages::EventRecord>,
    streams: HashMap<String, Vec<usize>>,
    deleted: HashSet<String>,
    subscribers: Vec<Subscriber>,
    groups: HashMap<(String, String), Group>,
    swallowed: HashSet<Command>,
    received: HashMap<Command, usize>,
    /// Every command in arrival order.
    history: Vec<Command>,
    /// Accepted login/password pairs for `Authenticate`.
    users: HashMap<String, String>,
    /// Answer writes with `NotHandled(NotMaster)` naming this node.
    leader: Option<EndPoint>,
    acked: Vec<Uuid>,
    next_conn: u64,
}

fn position_of(index: usize) -> i64 {
    (index as i64 + 1) * POSITION_STEP
}

fn reply<M: prost::Message>(tx: &mpsc::UnboundedSender<Package>, command: Command, id: Uuid, message: &M) {
    let _ = tx.send(Package::from_message(command, id, message));
}

fn dropped(reason: messages::DroppedReason) -> messages::SubscriptionDropped {
    messages::SubscriptionDropped {
        reason: Some(reason as i32),
    }
}

impl Store {
    fn version(&self, stream: &str) -> i64 {
        self.streams.get(stream).map_or(-1, |events| events.len() as i64 - 1)
    }

    fn last_position(&self) -> i64 {
        if self.log.is_empty() { 0 } else { position_of(self.log.len() - 1) }
    }

    fn indexed(&self, index: usize) -> messages::ResolvedIndexedEvent {
        messages::ResolvedIndexedEvent {
            event: Some(self.log[index].clone()),
            link: None,
        }
    }

    fn resolved(&self, index: usize) -> messages::ResolvedEvent {
        messages::ResolvedEvent {
            event: Some(self.log[index].clone()),
            link: None,
            commit_position: position_of(index),
            prepare_position: position_of(index),
        }
    }

    fn handle(&mut self, conn: u64, tx: &mpsc::UnboundedSender<Package>, package: Package) {
        *self.received.entry(package.command).or_default() += 1;
        self.history.push(package.command);
        if self.swallowed.contains(&package.command) {
            return;
        }
        let id = package.correlation_id;
        if package.command == Command::WriteEvents {
            if let Some(leader) = &self.leader {
                not_master(tx, id, leader);
                return;
            }
        }
        match package.command {
            Command::Authenticate => {
                let known = package
                    .credentials
                    .as_ref()
                    .is_some_and(|c| self.users.get(&c.username) == Some(&c.password));
                if known {
                    let _ = tx.send(Package::new(Command::Authenticated, id, bytes::Bytes::new()));
                } else {
                    let _ = tx.send(Package::new(Command::NotAuthenticated, id, "invalid credentials"));
                }
            }
            Command::IdentifyClient => reply(tx, Command::ClientIdentified, id, &messages::ClientIdentified {}),
            Command::HeartbeatRequest => {
                let _ = tx.send(Package::new(Command::HeartbeatResponse, id, bytes::Bytes::new()));
            }
            Command::Ping => {
                let _ = tx.send(Package::new(Command::Pong, id, bytes::Bytes::new()));
            }
            Command::HeartbeatResponse | Command::Pong => {}
            Command::WriteEvents => match package.message::<messages::WriteEvents>() {
                Ok(request) => {
                    let response = self.write(request);
                    reply(tx, Command::WriteEventsCompleted, id, &response);
                }
                Err(_) => bad_request(tx, id),
            },
            Command::DeleteStream => match package.message::<messages::DeleteStream>() {
                Ok(request) => {
                    let response = self.delete(request);
                    reply(tx, Command::DeleteStreamCompleted, id, &response);
                }
                Err(_) => bad_request(tx, id),
            },
            Command::ReadEvent => match package.message::<messages::ReadEvent>() {
                Ok(request) => {
                    let response = self.read_event(request);
                    reply(tx, Command::ReadEventCompleted, id, &response);
                }
                Err(_) => bad_request(tx, id),
            },
            Command::ReadStreamEventsForward | Command::ReadStreamEventsBackward => {
                let forward = package.command == Command::ReadStreamEventsForward;
                match package.message::<messages::ReadStreamEvents>() {
                    Ok(request) => {
                        let response = self.read_stream(request, forward);
                        let command = if forward {
                            Command::ReadStreamEventsForwardCompleted
                        } else {
                            Command::ReadStreamEventsBackwardCompleted
                        };
                        reply(tx, command, id, &response);
                    }
                    Err(_) => bad_request(tx, id),
                }
            }
            Command::ReadAllEventsForward | Command::ReadAllEventsBackward => {
                let forward = package.command == Command::ReadAllEventsForward;
                match package.message::<messages::ReadAllEvents>() {
                    Ok(request) => {
                        let response = self.read_all(request, forward);
                        let command = if forward {
                            Command::ReadAllEventsForwardCompleted
                        } else {
                            Command::ReadAllEventsBackwardCompleted
                        };
                        reply(tx, command, id, &response);
                    }
                    Err(_) => bad_request(tx, id),
                }
            }
            Command::SubscribeToStream => match package.message::<messages::SubscribeToStream>() {
                Ok(request) => {
                    let confirmation = messages::SubscriptionConfirmation {
                        last_commit_position: self.last_position(),
                        last_event_number: (!request.event_stream_id.is_empty())
                            .then(|| self.version(&request.event_stream_id)),
                    };
                    self.subscribers.push(Subscriber {
                        conn,
                        correlation_id: id,
                        stream: request.event_stream_id,
                        tx: tx.clone(),
                    });
                    reply(tx, Command::SubscriptionConfirmation, id, &confirmation);
                }
                Err(_) => bad_request(tx, id),
            },
            Command::UnsubscribeFromStream => {
                self.subscribers.retain(|s| s.correlation_id != id);
                for group in self.groups.values_mut() {
                    group.consumers.retain(|s| s.correlation_id != id);
                }
                reply(
                    tx,
                    Command::SubscriptionDropped,
                    id,
                    &dropped(messages::DroppedReason::Unsubscribed),
                );
            }
            Command::CreatePersistentSubscription => {
                match package.message::<messages::CreatePersistentSubscription>() {
                    Ok(request) => {
                        let result = self.create_group(request);
                        let response = messages::CreatePersistentSubscriptionCompleted { result, reason: None };
                        reply(tx, Command::CreatePersistentSubscriptionCompleted, id, &response);
                    }
                    Err(_) => bad_request(tx, id),
                }
            }
            Command::UpdatePersistentSubscription => {
                match package.message::<messages::UpdatePersistentSubscription>() {
                    Ok(request) => {
                        let key = (request.event_stream_id, request.subscription_group_name);
                        let result = if self.groups.contains_key(&key) {
                            messages::ExistingPersistentSubscriptionResult::Success
                        } else {
                            messages::ExistingPersistentSubscriptionResult::DoesNotExist
                        };
                        let response = messages::ExistingPersistentSubscriptionCompleted {
                            result: result as i32,
                            reason: None,
                        };
                        reply(tx, Command::UpdatePersistentSubscriptionCompleted, id, &response);
                    }
                    Err(_) => bad_request(tx, id),
                }
            }
            Command::DeletePersistentSubscription => {
                match package.message::<messages::DeletePersistentSubscription>() {
                    Ok(request) => {
                        let key = (request.event_stream_id, request.subscription_group_name);
                        let result = match self.groups.remove(&key) {
                            Some(group) => {
                                for consumer in group.consumers {
                                    reply(
                                        &consumer.tx,
                                        Command::SubscriptionDropped,
                                        consumer.correlation_id,
                                        &dropped(messages::DroppedReason::PersistentSubscriptionDeleted),
                                    );
                                }
                                messages::ExistingPersistentSubscriptionResult::Success
                            }
                            None => messages::ExistingPersistentSubscriptionResult::DoesNotExist,
                        };
                        let response = messages::ExistingPersistentSubscriptionCompleted {
                            result: result as i32,
                            reason: None,
                        };
                        reply(tx, Command::DeletePersistentSubscriptionCompleted, id, &response);
                    }
                    Err(_) => bad_request(tx, id),
                }
            }
            Command::ConnectToPersistentSubscription => {
                match package.message::<messages::ConnectToPersistentSubscription>() {
                    Ok(request) => self.connect_group(conn, tx, id, request),
                    Err(_) => bad_request(tx, id),
                }
            }
            Command::PersistentSubscriptionAckEvents => {
                if let Ok(ack) = package.message::<messages::PersistentSubscriptionAckEvents>() {
                    let ids = parse_ids(&ack.processed_event_ids);
                    if let Some(group) = self.groups.values_mut().find(|g| g.id == ack.subscription_id) {
                        for event_id in &ids {
                            group.unacked.remove(event_id);
                        }
                    }
                    self.acked.extend(ids);
                }
            }
            Command::PersistentSubscriptionNakEvents => {
                if let Ok(nak) = package.message::<messages::PersistentSubscriptionNakEvents>() {
                    self.nak(nak);
                }
            }
            other => {
                let _ = tx.send(Package::new(Command::BadRequest, id, format!("unsupported command {other}")));
            }
        }
    }

    fn write(&mut self, request: messages::WriteEvents) -> messages::WriteEventsCompleted {
        let stream = request.event_stream_id;
        let failed = |result: messages::OperationResult, current: Option<i64>| messages::WriteEventsCompleted {
            result: result as i32,
            message: None,
            first_event_number: -1,
            last_event_number: -1,
            prepare_position: None,
            commit_position: None,
            current_version: current,
        };
        if self.deleted.contains(&stream) {
            return failed(messages::OperationResult::StreamDeleted, None);
        }
        let current = self.version(&stream);

        // A replayed write is answered with the original outcome.
        if let Some(first) = request.events.first() {
            let existing = self.streams.get(&stream).and_then(|indexes| {
                indexes
                    .iter()
                    .position(|&i| self.log[i].event_id == first.event_id)
                    .map(|number| (number, indexes[number]))
            });
            if let Some((number, index)) = existing {
                let last = number + request.events.len() - 1;
                return messages::WriteEventsCompleted {
                    result: messages::OperationResult::Success as i32,
                    message: None,
                    first_event_number: number as i64,
                    last_event_number: last as i64,
                    prepare_position: Some(position_of(index)),
                    commit_position: Some(position_of(index)),
                    current_version: Some(current),
                };
            }
        }

        let accepted = match request.expected_version {
            -2 => true,
            -1 => current == -1,
            -4 => current >= 0,
            n => n == current,
        };
        if !accepted {
            return failed(messages::OperationResult::WrongExpectedVersion, Some(current));
        }
        if request.events.is_empty() {
            return messages::WriteEventsCompleted {
                result: messages::OperationResult::Success as i32,
                message: None,
                first_event_number: current + 1,
                last_event_number: current,
                prepare_position: Some(self.last_position()),
                commit_position: Some(self.last_position()),
                current_version: Some(current),
            };
        }

        let mut appended = Vec::with_capacity(request.events.len());
        for (offset, event) in request.events.into_iter().enumerate() {
            let index = self.log.len();
            self.log.push(messages::EventRecord {
                event_stream_id: stream.clone(),
                event_number: current + 1 + offset as i64,
                event_id: event.event_id,
                event_type: event.event_type,
                data_content_type: event.data_content_type,
                metadata_content_type: event.metadata_content_type,
                data: event.data,
                metadata: event.metadata,
                created: None,
                created_epoch: Some(1_700_000_000_000),
            });
            self.streams.entry(stream.clone()).or_default().push(index);
            appended.push(index);
        }
        self.publish(&stream, &appended);

        let last_index = appended[appended.len() - 1];
        let last = self.version(&stream);
        messages::WriteEventsCompleted {
            result: messages::OperationResult::Success as i32,
            message: None,
            first_event_number: current + 1,
            last_event_number: last,
            prepare_position: Some(position_of(last_index)),
            commit_position: Some(position_of(last_index)),
            current_version: Some(last),
        }
    }

    fn publish(&mut self, stream: &str, appended: &[usize]) {
        for &index in appended {
            let event = messages::StreamEventAppeared {
                event: Some(self.resolved(index)),
            };
            for subscriber in self.subscribers.iter().filter(|s| s.stream.is_empty() || s.stream == stream) {
                reply(&subscriber.tx, Command::StreamEventAppeared, subscriber.correlation_id, &event);
            }
        }
        let keys: Vec<(String, String)> = self.groups.keys().filter(|(s, _)| s == stream).cloned().collect();
        for key in keys {
            self.pump(&key);
        }
    }

    /// Push every event past the group's cursor to its first consumer.
    fn pump(&mut self, key: &(String, String)) {
        let Some(stream_events) = self.streams.get(&key.0).cloned() else {
            return;
        };
        loop {
            let Some(group) = self.groups.get(key) else {
                return;
            };
            if group.consumers.is_empty() || group.cursor >= stream_events.len() {
                return;
            }
            let index = stream_events[group.cursor];
            let payload = messages::PersistentSubscriptionStreamEventAppeared {
                event: Some(self.indexed(index)),
                retry_count: Some(0),
            };
            let event_id = Uuid::from_slice_le(&self.log[index].event_id).unwrap_or_default();
            let Some(group) = self.groups.get_mut(key) else {
                return;
            };
            group.cursor += 1;
            group.unacked.insert(event_id, (index, 0));
            let consumer = &group.consumers[0];
            reply(
                &consumer.tx,
                Command::PersistentSubscriptionStreamEventAppeared,
                consumer.correlation_id,
                &payload,
            );
        }
    }

    fn nak(&mut self, nak: messages::PersistentSubscriptionNakEvents) {
        let ids = parse_ids(&nak.processed_event_ids);
        let retry = nak.action == NakAction::Retry as i32;
        let Some(key) = self
            .groups
            .iter()
            .find(|(_, g)| g.id == nak.subscription_id)
            .map(|(k, _)| k.clone())
        else {
            return;
        };
        let mut redeliver = Vec::new();
        if let Some(group) = self.groups.get_mut(&key) {
            for event_id in ids {
                if !retry {
                    group.unacked.remove(&event_id);
                } else if let Some((index, retries)) = group.unacked.get_mut(&event_id) {
                    *retries += 1;
                    redeliver.push((*index, *retries));
                }
            }
        }
        for (index, retry_count) in redeliver {
            let payload = messages::PersistentSubscriptionStreamEventAppeared {
                event: Some(self.indexed(index)),
                retry_count: Some(retry_count),
            };
            if let Some(consumer) = self.groups.get(&key).and_then(|g| g.consumers.first()) {
                reply(
                    &consumer.tx,
                    Command::PersistentSubscriptionStreamEventAppeared,
                    consumer.correlation_id,
                    &payload,
                );
            }
        }
    }

    fn delete(&mut self, request: messages::DeleteStream) -> messages::DeleteStreamCompleted {
        let current = self.version(&request.event_stream_id);
        let accepted = match request.expected_version {
            -2 => true,
            -4 => current >= 0,
            n => n == current,
        };
        let result = if self.deleted.contains(&request.event_stream_id) {
            messages::OperationResult::StreamDeleted
        } else if !accepted {
            messages::OperationResult::WrongExpectedVersion
        } else {
            self.deleted.insert(request.event_stream_id);
            messages::OperationResult::Success
        };
        messages::DeleteStreamCompleted {
            result: result as i32,
            message: None,
            prepare_position: Some(self.last_position()),
            commit_position: Some(self.last_position()),
        }
    }

    fn read_event(&self, request: messages::ReadEvent) -> messages::ReadEventCompleted {
        let completed = |result: messages::ReadEventResult, event| messages::ReadEventCompleted {
            result: result as i32,
            event,
            error: None,
        };
        if self.deleted.contains(&request.event_stream_id) {
            return completed(messages::ReadEventResult::StreamDeleted, None);
        }
        let Some(indexes) = self.streams.get(&request.event_stream_id) else {
            return completed(messages::ReadEventResult::NoStream, None);
        };
        let number = if request.event_number == -1 {
            indexes.len() as i64 - 1
        } else {
            request.event_number
        };
        match usize::try_from(number).ok().and_then(|n| indexes.get(n)) {
            Some(&index) => completed(messages::ReadEventResult::Success, Some(self.indexed(index))),
            None => completed(messages::ReadEventResult::NotFound, None),
        }
    }

    fn read_stream(&self, request: messages::ReadStreamEvents, forward: bool) -> messages::ReadStreamEventsCompleted {
        let missing = |result: messages::ReadStreamResult| messages::ReadStreamEventsCompleted {
            events: Vec::new(),
            result: result as i32,
            next_event_number: -1,
            last_event_number: -1,
            is_end_of_stream: true,
            last_commit_position: self.last_position(),
            error: None,
        };
        if self.deleted.contains(&request.event_stream_id) {
            return missing(messages::ReadStreamResult::StreamDeleted);
        }
        let Some(indexes) = self.streams.get(&request.event_stream_id) else {
            return missing(messages::ReadStreamResult::NoStream);
        };
        let len = indexes.len() as i64;
        let max = i64::from(request.max_count.max(0));
        let (numbers, next, end): (Vec<i64>, i64, bool) = if forward {
            let from = request.from_event_number.max(0);
            let to = (from + max).min(len);
            let numbers: Vec<i64> = (from..to).collect();
            let next = from + numbers.len() as i64;
            (numbers, next, next >= len)
        } else {
            let from = if request.from_event_number < 0 {
                len - 1
            } else {
                request.from_event_number.min(len - 1)
            };
            let to = (from - max + 1).max(0);
            let numbers: Vec<i64> = (to..=from).rev().collect();
            let next = to - 1;
            (numbers, next, next < 0)
        };
        messages::ReadStreamEventsCompleted {
            events: numbers.iter().map(|&n| self.indexed(indexes[n as usize])).collect(),
            result: messages::ReadStreamResult::Success as i32,
            next_event_number: next,
            last_event_number: len - 1,
            is_end_of_stream: end,
            last_commit_position: self.last_position(),
            error: None,
        }
    }

    fn read_all(&self, request: messages::ReadAllEvents, forward: bool) -> messages::ReadAllEventsCompleted {
        let max = usize::try_from(request.max_count.max(0)).unwrap_or(0);
        let from = request.commit_position;
        let indexes: Vec<usize> = if forward {
            (0..self.log.len()).filter(|&i| position_of(i) >= from).take(max).collect()
        } else {
            (0..self.log.len())
                .rev()
                .filter(|&i| from < 0 || position_of(i) < from)
                .take(max)
                .collect()
        };
        let next = match indexes.last() {
            Some(&last) if forward => position_of(last) + 1,
            Some(&last) => position_of(last),
            None => from,
        };
        messages::ReadAllEventsCompleted {
            commit_position: request.commit_position,
            prepare_position: request.prepare_position,
            events: indexes.iter().map(|&i| self.resolved(i)).collect(),
            next_commit_position: next,
            next_prepare_position: next,
            result: Some(messages::ReadAllResult::Success as i32),
            error: None,
        }
    }

    fn create_group(&mut self, request: messages::CreatePersistentSubscription) -> i32 {
        let key = (request.event_stream_id.clone(), request.subscription_group_name.clone());
        if self.groups.contains_key(&key) {
            return messages::CreatePersistentSubscriptionResult::AlreadyExists as i32;
        }
        let cursor = if request.start_from < 0 {
            self.streams.get(&request.event_stream_id).map_or(0, Vec::len)
        } else {
            usize::try_from(request.start_from).unwrap_or(0)
        };
        self.groups.insert(
            key,
            Group {
                id: format!("{}::{}", request.event_stream_id, request.subscription_group_name),
                stream: request.event_stream_id,
                cursor,
                consumers: Vec::new(),
                unacked: HashMap::new(),
            },
        );
        messages::CreatePersistentSubscriptionResult::Success as i32
    }

    fn connect_group(
        &mut self,
        conn: u64,
        tx: &mpsc::UnboundedSender<Package>,
        id: Uuid,
        request: messages::ConnectToPersistentSubscription,
    ) {
        let key = (request.event_stream_id.clone(), request.subscription_id.clone());
        let last_event_number = self.version(&request.event_stream_id);
        let last_commit_position = self.last_position();
        let Some(group) = self.groups.get_mut(&key) else {
            reply(tx, Command::SubscriptionDropped, id, &dropped(messages::DroppedReason::NotFound));
            return;
        };
        group.consumers.push(Subscriber {
            conn,
            correlation_id: id,
            stream: request.event_stream_id,
            tx: tx.clone(),
        });
        let confirmation = messages::PersistentSubscriptionConfirmation {
            last_commit_position,
            subscription_id: group.id.clone(),
            last_event_number: Some(last_event_number),
        };
        reply(tx, Command::PersistentSubscriptionConfirmation, id, &confirmation);
        self.pump(&key);
    }

    fn disconnect(&mut self, conn: u64) {
        self.subscribers.retain(|s| s.conn != conn);
        for group in self.groups.values_mut() {
            group.consumers.retain(|s| s.conn != conn);
        }
    }
}

fn not_master(tx: &mpsc::UnboundedSender<Package>, id: Uuid, leader: &EndPoint) {
    let info = messages::MasterInfo {
        external_tcp_address: leader.host.clone(),
        external_tcp_port: i32::from(leader.port),
        external_http_address: leader.host.clone(),
        external_http_port: 2113,
        external_secure_tcp_address: None,
        external_secure_tcp_port: None,
    };
    let message = messages::NotHandled {
        reason: messages::NotHandledReason::NotMaster as i32,
        additional_info: Some(prost::Message::encode_to_vec(&info)),
    };
    reply(tx, Command::NotHandled, id, &message);
}

fn bad_request(tx: &mpsc::UnboundedSender<Package>, id: Uuid) {
    let _ = tx.send(Package::new(Command::BadRequest, id, "malformed payload"));
}

fn parse_ids(raw: &[Vec<u8>]) -> Vec<Uuid> {
    raw.iter().filter_map(|bytes| Uuid::from_slice_le(bytes).ok()).collect()
}

// ── Server ──────────────────────────────────────────────────────────

pub struct FakeServer {
    addr: SocketAddr,
    store: Arc<Mutex<Store>>,
    kill: broadcast::Sender<()>,
    accept: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        let store = Arc::new(Mutex::new(Store::default()));
        let (kill, _) = broadcast::channel(16);

        let accept_store = store.clone();
        let accept_kill = kill.clone();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(accept_store.clone(), socket, accept_kill.subscribe()));
            }
        });

        Self {
            addr,
            store,
            kill,
            accept,
        }
    }

    pub fn endpoint(&self) -> EndPoint {
        EndPoint::from(self.addr)
    }

    /// Settings with short timers so failure paths resolve quickly.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings::single_node(self.endpoint())
            .with_connection_name("integration-test")
            .with_operation_timeout(Duration::from_secs(3))
            .with_timeout_check_period(Duration::from_millis(50))
            .with_reconnection_delay(Duration::from_millis(20), Duration::from_millis(200))
    }

    pub async fn connect(&self) -> Connection {
        let conn = Connection::from_settings(self.settings()).expect("create connection");
        conn.connect().await.expect("connect to fake server");
        conn
    }

    /// Receive but never answer `command`.
    pub fn swallow(&self, command: Command) {
        self.store.lock().unwrap().swallowed.insert(command);
    }

    pub fn answer(&self, command: Command) {
        self.store.lock().unwrap().swallowed.remove(&command);
    }

    /// Accept `username`/`password` in `Authenticate`.
    pub fn add_user(&self, username: &str, password: &str) {
        self.store
            .lock()
            .unwrap()
            .users
            .insert(username.to_string(), password.to_string());
    }

    /// Reject every write as not-leader, pointing at `leader`.
    pub fn redirect_writes_to(&self, leader: EndPoint) {
        self.store.lock().unwrap().leader = Some(leader);
    }

    /// Commands received so far, in order.
    pub fn history(&self) -> Vec<Command> {
        self.store.lock().unwrap().history.clone()
    }

    pub fn received(&self, command: Command) -> usize {
        self.store.lock().unwrap().received.get(&command).copied().unwrap_or(0)
    }

    pub async fn wait_for(&self, command: Command, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.received(command) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("server never received {count} x {command}"));
    }

    /// Close every open client socket. The listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.store.lock().unwrap().streams.get(stream).map_or(0, Vec::len)
    }

    pub fn acked(&self) -> Vec<Uuid> {
        self.store.lock().unwrap().acked.clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.kill.send(());
    }
}

async fn serve(store: Arc<Mutex<Store>>, socket: TcpStream, mut kill: broadcast::Receiver<()>) {
    let conn = {
        let mut store = store.lock().unwrap();
        store.next_conn += 1;
        store.next_conn
    };
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Package>();
    let write_task = tokio::spawn(async move {
        while let Some(package) = rx.recv().await {
            let Ok(frame) = package.encode() else {
                break;
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(8 * 1024);
    'conn: loop {
        tokio::select! {
            _ = kill.recv() => break,
            read = reader.read_buf(&mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    break;
                }
                loop {
                    match Package::decode_frame(&mut buf) {
                        Ok(Some(package)) => store.lock().unwrap().handle(conn, &tx, package),
                        Ok(None) => break,
                        Err(_) => break 'conn,
                    }
                }
            }
        }
    }

    store.lock().unwrap().disconnect(conn);
    write_task.abort();
}

// ── Handlers ────────────────────────────────────────────────────────

pub fn events(count: usize, event_type: &str) -> Vec<EventData> {
    (0..count)
        .map(|i| EventData::new(event_type, true, format!("{{\"n\":{i}}}")))
        .collect()
}

/// What a [`Recorder`] saw, readable from the test.
pub struct Observed {
    pub events: mpsc::UnboundedReceiver<(ResolvedEvent, Option<i32>)>,
    pub drops: mpsc::UnboundedReceiver<(SubscriptionDropReason, Option<String>)>,
    pub live_started: Arc<AtomicUsize>,
    pub drop_count: Arc<AtomicUsize>,
}

impl Observed {
    pub async fn next_event(&mut self) -> (ResolvedEvent, Option<i32>) {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("handler gone")
    }

    pub async fn take_events(&mut self, count: usize) -> Vec<ResolvedEvent> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.next_event().await.0);
        }
        out
    }

    pub async fn dropped(&mut self) -> (SubscriptionDropReason, Option<String>) {
        tokio::time::timeout(WAIT, self.drops.recv())
            .await
            .expect("timed out waiting for the drop")
            .expect("handler gone")
    }

    /// No event arrives within `quiet`.
    pub async fn assert_quiet(&mut self, quiet: Duration) {
        if let Ok(Some((event, _))) = tokio::time::timeout(quiet, self.events.recv()).await {
            panic!("unexpected event {:?}", event.original_event_number());
        }
    }
}

/// Forwards everything it sees to a [`Observed`]. Optionally fails on the
/// n-th event (1-based).
pub struct Recorder {
    events: mpsc::UnboundedSender<(ResolvedEvent, Option<i32>)>,
    drops: mpsc::UnboundedSender<(SubscriptionDropReason, Option<String>)>,
    live_started: Arc<AtomicUsize>,
    drop_count: Arc<AtomicUsize>,
    fail_on: Option<usize>,
    seen: usize,
}

impl Recorder {
    pub fn new() -> (Self, Observed) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (drops_tx, drops_rx) = mpsc::unbounded_channel();
        let live_started = Arc::new(AtomicUsize::new(0));
        let drop_count = Arc::new(AtomicUsize::new(0));
        (
            Self {
                events: events_tx,
                drops: drops_tx,
                live_started: live_started.clone(),
                drop_count: drop_count.clone(),
                fail_on: None,
                seen: 0,
            },
            Observed {
                events: events_rx,
                drops: drops_rx,
                live_started,
                drop_count,
            },
        )
    }

    pub fn failing_on(mut self, nth: usize) -> Self {
        self.fail_on = Some(nth);
        self
    }

    fn record(&mut self, event: ResolvedEvent, retry_count: Option<i32>) -> anyhow::Result<()> {
        self.seen += 1;
        if self.fail_on == Some(self.seen) {
            anyhow::bail!("handler rejected event {}", self.seen);
        }
        let _ = self.events.send((event, retry_count));
        Ok(())
    }

    fn record_drop(&mut self, reason: SubscriptionDropReason, error: Option<anyhow::Error>) {
        self.drop_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.drops.send((reason, error.map(|e| e.to_string())));
    }
}

impl EventHandler for Recorder {
    async fn event_appeared(&mut self, _ctx: &SubscriptionContext, event: ResolvedEvent) -> anyhow::Result<()> {
        self.record(event, None)
    }

    fn live_processing_started(&mut self, _ctx: &SubscriptionContext) {
        self.live_started.fetch_add(1, Ordering::SeqCst);
    }

    fn dropped(&mut self, _ctx: &SubscriptionContext, reason: SubscriptionDropReason, error: Option<anyhow::Error>) {
        self.record_drop(reason, error);
    }
}

impl PersistentEventHandler for Recorder {
    async fn event_appeared(
        &mut self,
        _ctx: &PersistentSubscriptionContext,
        event: ResolvedEvent,
        retry_count: Option<i32>,
    ) -> anyhow::Result<()> {
        self.record(event, retry_count)
    }

    fn dropped(
        &mut self,
        _ctx: &PersistentSubscriptionContext,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        self.record_drop(reason, error);
    }
}

/// Event numbers of `events`, in order.
pub fn numbers(events: &[ResolvedEvent]) -> Vec<i64> {
    events.iter().filter_map(|e| e.original_event_number()).collect()
}

/// Route client logs through the test harness; `RUST_LOG` selects them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
