//! The connection engine.
//!
//! A single task owns all mutable connection state: the current transport,
//! pending operations, live subscriptions. Everything else talks to it
//! through [`EngineHandle`] messages, so no state is shared across tasks.
//!
//! ```text
//!   Init ─► Connecting ─► Connected ─┐
//!              ▲   │                 │ transport lost
//!              │   ▼                 ▼
//!              └─ Reconnecting ◄─────┘
//!                      │ budget exhausted / close()
//!                      ▼
//!                    Closed
//! ```
//!
//! `Connecting` moves through discovery, socket establishment, an
//! `Authenticate` exchange when default credentials are configured, and
//! the `IdentifyClient` handshake. A rejected or unanswered authentication
//! is reported and the handshake continues unauthenticated. Discovery and dialing run in spawned tasks
//! that report back tagged with an attempt number; stale reports are
//! discarded. Work submitted before the first successful handshake waits
//! in the queues and is sent once the connection is identified.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use evstore_core::{ConnectionSettings, EndPoint, TlsConfig};
use evstore_proto::messages::IdentifyClient;
use evstore_proto::{Command, Package, UserCredentials};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{EndpointDiscoverer, NodeEndpoints};
use crate::error::{ClientError, ClientResult};
use crate::events::ConnectionEvent;
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::operations::kinds::{Operation, RequestKind};
use crate::operations::{InspectionDecision, OperationItem, OperationsManager, PackageSink, payload_text};
use crate::reconnect::{ReconnectDecision, ReconnectionController};
use crate::subscriptions::{
    SubscriptionAction, SubscriptionItem, SubscriptionRequest, SubscriptionSignal, SubscriptionsManager,
};
use crate::transport::{Transport, TransportEvent, TransportSettings};

/// Protocol version announced in `IdentifyClient`.
const CLIENT_VERSION: i32 = 1;

const MAX_TICK: Duration = Duration::from_millis(200);

// ── Handle ───────────────────────────────────────────────────────────

/// Requests from the application side.
pub(crate) enum EngineMessage {
    Connect(oneshot::Sender<ClientResult<()>>),
    StartOperation(OperationItem),
    StartSubscription(SubscriptionItem),
    Unsubscribe(Uuid),
    /// Acks and naks for a persistent subscription.
    SubscriptionPackage(Package),
    Close {
        reason: String,
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Signal receiver for one subscription, as returned by
/// [`EngineHandle::subscribe`].
pub(crate) struct SubscriptionChannel {
    pub(crate) correlation_id: Uuid,
    pub(crate) signals: mpsc::UnboundedReceiver<SubscriptionSignal>,
    pub(crate) depth: Arc<AtomicUsize>,
}

/// Cloneable sender side of the engine.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineMessage>,
    settings: Arc<ConnectionSettings>,
    open: Arc<AtomicBool>,
}

impl EngineHandle {
    pub(crate) fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// False once the engine reached `Closed`.
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, message: EngineMessage) -> ClientResult<()> {
        self.tx
            .send(message)
            .map_err(|_| ClientError::ConnectionClosed("connection is closed".into()))
    }

    pub(crate) async fn connect(&self) -> ClientResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::Connect(tx))?;
        rx.await
            .map_err(|_| ClientError::ConnectionClosed("connection engine stopped".into()))?
    }

    /// Run one request to completion. Falls back to the default
    /// credentials when `credentials` is `None`.
    pub(crate) async fn execute<K: RequestKind>(
        &self,
        kind: K,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<K::Output> {
        let credentials = credentials.or_else(|| self.settings.default_credentials.clone());
        let (operation, rx) = Operation::new(kind, credentials, self.settings.use_tls);
        let item = OperationItem::new(
            Box::new(operation),
            self.settings.max_retries,
            self.settings.operation_timeout,
            Instant::now(),
        );
        self.send(EngineMessage::StartOperation(item))?;
        rx.await
            .map_err(|_| ClientError::ConnectionClosed("connection engine stopped".into()))?
    }

    pub(crate) fn subscribe(
        &self,
        request: SubscriptionRequest,
        credentials: Option<UserCredentials>,
        max_queue: usize,
    ) -> ClientResult<SubscriptionChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let item = SubscriptionItem::new(
            request,
            credentials.or_else(|| self.settings.default_credentials.clone()),
            self.settings.max_retries,
            self.settings.operation_timeout,
            max_queue,
            tx,
            depth.clone(),
            Instant::now(),
        );
        let correlation_id = item.correlation_id;
        self.send(EngineMessage::StartSubscription(item))?;
        Ok(SubscriptionChannel {
            correlation_id,
            signals: rx,
            depth,
        })
    }

    pub(crate) fn unsubscribe(&self, correlation_id: Uuid) {
        // Nothing to unsubscribe from once the engine is gone.
        let _ = self.send(EngineMessage::Unsubscribe(correlation_id));
    }

    pub(crate) fn send_subscription_package(&self, package: Package) -> ClientResult<()> {
        self.send(EngineMessage::SubscriptionPackage(package))
    }

    pub(crate) async fn close(&self, reason: &str) {
        let (tx, rx) = oneshot::channel();
        let message = EngineMessage::Close {
            reason: reason.to_string(),
            reply: Some(tx),
        };
        if self.send(message).is_ok() {
            let _ = rx.await;
        }
    }
}

// ── State ────────────────────────────────────────────────────────────

/// A transport waiting for the reply to one handshake request.
struct Handshake {
    transport: Transport,
    correlation_id: Uuid,
    deadline: Instant,
}

enum ConnectPhase {
    Discovering,
    Establishing { endpoint: EndPoint },
    Authenticating(Handshake),
    Identifying(Handshake),
}

enum ConnectionState {
    Init,
    Connecting(ConnectPhase),
    Connected {
        transport: Transport,
        heartbeat: HeartbeatMonitor,
    },
    Reconnecting {
        retry_at: Instant,
    },
    Closed,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::Connecting(ConnectPhase::Discovering) => "discovering",
            ConnectionState::Connecting(ConnectPhase::Establishing { .. }) => "establishing",
            ConnectionState::Connecting(ConnectPhase::Authenticating(_)) => "authenticating",
            ConnectionState::Connecting(ConnectPhase::Identifying(_)) => "identifying",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Results of work spawned by the engine.
enum Internal {
    Discovered {
        attempt: u64,
        result: ClientResult<Vec<NodeEndpoints>>,
    },
    Established {
        attempt: u64,
        endpoint: EndPoint,
        result: ClientResult<Transport>,
    },
}

impl PackageSink for Transport {
    fn send_package(&mut self, package: &Package) -> ClientResult<()> {
        self.send(package)
    }
}

// ── Engine ───────────────────────────────────────────────────────────

pub(crate) struct Engine {
    settings: Arc<ConnectionSettings>,
    discoverer: Arc<dyn EndpointDiscoverer>,
    transport_settings: TransportSettings,
    connection_name: String,
    rx: mpsc::UnboundedReceiver<EngineMessage>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    events: broadcast::Sender<ConnectionEvent>,
    open: Arc<AtomicBool>,

    state: ConnectionState,
    operations: OperationsManager,
    subscriptions: SubscriptionsManager,
    reconnection: ReconnectionController,
    connect_waiters: Vec<oneshot::Sender<ClientResult<()>>>,
    next_conn_id: u64,
    attempt: u64,
    /// Endpoint of the last transport that reached `Connected`.
    last_endpoint: Option<EndPoint>,
    /// Leader announced by a `NotHandled(NotMaster)` reply.
    redirect: Option<NodeEndpoints>,
    last_timeout_check: Instant,
}

impl Engine {
    /// Spawn the engine task on the current runtime.
    pub(crate) fn spawn(
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndpointDiscoverer>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> ClientResult<EngineHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::InvalidOperation(format!("no tokio runtime: {e}")))?;

        let tls = if settings.use_tls {
            let config = TlsConfig::for_validation(settings.validate_server)?;
            Some((config, settings.target_host.clone()))
        } else {
            None
        };
        let transport_settings = TransportSettings {
            tls,
            connect_timeout: settings.client_connection_timeout,
        };
        let connection_name = settings
            .connection_name
            .clone()
            .unwrap_or_else(|| format!("evstore-{}", Uuid::new_v4()));

        let settings = Arc::new(settings);
        let open = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            operations: OperationsManager::new(settings.max_concurrent_items, settings.max_queue_size),
            subscriptions: SubscriptionsManager::new(),
            reconnection: ReconnectionController::new(
                settings.max_reconnections,
                settings.reconnection_delay,
                settings.max_reconnection_delay,
            ),
            settings: settings.clone(),
            discoverer,
            transport_settings,
            connection_name,
            rx,
            internal_tx,
            internal_rx,
            transport_tx,
            transport_rx,
            events,
            open: open.clone(),
            state: ConnectionState::Init,
            connect_waiters: Vec::new(),
            next_conn_id: 0,
            attempt: 0,
            last_endpoint: None,
            redirect: None,
            last_timeout_check: Instant::now(),
        };
        runtime.spawn(engine.run());

        Ok(EngineHandle { tx, settings, open })
    }

    async fn run(mut self) {
        let tick = MAX_TICK.min(self.settings.operation_timeout_check_period);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(connection = %self.connection_name, ?tick, "connection engine started");

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        self.close("connection dropped by application");
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event),
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
            if matches!(self.state, ConnectionState::Closed) {
                break;
            }
        }
        debug!(connection = %self.connection_name, "connection engine stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.transition(self.state.name(), state);
    }

    /// Install `state` when the previous one was already moved out.
    fn transition(&mut self, from: &'static str, state: ConnectionState) {
        debug!(
            connection = %self.connection_name,
            from,
            to = state.name(),
            "connection state changed"
        );
        self.state = state;
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // ── Application messages ─────────────────────────────────────────

    fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Connect(reply) => match self.state {
                ConnectionState::Init => {
                    self.connect_waiters.push(reply);
                    info!(connection = %self.connection_name, "connecting");
                    self.start_connecting();
                }
                ConnectionState::Connected { .. } => {
                    let _ = reply.send(Ok(()));
                }
                ConnectionState::Closed => {
                    let _ = reply.send(Err(ClientError::ConnectionClosed("connection is closed".into())));
                }
                _ => self.connect_waiters.push(reply),
            },
            EngineMessage::StartOperation(mut item) => match &mut self.state {
                ConnectionState::Closed => {
                    item.operation.fail(ClientError::ConnectionClosed("connection is closed".into()))
                }
                ConnectionState::Connected { transport, .. } => {
                    self.operations.enqueue(item);
                    self.operations.schedule_waiting(transport, Instant::now());
                }
                _ => self.operations.enqueue(item),
            },
            EngineMessage::StartSubscription(item) => match &mut self.state {
                ConnectionState::Closed => item.drop_with(
                    evstore_core::SubscriptionDropReason::ConnectionClosed,
                    Some(ClientError::ConnectionClosed("connection is closed".into())),
                ),
                ConnectionState::Connected { transport, .. } => {
                    self.subscriptions.enqueue(item);
                    self.subscriptions.schedule_waiting(transport, Instant::now());
                }
                _ => self.subscriptions.enqueue(item),
            },
            EngineMessage::Unsubscribe(id) => match &mut self.state {
                ConnectionState::Connected { transport, .. } => self.subscriptions.unsubscribe(&id, Some(transport)),
                _ => self.subscriptions.unsubscribe(&id, None),
            },
            EngineMessage::SubscriptionPackage(package) => match &self.state {
                ConnectionState::Connected { transport, .. } => {
                    if let Err(e) = transport.send(&package) {
                        debug!(command = %package.command, error = %e, "subscription package not sent");
                    }
                }
                _ => debug!(command = %package.command, "not connected, subscription package dropped"),
            },
            EngineMessage::Close { reason, reply } => {
                self.close(&reason);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    // ── Connecting ───────────────────────────────────────────────────

    fn start_connecting(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;

        if let Some(node) = self.redirect.take() {
            if let Some(endpoint) = node.select(self.settings.use_tls).cloned() {
                info!(%endpoint, "connecting to announced leader");
                self.establish(endpoint);
                return;
            }
        }

        self.set_state(ConnectionState::Connecting(ConnectPhase::Discovering));
        let discoverer = self.discoverer.clone();
        let failed = self.last_endpoint.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = discoverer.discover(failed).await;
            let _ = tx.send(Internal::Discovered { attempt, result });
        });
    }

    fn establish(&mut self, endpoint: EndPoint) {
        self.set_state(ConnectionState::Connecting(ConnectPhase::Establishing {
            endpoint: endpoint.clone(),
        }));
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let attempt = self.attempt;
        let settings = self.transport_settings.clone();
        let events = self.transport_tx.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = Transport::connect(conn_id, endpoint.clone(), &settings, events).await;
            let _ = tx.send(Internal::Established {
                attempt,
                endpoint,
                result,
            });
        });
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Discovered { attempt, result } => {
                if attempt != self.attempt
                    || !matches!(self.state, ConnectionState::Connecting(ConnectPhase::Discovering))
                {
                    return;
                }
                let use_tls = self.settings.use_tls;
                match result {
                    Ok(nodes) => match nodes.iter().find_map(|n| n.select(use_tls).cloned()) {
                        Some(endpoint) => {
                            debug!(%endpoint, candidates = nodes.len(), "endpoint discovered");
                            self.establish(endpoint);
                        }
                        None => {
                            warn!("discovery returned no usable endpoint");
                            self.close("no usable endpoint discovered");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "endpoint discovery failed");
                        self.close(&format!("endpoint discovery failed: {e}"));
                    }
                }
            }
            Internal::Established {
                attempt,
                endpoint,
                result,
            } => {
                let current = attempt == self.attempt
                    && matches!(
                        &self.state,
                        ConnectionState::Connecting(ConnectPhase::Establishing { endpoint: pending })
                            if *pending == endpoint
                    );
                match result {
                    Ok(transport) if current => self.authenticate(transport),
                    Ok(transport) => transport.close(),
                    Err(e) if current => {
                        warn!(%endpoint, error = %e, "connection attempt failed");
                        self.emit(ConnectionEvent::ErrorOccurred {
                            message: e.to_string(),
                        });
                        self.schedule_reconnect();
                    }
                    Err(_) => {}
                }
            }
        }
    }

    /// Send `package` as the next handshake step. On failure the transport
    /// is closed and a reconnect scheduled.
    fn send_handshake(&mut self, transport: Transport, package: Package) -> Option<Handshake> {
        if let Err(e) = transport.send(&package) {
            warn!(endpoint = %transport.endpoint(), command = %package.command, error = %e, "handshake failed");
            transport.close();
            self.schedule_reconnect();
            return None;
        }
        Some(Handshake {
            transport,
            correlation_id: package.correlation_id,
            deadline: Instant::now() + self.settings.client_connection_timeout,
        })
    }

    fn authenticate(&mut self, transport: Transport) {
        let Some(credentials) = self.settings.default_credentials.clone() else {
            let from = self.state.name();
            self.identify(from, transport);
            return;
        };
        debug!(endpoint = %transport.endpoint(), user = %credentials.username, "authenticating");
        let package = Package::new(Command::Authenticate, Uuid::new_v4(), bytes::Bytes::new())
            .with_credentials(Some(credentials));
        if let Some(handshake) = self.send_handshake(transport, package) {
            self.set_state(ConnectionState::Connecting(ConnectPhase::Authenticating(handshake)));
        }
    }

    /// Leave `Authenticating` for `Identifying`, whatever the outcome.
    fn on_authenticated(&mut self, outcome: Result<(), String>) {
        let handshake = match std::mem::replace(&mut self.state, ConnectionState::Init) {
            ConnectionState::Connecting(ConnectPhase::Authenticating(handshake)) => handshake,
            other => {
                self.state = other;
                return;
            }
        };
        match outcome {
            Ok(()) => debug!(endpoint = %handshake.transport.endpoint(), "authenticated"),
            Err(reason) => {
                warn!(endpoint = %handshake.transport.endpoint(), %reason, "authentication failed, continuing unauthenticated");
                self.emit(ConnectionEvent::AuthenticationFailed { reason });
            }
        }
        self.identify("authenticating", handshake.transport);
    }

    fn identify(&mut self, from: &'static str, transport: Transport) {
        let package = Package::from_message(
            Command::IdentifyClient,
            Uuid::new_v4(),
            &IdentifyClient {
                version: CLIENT_VERSION,
                connection_name: Some(self.connection_name.clone()),
            },
        );
        if let Some(handshake) = self.send_handshake(transport, package) {
            self.transition(from, ConnectionState::Connecting(ConnectPhase::Identifying(handshake)));
        }
    }

    fn on_identified(&mut self) {
        let mut transport = match std::mem::replace(&mut self.state, ConnectionState::Init) {
            ConnectionState::Connecting(ConnectPhase::Identifying(handshake)) => handshake.transport,
            other => {
                self.state = other;
                return;
            }
        };
        let now = Instant::now();
        let endpoint = transport.endpoint().clone();
        info!(%endpoint, connection = %self.connection_name, "connected");

        self.reconnection.on_connected();
        self.last_endpoint = Some(endpoint.clone());
        self.operations.process_retries();
        self.operations.schedule_waiting(&mut transport, now);
        self.subscriptions.schedule_waiting(&mut transport, now);

        let heartbeat = HeartbeatMonitor::new(
            self.settings.heartbeat_interval,
            self.settings.heartbeat_timeout,
            now,
        );
        self.transition("identifying", ConnectionState::Connected { transport, heartbeat });
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.emit(ConnectionEvent::Connected { endpoint });
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnection.on_failure() {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(attempt, ?delay, "reconnecting");
                self.set_state(ConnectionState::Reconnecting {
                    retry_at: Instant::now() + delay,
                });
                self.emit(ConnectionEvent::Reconnecting { attempt });
            }
            ReconnectDecision::GiveUp { attempts } => {
                self.close(&format!("reconnection limit reached after {attempts} attempts"));
            }
        }
    }

    /// Tear down the live transport and hand its work back for replay.
    fn drop_transport(&mut self, reason: &str) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Init);
        match state {
            ConnectionState::Connected { transport, .. } => {
                let endpoint = transport.endpoint().clone();
                transport.close();
                warn!(%endpoint, %reason, "connection lost");
                self.emit(ConnectionEvent::Disconnected { endpoint });
            }
            ConnectionState::Connecting(
                ConnectPhase::Authenticating(handshake) | ConnectPhase::Identifying(handshake),
            ) => handshake.transport.close(),
            other => {
                self.state = other;
                return;
            }
        }
        self.operations.on_transport_lost(reason);
        self.subscriptions.on_transport_lost(reason);
    }

    fn on_transport_lost(&mut self, reason: &str) {
        self.drop_transport(reason);
        self.schedule_reconnect();
    }

    /// Switch to the node named by a `NotMaster` reply.
    fn reconnect_to(&mut self, node: NodeEndpoints) {
        info!(leader = %node, "reconnecting to leader");
        self.redirect = Some(node);
        self.drop_transport("redirected to leader");
        self.start_connecting();
    }

    // ── Transport traffic ────────────────────────────────────────────

    fn current_conn_id(&self) -> Option<u64> {
        match &self.state {
            ConnectionState::Connected { transport, .. }
            | ConnectionState::Connecting(
                ConnectPhase::Authenticating(Handshake { transport, .. })
                | ConnectPhase::Identifying(Handshake { transport, .. }),
            ) => Some(transport.conn_id()),
            _ => None,
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Package { conn_id, package } => {
                if self.current_conn_id() != Some(conn_id) {
                    debug!(conn_id, command = %package.command, "package from stale connection ignored");
                    return;
                }
                self.handle_package(package);
            }
            TransportEvent::Closed { conn_id, error } => {
                if self.current_conn_id() != Some(conn_id) {
                    return;
                }
                let reason = error.unwrap_or_else(|| "connection closed by server".into());
                if matches!(self.state, ConnectionState::Connecting(_)) {
                    warn!(%reason, "connection lost during handshake");
                    self.drop_transport(&reason);
                    self.schedule_reconnect();
                } else {
                    self.on_transport_lost(&reason);
                }
            }
        }
    }

    fn handle_package(&mut self, package: Package) {
        let now = Instant::now();

        // Liveness traffic is answered in every phase that has a transport.
        match &mut self.state {
            ConnectionState::Connected { transport, heartbeat } => {
                heartbeat.on_package(now);
                if answer_liveness(transport, &package) {
                    return;
                }
            }
            ConnectionState::Connecting(ConnectPhase::Authenticating(handshake)) => {
                if answer_liveness(&handshake.transport, &package) {
                    return;
                }
                let reply_to_us = package.correlation_id == handshake.correlation_id;
                match package.command {
                    Command::Authenticated if reply_to_us => self.on_authenticated(Ok(())),
                    Command::NotAuthenticated if reply_to_us => {
                        self.on_authenticated(Err(payload_text(&package, "not authenticated")))
                    }
                    _ => debug!(command = %package.command, "package before authentication completed ignored"),
                }
                return;
            }
            ConnectionState::Connecting(ConnectPhase::Identifying(handshake)) => {
                if answer_liveness(&handshake.transport, &package) {
                    return;
                }
                if package.command == Command::ClientIdentified && package.correlation_id == handshake.correlation_id {
                    self.on_identified();
                } else {
                    debug!(command = %package.command, "package before handshake completed ignored");
                }
                return;
            }
            _ => return,
        }

        let id = package.correlation_id;
        if let Some(mut item) = self.operations.take_active(&id) {
            match item.operation.inspect(package) {
                InspectionDecision::EndOperation => {}
                InspectionDecision::Retry => self.operations.schedule_retry(item),
                InspectionDecision::Reconnect(node) => {
                    self.operations.schedule_retry(item);
                    self.reconnect_to(node);
                    return;
                }
            }
            if let ConnectionState::Connected { transport, .. } = &mut self.state {
                self.operations.schedule_waiting(transport, now);
            }
        } else if self.subscriptions.contains(&id) {
            let ConnectionState::Connected { transport, .. } = &mut self.state else {
                return;
            };
            let use_tls = self.settings.use_tls;
            if let SubscriptionAction::Reconnect(node) = self.subscriptions.handle_package(package, use_tls, transport) {
                self.reconnect_to(node);
            }
        } else {
            debug!(correlation_id = %id, command = %package.command, "package for unknown correlation id");
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn on_tick(&mut self, now: Instant) {
        match &mut self.state {
            ConnectionState::Reconnecting { retry_at } if now >= *retry_at => {
                self.start_connecting();
            }
            ConnectionState::Connecting(ConnectPhase::Authenticating(handshake)) if now >= handshake.deadline => {
                self.on_authenticated(Err("authentication timed out".into()));
            }
            ConnectionState::Connecting(ConnectPhase::Identifying(handshake)) if now >= handshake.deadline => {
                warn!("handshake timed out");
                self.emit(ConnectionEvent::ErrorOccurred {
                    message: "handshake timed out".into(),
                });
                self.drop_transport("handshake timed out");
                self.schedule_reconnect();
            }
            ConnectionState::Connected { transport, heartbeat } => match heartbeat.check(now) {
                HeartbeatAction::Idle => {}
                HeartbeatAction::SendRequest(id) => {
                    let request = Package::new(Command::HeartbeatRequest, id, bytes::Bytes::new());
                    if let Err(e) = transport.send(&request) {
                        debug!(error = %e, "heartbeat request not sent");
                    }
                }
                HeartbeatAction::TimedOut => {
                    self.on_transport_lost("heartbeat timeout");
                }
            },
            _ => {}
        }

        if now.saturating_duration_since(self.last_timeout_check) >= self.settings.operation_timeout_check_period {
            self.last_timeout_check = now;
            let fail = self.settings.fail_on_no_server_response;
            match &mut self.state {
                ConnectionState::Connected { transport, .. } => {
                    self.operations.check_timeouts_and_retries(Some(transport), now, fail);
                    self.subscriptions.check_timeouts(now, fail);
                    self.subscriptions.schedule_waiting(transport, now);
                }
                ConnectionState::Closed => {}
                _ => self.operations.check_timeouts_and_retries(None, now, fail),
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    fn close(&mut self, reason: &str) {
        if matches!(self.state, ConnectionState::Closed) {
            return;
        }
        let previous = std::mem::replace(&mut self.state, ConnectionState::Init);
        let from = previous.name();
        match previous {
            ConnectionState::Connected { transport, .. }
            | ConnectionState::Connecting(
                ConnectPhase::Authenticating(Handshake { transport, .. })
                | ConnectPhase::Identifying(Handshake { transport, .. }),
            ) => transport.close(),
            _ => {}
        }
        self.transition(from, ConnectionState::Closed);
        self.open.store(false, Ordering::Release);
        info!(
            connection = %self.connection_name,
            %reason,
            pending_operations = self.operations.total_count(),
            subscriptions = self.subscriptions.count(),
            "connection closed"
        );

        let error = ClientError::ConnectionClosed(reason.to_string());
        self.operations.cleanup(&error);
        self.subscriptions.cleanup(&error);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.emit(ConnectionEvent::Closed {
            reason: reason.to_string(),
        });
    }
}

/// Answer server heartbeats and pings. Returns whether `package` was one.
fn answer_liveness(transport: &Transport, package: &Package) -> bool {
    let reply = match package.command {
        Command::HeartbeatRequest => Command::HeartbeatResponse,
        Command::Ping => Command::Pong,
        Command::HeartbeatResponse | Command::Pong => return true,
        _ => return false,
    };
    let response = Package::new(reply, package.correlation_id, bytes::Bytes::new());
    if let Err(e) = transport.send(&response) {
        debug!(error = %e, "liveness reply not sent");
    }
    true
}
