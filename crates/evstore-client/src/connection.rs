//! Public connection facade.
//!
//! [`Connection`] is a cheap, cloneable handle to one engine task. Every
//! clone shares the same socket, operation queue and subscriptions.

use std::sync::Arc;

use evstore_core::metadata::metastream_of;
use evstore_core::{
    AllEventsSlice, CatchUpSubscriptionSettings, ConnectionSettings, DeleteResult, EventData,
    EventReadResult, EventReadStatus, ExpectedVersion, PersistentSubscriptionSettings, Position,
    ReadDirection, StreamEventsSlice, StreamMetadata, StreamMetadataResult, UserCredentials,
    WriteResult,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::discovery::{ClusterEndpointDiscoverer, EndpointDiscoverer, StaticEndpointDiscoverer};
use crate::engine::{Engine, EngineHandle};
use crate::error::{ClientError, ClientResult};
use crate::events::{ConnectionEvent, EVENT_CAPACITY};
use crate::operations::kinds::{
    AppendToStream, CreatePersistentSubscription, DeletePersistentSubscription, DeleteStream,
    ReadAllEvents, ReadEvent, ReadStreamEvents, UpdatePersistentSubscription,
};
use crate::subscriptions::{
    ALL_STREAM, CatchUpSubscription, CatchUpTarget, EventHandler, PersistentEventHandler,
    PersistentSubscription, VolatileSubscription, catchup, persistent, volatile,
};

/// Event type of metadata records in a metastream.
const METADATA_EVENT_TYPE: &str = "$metadata";

/// A client connection to an evstore node or cluster.
///
/// Created in the `Init` state; call [`Connection::connect`] before
/// issuing operations.
#[derive(Clone)]
pub struct Connection {
    engine: EngineHandle,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    /// Spawn the connection engine using `discoverer` to find nodes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: ConnectionSettings, discoverer: Arc<dyn EndpointDiscoverer>) -> ClientResult<Self> {
        settings.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = Engine::spawn(settings, discoverer, events.clone())?;
        Ok(Self { engine, events })
    }

    /// Build a connection whose discoverer follows `settings`: gossip when
    /// a `gossip` section is present, the static endpoint otherwise.
    pub fn from_settings(settings: ConnectionSettings) -> ClientResult<Self> {
        let discoverer: Arc<dyn EndpointDiscoverer> = match (&settings.gossip, &settings.endpoint) {
            (Some(gossip), _) => Arc::new(ClusterEndpointDiscoverer::new(gossip.clone())),
            (None, Some(endpoint)) => Arc::new(StaticEndpointDiscoverer::new(endpoint.clone(), settings.use_tls)),
            (None, None) => {
                return Err(ClientError::Config("either endpoint or gossip must be set".into()));
            }
        };
        Self::new(settings, discoverer)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        self.engine.settings()
    }

    /// Subscribe to lifecycle notifications. Only events emitted after
    /// this call are received.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Start connecting and wait for the handshake to complete.
    ///
    /// Fails with the terminal error if discovery or every reconnection
    /// attempt fails. Calling it on an already connected connection
    /// returns immediately.
    pub async fn connect(&self) -> ClientResult<()> {
        self.engine.connect().await
    }

    /// Close the connection. Pending operations and subscriptions fail
    /// with `ConnectionClosed`; later calls fail immediately.
    pub async fn close(&self) {
        self.engine.close("closed by the application").await;
    }

    pub fn is_closed(&self) -> bool {
        !self.engine.is_open()
    }

    fn require_master(&self) -> bool {
        self.engine.settings().require_master
    }

    // ── Streams ──────────────────────────────────────────────────────

    pub async fn append_to_stream(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<WriteResult> {
        let kind = AppendToStream {
            stream: non_empty(stream.into())?,
            expected_version,
            events,
            require_master: self.require_master(),
        };
        self.engine.execute(kind, credentials).await
    }

    /// Delete a stream. A hard delete makes the stream name unusable.
    ///
    /// Not replayed after a connection loss; a lost request fails with
    /// `ConnectionClosed` and the caller decides whether to retry.
    pub async fn delete_stream(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
        hard_delete: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<DeleteResult> {
        let kind = DeleteStream {
            stream: non_empty(stream.into())?,
            expected_version,
            hard_delete,
            require_master: self.require_master(),
        };
        self.engine.execute(kind, credentials).await
    }

    /// Read a single event. `event_number` -1 reads the last event.
    pub async fn read_event(
        &self,
        stream: impl Into<String>,
        event_number: i64,
        resolve_link_tos: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<EventReadResult> {
        if event_number < -1 {
            return Err(ClientError::InvalidOperation(format!(
                "event number must be -1 or greater, got {event_number}"
            )));
        }
        let kind = ReadEvent {
            stream: non_empty(stream.into())?,
            event_number,
            resolve_link_tos,
            require_master: self.require_master(),
        };
        self.engine.execute(kind, credentials).await
    }

    pub async fn read_stream_events_forward(
        &self,
        stream: impl Into<String>,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<StreamEventsSlice> {
        if start < 0 {
            return Err(ClientError::InvalidOperation(format!("start must be non-negative, got {start}")));
        }
        self.read_stream(stream.into(), start, count, resolve_link_tos, ReadDirection::Forward, credentials)
            .await
    }

    /// `start` -1 reads from the end of the stream.
    pub async fn read_stream_events_backward(
        &self,
        stream: impl Into<String>,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<StreamEventsSlice> {
        self.read_stream(stream.into(), start, count, resolve_link_tos, ReadDirection::Backward, credentials)
            .await
    }

    async fn read_stream(
        &self,
        stream: String,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
        direction: ReadDirection,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<StreamEventsSlice> {
        let kind = ReadStreamEvents {
            stream: non_empty(stream)?,
            from_event_number: start,
            max_count: positive_count(count)?,
            resolve_link_tos,
            require_master: self.require_master(),
            direction,
        };
        self.engine.execute(kind, credentials).await
    }

    pub async fn read_all_events_forward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<AllEventsSlice> {
        self.read_all(position, max_count, resolve_link_tos, ReadDirection::Forward, credentials)
            .await
    }

    pub async fn read_all_events_backward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<AllEventsSlice> {
        self.read_all(position, max_count, resolve_link_tos, ReadDirection::Backward, credentials)
            .await
    }

    async fn read_all(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        direction: ReadDirection,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<AllEventsSlice> {
        let kind = ReadAllEvents {
            position,
            max_count: positive_count(max_count)?,
            resolve_link_tos,
            require_master: self.require_master(),
            direction,
        };
        self.engine.execute(kind, credentials).await
    }

    // ── Metadata ─────────────────────────────────────────────────────

    /// Read the latest metadata record of `stream`.
    pub async fn get_stream_metadata(
        &self,
        stream: impl Into<String>,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<StreamMetadataResult> {
        let stream = non_empty(stream.into())?;
        let read = self
            .read_event(metastream_of(&stream), -1, false, credentials)
            .await?;
        let mut result = StreamMetadataResult {
            stream,
            is_stream_deleted: false,
            metastream_version: -1,
            metadata: StreamMetadata::default(),
        };
        match read.status {
            EventReadStatus::Success => {
                let Some(event) = read.event.as_ref().and_then(|e| e.original_event()) else {
                    return Err(ClientError::Protocol("metadata read succeeded without an event".into()));
                };
                result.metastream_version = event.event_number;
                if !event.data.is_empty() {
                    result.metadata = serde_json::from_slice(&event.data)?;
                }
            }
            EventReadStatus::NotFound | EventReadStatus::NoStream => {}
            EventReadStatus::StreamDeleted => result.is_stream_deleted = true,
        }
        Ok(result)
    }

    /// Replace the metadata of `stream`. `expected_version` applies to the
    /// metastream.
    pub async fn set_stream_metadata(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
        metadata: &StreamMetadata,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<WriteResult> {
        let stream = non_empty(stream.into())?;
        if stream.starts_with("$$") {
            return Err(ClientError::InvalidOperation(format!(
                "cannot set metadata on metastream {stream}"
            )));
        }
        let event = EventData::json(METADATA_EVENT_TYPE, metadata)?;
        self.append_to_stream(metastream_of(&stream), expected_version, vec![event], credentials)
            .await
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Live events of `stream` from now on.
    pub async fn subscribe_to_stream<H: EventHandler>(
        &self,
        stream: impl Into<String>,
        resolve_link_tos: bool,
        handler: H,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<VolatileSubscription> {
        let stream = non_empty(stream.into())?;
        self.subscribe_volatile(stream, resolve_link_tos, handler, credentials).await
    }

    /// Live events of every stream from now on.
    pub async fn subscribe_to_all<H: EventHandler>(
        &self,
        resolve_link_tos: bool,
        handler: H,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<VolatileSubscription> {
        self.subscribe_volatile(ALL_STREAM.to_string(), resolve_link_tos, handler, credentials)
            .await
    }

    async fn subscribe_volatile<H: EventHandler>(
        &self,
        stream: String,
        resolve_link_tos: bool,
        handler: H,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<VolatileSubscription> {
        let max_queue = CatchUpSubscriptionSettings::default().max_live_queue_size;
        volatile::subscribe(
            self.engine.clone(),
            stream,
            resolve_link_tos,
            credentials,
            max_queue,
            handler,
        )
        .await
    }

    /// History of `stream` after `last_checkpoint`, then live events.
    pub fn subscribe_to_stream_from<H: EventHandler>(
        &self,
        stream: impl Into<String>,
        last_checkpoint: Option<i64>,
        settings: CatchUpSubscriptionSettings,
        handler: H,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<CatchUpSubscription> {
        let target = CatchUpTarget::Stream {
            stream: non_empty(stream.into())?,
            last_checkpoint,
        };
        self.subscribe_from(target, settings, handler, credentials)
    }

    /// History of every stream after `last_checkpoint`, then live events.
    pub fn subscribe_to_all_from<H: EventHandler>(
        &self,
        last_checkpoint: Option<Position>,
        settings: CatchUpSubscriptionSettings,
        handler: H,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<CatchUpSubscription> {
        self.subscribe_from(CatchUpTarget::All { last_checkpoint }, settings, handler, credentials)
    }

    fn subscribe_from<H: EventHandler>(
        &self,
        target: CatchUpTarget,
        settings: CatchUpSubscriptionSettings,
        handler: H,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<CatchUpSubscription> {
        if !self.engine.is_open() {
            return Err(ClientError::ConnectionClosed("connection is closed".into()));
        }
        positive_count(settings.read_batch_size)?;
        let credentials = credentials.or_else(|| self.engine.settings().default_credentials.clone());
        Ok(catchup::start(self.engine.clone(), target, settings, credentials, handler))
    }

    /// Join `group` on `stream` as a competing consumer.
    pub async fn connect_to_persistent_subscription<H: PersistentEventHandler>(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        handler: H,
        buffer_size: usize,
        auto_ack: bool,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<PersistentSubscription> {
        let stream = non_empty(stream.into())?;
        let group = non_empty(group.into())?;
        if buffer_size == 0 {
            return Err(ClientError::InvalidOperation("buffer size must be positive".into()));
        }
        let credentials = credentials.or_else(|| self.engine.settings().default_credentials.clone());
        persistent::connect(self.engine.clone(), group, stream, buffer_size, auto_ack, credentials, handler).await
    }

    pub async fn create_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        settings: PersistentSubscriptionSettings,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<()> {
        let kind = CreatePersistentSubscription {
            group: non_empty(group.into())?,
            stream: non_empty(stream.into())?,
            settings,
        };
        debug!(group = %kind.group, stream = %kind.stream, "creating persistent subscription");
        self.engine.execute(kind, credentials).await
    }

    pub async fn update_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        settings: PersistentSubscriptionSettings,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<()> {
        let kind = UpdatePersistentSubscription {
            group: non_empty(group.into())?,
            stream: non_empty(stream.into())?,
            settings,
        };
        self.engine.execute(kind, credentials).await
    }

    pub async fn delete_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        credentials: Option<UserCredentials>,
    ) -> ClientResult<()> {
        let kind = DeletePersistentSubscription {
            group: non_empty(group.into())?,
            stream: non_empty(stream.into())?,
        };
        self.engine.execute(kind, credentials).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_name", &self.engine.settings().connection_name)
            .field("open", &self.engine.is_open())
            .finish()
    }
}

fn non_empty(value: String) -> ClientResult<String> {
    if value.is_empty() {
        Err(ClientError::InvalidOperation("stream and group names must not be empty".into()))
    } else {
        Ok(value)
    }
}

fn positive_count(count: i32) -> ClientResult<i32> {
    if count <= 0 {
        Err(ClientError::InvalidOperation(format!("count must be positive, got {count}")))
    } else {
        Ok(count)
    }
}
