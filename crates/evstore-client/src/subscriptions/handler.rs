//! Application-facing subscription traits and the contexts handed to them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evstore_core::{ResolvedEvent, SubscriptionDropReason};
use evstore_proto::messages::{self, NakAction};
use evstore_proto::{Command, Package, UserCredentials};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::ALL_STREAM;
use crate::engine::EngineHandle;
use crate::error::{ClientError, ClientResult};

/// Receives events from a volatile or catch-up subscription.
///
/// Calls are serialized: the next event is not delivered until the future
/// returned for the previous one completes. Returning `Err` drops the
/// subscription with [`SubscriptionDropReason::EventHandlerException`].
pub trait EventHandler: Send + 'static {
    fn event_appeared(
        &mut self,
        ctx: &SubscriptionContext,
        event: ResolvedEvent,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// A catch-up subscription finished reading history and is now
    /// processing live events. Called at most once.
    fn live_processing_started(&mut self, _ctx: &SubscriptionContext) {}

    /// Called exactly once, after the last event.
    fn dropped(
        &mut self,
        _ctx: &SubscriptionContext,
        _reason: SubscriptionDropReason,
        _error: Option<anyhow::Error>,
    ) {
    }
}

/// Receives events from a persistent subscription.
pub trait PersistentEventHandler: Send + 'static {
    /// `retry_count` is how often the server already delivered this event
    /// to the group.
    fn event_appeared(
        &mut self,
        ctx: &PersistentSubscriptionContext,
        event: ResolvedEvent,
        retry_count: Option<i32>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn dropped(
        &mut self,
        _ctx: &PersistentSubscriptionContext,
        _reason: SubscriptionDropReason,
        _error: Option<anyhow::Error>,
    ) {
    }
}

/// Handed to [`EventHandler`] calls.
#[derive(Debug, Clone)]
pub struct SubscriptionContext {
    stream: String,
    stop: Arc<watch::Sender<bool>>,
}

impl SubscriptionContext {
    pub(crate) fn new(stream: String, stop: Arc<watch::Sender<bool>>) -> Self {
        Self { stream, stop }
    }

    /// Empty for subscriptions to `$all`.
    pub fn stream_id(&self) -> &str {
        &self.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.stream == ALL_STREAM
    }

    /// Ask the subscription to stop after the current event.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }
}

// ── Persistent context ───────────────────────────────────────────────

/// Events delivered to the handler and not yet acknowledged.
#[derive(Debug)]
pub(crate) struct InFlightTracker {
    capacity: usize,
    in_flight: HashSet<Uuid>,
}

impl InFlightTracker {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_flight: HashSet::new(),
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.capacity
    }

    pub(crate) fn track(&mut self, id: Uuid) {
        self.in_flight.insert(id);
    }

    pub(crate) fn release(&mut self, id: &Uuid) -> bool {
        self.in_flight.remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.in_flight.len()
    }
}

struct PersistentShared {
    engine: EngineHandle,
    group: String,
    stream: String,
    subscription_id: String,
    correlation_id: Uuid,
    credentials: Option<UserCredentials>,
    tracker: Mutex<InFlightTracker>,
    capacity_freed: Notify,
    stop: Arc<watch::Sender<bool>>,
}

/// Handed to [`PersistentEventHandler`] calls; also usable from outside
/// the handler to acknowledge events later.
#[derive(Clone)]
pub struct PersistentSubscriptionContext {
    inner: Arc<PersistentShared>,
}

impl std::fmt::Debug for PersistentSubscriptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSubscriptionContext")
            .field("group", &self.inner.group)
            .field("stream", &self.inner.stream)
            .field("subscription_id", &self.inner.subscription_id)
            .finish()
    }
}

impl PersistentSubscriptionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: EngineHandle,
        group: String,
        stream: String,
        subscription_id: String,
        correlation_id: Uuid,
        credentials: Option<UserCredentials>,
        buffer_size: usize,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            inner: Arc::new(PersistentShared {
                engine,
                group,
                stream,
                subscription_id,
                correlation_id,
                credentials,
                tracker: Mutex::new(InFlightTracker::new(buffer_size)),
                capacity_freed: Notify::new(),
                stop,
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream
    }

    /// Server-assigned id of this group connection.
    pub fn subscription_id(&self) -> &str {
        &self.inner.subscription_id
    }

    pub fn request_stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Mark an event as processed.
    pub fn acknowledge(&self, event: &ResolvedEvent) -> ClientResult<()> {
        self.acknowledge_many(std::slice::from_ref(event))
    }

    pub fn acknowledge_many(&self, events: &[ResolvedEvent]) -> ClientResult<()> {
        let ids = self.release(events);
        if ids.is_empty() {
            return Ok(());
        }
        let message = messages::PersistentSubscriptionAckEvents {
            subscription_id: self.inner.subscription_id.clone(),
            processed_event_ids: ids.iter().map(|id| id.to_bytes_le().to_vec()).collect(),
        };
        self.send(Package::from_message(
            Command::PersistentSubscriptionAckEvents,
            self.inner.correlation_id,
            &message,
        ))
    }

    /// Report that an event could not be processed, and what the server
    /// should do with it.
    pub fn fail(&self, event: &ResolvedEvent, action: NakAction, reason: &str) -> ClientResult<()> {
        self.fail_many(std::slice::from_ref(event), action, reason)
    }

    pub fn fail_many(&self, events: &[ResolvedEvent], action: NakAction, reason: &str) -> ClientResult<()> {
        let ids = self.release(events);
        if ids.is_empty() {
            return Ok(());
        }
        let message = messages::PersistentSubscriptionNakEvents {
            subscription_id: self.inner.subscription_id.clone(),
            processed_event_ids: ids.iter().map(|id| id.to_bytes_le().to_vec()).collect(),
            message: Some(reason.to_string()),
            action: action as i32,
        };
        self.send(Package::from_message(
            Command::PersistentSubscriptionNakEvents,
            self.inner.correlation_id,
            &message,
        ))
    }

    /// Ids to report: always the id of the record that was in the
    /// subscribed stream, which is the link when links were resolved.
    fn release(&self, events: &[ResolvedEvent]) -> Vec<Uuid> {
        let ids: Vec<Uuid> = events
            .iter()
            .filter_map(|e| e.original_event().map(|r| r.event_id))
            .collect();
        if let Ok(mut tracker) = self.inner.tracker.lock() {
            for id in &ids {
                tracker.release(id);
            }
        }
        self.inner.capacity_freed.notify_one();
        ids
    }

    fn send(&self, package: Package) -> ClientResult<()> {
        let package = package.with_credentials(self.inner.credentials.clone());
        self.inner.engine.send_subscription_package(package)
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.inner.tracker.lock().map(|t| t.has_capacity()).unwrap_or(true)
    }

    pub(crate) fn track(&self, event: &ResolvedEvent) {
        if let Some(id) = event.original_event().map(|r| r.event_id) {
            if let Ok(mut tracker) = self.inner.tracker.lock() {
                tracker.track(id);
            }
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.tracker.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub(crate) async fn capacity_freed(&self) {
        self.inner.capacity_freed.notified().await;
    }
}

// ── Task handle ──────────────────────────────────────────────────────

/// Stop and abort controls shared by every subscription kind.
///
/// Tasks race their delivery loop against `abort`; the loop owns no state
/// that outlives it, so cancelling it leaves the handler ready for its
/// `dropped` call.
pub(crate) struct TaskHandle {
    engine: EngineHandle,
    stop: Arc<watch::Sender<bool>>,
    abort: Arc<Notify>,
    current: Arc<Mutex<Option<Uuid>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub(crate) fn new(
        engine: EngineHandle,
        stop: Arc<watch::Sender<bool>>,
        abort: Arc<Notify>,
        current: Arc<Mutex<Option<Uuid>>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            engine,
            stop,
            abort,
            current,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask the task to stop and wait for it to report the drop.
    pub(crate) async fn stop(&self, timeout: Duration) -> ClientResult<()> {
        self.stop.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        let Some(task) = task else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, task).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ClientError::OperationTimedOut {
                operation: "StopSubscription",
                elapsed: timeout,
            }),
        }
    }

    /// Stop without waiting for the handler. A handler call in progress is
    /// cancelled and queued events are discarded; the drop callback still
    /// runs once, with `UserInitiated`.
    pub(crate) fn abort(&self) {
        self.stop.send_replace(true);
        // Stores a permit when the task is not waiting yet.
        self.abort.notify_one();
        if let Some(id) = self.current.lock().ok().and_then(|mut c| c.take()) {
            debug!(correlation_id = %id, "subscription aborted");
            self.engine.unsubscribe(id);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}
