//! Push subscriptions.
//!
//! Two halves meet over a per-subscription channel:
//!
//! - [`SubscriptionsManager`] lives inside the engine. It owns the wire
//!   state of every subscription (sent, confirmed, retried) and turns
//!   server packages into [`SubscriptionSignal`]s.
//! - A per-subscription task ([`volatile`], [`catchup`], [`persistent`])
//!   consumes those signals and drives the application's handler.
//!
//! Each signal channel carries at most one `Dropped`, always last.

pub(crate) mod catchup;
pub(crate) mod handler;
pub(crate) mod persistent;
pub(crate) mod volatile;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use evstore_core::{ResolvedEvent, SubscriptionDropReason};
use evstore_proto::messages::{self, DroppedReason};
use evstore_proto::{Command, Package, UserCredentials};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::NodeEndpoints;
use crate::error::ClientError;
use crate::operations::{InspectionDecision, PackageSink, inspect_not_handled, payload_text};

pub use catchup::{CatchUpSubscription, CatchUpTarget};
pub use handler::{
    EventHandler, PersistentEventHandler, PersistentSubscriptionContext, SubscriptionContext,
};
pub use persistent::PersistentSubscription;
pub use volatile::VolatileSubscription;

/// Stream name the server uses for a subscription to `$all`.
pub(crate) const ALL_STREAM: &str = "";

/// Engine to subscription task.
#[derive(Debug)]
pub(crate) enum SubscriptionSignal {
    Confirmed {
        last_commit_position: i64,
        last_event_number: Option<i64>,
        subscription_id: Option<String>,
    },
    Event {
        event: ResolvedEvent,
        retry_count: Option<i32>,
    },
    Dropped {
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum SubscriptionRequest {
    Volatile {
        stream: String,
        resolve_link_tos: bool,
    },
    Persistent {
        group: String,
        stream: String,
        allowed_in_flight: i32,
    },
}

impl SubscriptionRequest {
    fn name(&self) -> &'static str {
        match self {
            SubscriptionRequest::Volatile { .. } => "SubscribeToStream",
            SubscriptionRequest::Persistent { .. } => "ConnectToPersistentSubscription",
        }
    }

    fn stream(&self) -> &str {
        match self {
            SubscriptionRequest::Volatile { stream, .. } | SubscriptionRequest::Persistent { stream, .. } => stream,
        }
    }

    fn package(&self, correlation_id: Uuid, credentials: Option<UserCredentials>) -> Package {
        let package = match self {
            SubscriptionRequest::Volatile {
                stream,
                resolve_link_tos,
            } => Package::from_message(
                Command::SubscribeToStream,
                correlation_id,
                &messages::SubscribeToStream {
                    event_stream_id: stream.clone(),
                    resolve_link_tos: *resolve_link_tos,
                },
            ),
            SubscriptionRequest::Persistent {
                group,
                stream,
                allowed_in_flight,
            } => Package::from_message(
                Command::ConnectToPersistentSubscription,
                correlation_id,
                &messages::ConnectToPersistentSubscription {
                    subscription_id: group.clone(),
                    event_stream_id: stream.clone(),
                    allowed_in_flight_messages: *allowed_in_flight,
                },
            ),
        };
        package.with_credentials(credentials)
    }
}

/// Engine-side record of one subscription.
pub(crate) struct SubscriptionItem {
    pub(crate) correlation_id: Uuid,
    request: SubscriptionRequest,
    credentials: Option<UserCredentials>,
    confirmed: bool,
    retry_count: i32,
    max_retries: i32,
    timeout: Duration,
    last_updated: Instant,
    signals: mpsc::UnboundedSender<SubscriptionSignal>,
    /// Events sent to the task and not yet processed.
    depth: Arc<AtomicUsize>,
    /// Zero means unbounded.
    max_queue: usize,
}

impl SubscriptionItem {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request: SubscriptionRequest,
        credentials: Option<UserCredentials>,
        max_retries: i32,
        timeout: Duration,
        max_queue: usize,
        signals: mpsc::UnboundedSender<SubscriptionSignal>,
        depth: Arc<AtomicUsize>,
        now: Instant,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            request,
            credentials,
            confirmed: false,
            retry_count: 0,
            max_retries,
            timeout,
            last_updated: now,
            signals,
            depth,
            max_queue,
        }
    }

    pub(crate) fn drop_with(self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        info!(
            subscription = self.request.name(),
            stream = %self.request.stream(),
            correlation_id = %self.correlation_id,
            %reason,
            "subscription dropped"
        );
        // The task may already be gone.
        let _ = self.signals.send(SubscriptionSignal::Dropped { reason, error });
    }

    fn unsubscribe_package(&self) -> Package {
        Package::from_message(
            Command::UnsubscribeFromStream,
            self.correlation_id,
            &messages::UnsubscribeFromStream {},
        )
        .with_credentials(self.credentials.clone())
    }
}

/// What the engine must do after a subscription package was handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SubscriptionAction {
    None,
    Reconnect(NodeEndpoints),
}

fn drop_reason(reason: Option<i32>) -> SubscriptionDropReason {
    match reason.map(DroppedReason::try_from) {
        None | Some(Ok(DroppedReason::Unsubscribed)) => SubscriptionDropReason::UserInitiated,
        Some(Ok(DroppedReason::AccessDenied)) => SubscriptionDropReason::AccessDenied,
        Some(Ok(DroppedReason::NotFound)) => SubscriptionDropReason::NotFound,
        Some(Ok(DroppedReason::PersistentSubscriptionDeleted)) => {
            SubscriptionDropReason::PersistentSubscriptionDeleted
        }
        Some(Ok(DroppedReason::SubscriberMaxCountReached)) => SubscriptionDropReason::MaxSubscribersReached,
        Some(Err(_)) => SubscriptionDropReason::Unknown,
    }
}

/// Registry of every live subscription, owned by the engine.
#[derive(Default)]
pub(crate) struct SubscriptionsManager {
    active: HashMap<Uuid, SubscriptionItem>,
    waiting: Vec<SubscriptionItem>,
}

impl SubscriptionsManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, correlation_id: &Uuid) -> bool {
        self.active.contains_key(correlation_id)
    }

    pub(crate) fn count(&self) -> usize {
        self.active.len() + self.waiting.len()
    }

    pub(crate) fn enqueue(&mut self, item: SubscriptionItem) {
        debug!(
            subscription = item.request.name(),
            stream = %item.request.stream(),
            correlation_id = %item.correlation_id,
            "subscription enqueued"
        );
        self.waiting.push(item);
    }

    /// Send every waiting subscription request.
    pub(crate) fn schedule_waiting(&mut self, sink: &mut dyn PackageSink, now: Instant) {
        for mut item in std::mem::take(&mut self.waiting) {
            if item.max_retries >= 0 && item.retry_count > item.max_retries {
                let error = ClientError::RetriesLimitReached {
                    operation: item.request.name(),
                    limit: item.max_retries,
                };
                item.drop_with(SubscriptionDropReason::SubscribingError, Some(error));
                continue;
            }
            let package = item.request.package(item.correlation_id, item.credentials.clone());
            if let Err(e) = package.validate() {
                warn!(
                    subscription = item.request.name(),
                    correlation_id = %item.correlation_id,
                    error = %e,
                    "subscription request cannot be encoded"
                );
                item.drop_with(SubscriptionDropReason::SubscribingError, Some(e.into()));
                continue;
            }
            item.last_updated = now;
            match sink.send_package(&package) {
                Ok(()) => {
                    self.active.insert(item.correlation_id, item);
                }
                Err(_) => self.waiting.push(item),
            }
        }
    }

    /// Route a package addressed to a subscription.
    pub(crate) fn handle_package(
        &mut self,
        package: Package,
        use_tls: bool,
        sink: &mut dyn PackageSink,
    ) -> SubscriptionAction {
        let id = package.correlation_id;
        let Some(item) = self.active.get_mut(&id) else {
            return SubscriptionAction::None;
        };
        item.last_updated = Instant::now();

        match package.command {
            Command::SubscriptionConfirmation => match package.message::<messages::SubscriptionConfirmation>() {
                Ok(confirmation) => {
                    item.confirmed = true;
                    debug!(correlation_id = %id, stream = %item.request.stream(), "subscription confirmed");
                    let _ = item.signals.send(SubscriptionSignal::Confirmed {
                        last_commit_position: confirmation.last_commit_position,
                        last_event_number: confirmation.last_event_number,
                        subscription_id: None,
                    });
                }
                Err(e) => self.drop_item(&id, SubscriptionDropReason::ServerError, Some(e.into())),
            },
            Command::PersistentSubscriptionConfirmation => {
                match package.message::<messages::PersistentSubscriptionConfirmation>() {
                    Ok(confirmation) => {
                        item.confirmed = true;
                        debug!(
                            correlation_id = %id,
                            subscription_id = %confirmation.subscription_id,
                            "persistent subscription confirmed"
                        );
                        let _ = item.signals.send(SubscriptionSignal::Confirmed {
                            last_commit_position: confirmation.last_commit_position,
                            last_event_number: confirmation.last_event_number,
                            subscription_id: Some(confirmation.subscription_id),
                        });
                    }
                    Err(e) => self.drop_item(&id, SubscriptionDropReason::ServerError, Some(e.into())),
                }
            }
            Command::StreamEventAppeared => {
                let event = package
                    .message::<messages::StreamEventAppeared>()
                    .map_err(ClientError::from)
                    .and_then(|m| {
                        m.event
                            .ok_or_else(|| ClientError::Protocol("StreamEventAppeared without event".into()))
                    })
                    .and_then(|e| ResolvedEvent::try_from(e).map_err(ClientError::from));
                self.push_event(id, event, None, sink);
            }
            Command::PersistentSubscriptionStreamEventAppeared => {
                match package.message::<messages::PersistentSubscriptionStreamEventAppeared>() {
                    Ok(appeared) => {
                        let event = appeared
                            .event
                            .ok_or_else(|| ClientError::Protocol("event appeared without event".into()))
                            .and_then(|e| ResolvedEvent::try_from(e).map_err(ClientError::from));
                        self.push_event(id, event, appeared.retry_count, sink);
                    }
                    Err(e) => self.drop_item(&id, SubscriptionDropReason::ServerError, Some(e.into())),
                }
            }
            Command::SubscriptionDropped => {
                let reason = package
                    .message::<messages::SubscriptionDropped>()
                    .map(|m| drop_reason(m.reason))
                    .unwrap_or(SubscriptionDropReason::Unknown);
                let error = match reason {
                    SubscriptionDropReason::UserInitiated => None,
                    SubscriptionDropReason::AccessDenied => Some(ClientError::AccessDenied(format!(
                        "subscription to '{}' denied",
                        item.request.stream()
                    ))),
                    other => Some(ClientError::SubscriptionDropped(other)),
                };
                self.drop_item(&id, reason, error);
            }
            Command::NotAuthenticated => {
                let text = payload_text(&package, "authentication error");
                self.drop_item(
                    &id,
                    SubscriptionDropReason::NotAuthenticated,
                    Some(ClientError::NotAuthenticated(text)),
                );
            }
            Command::BadRequest => {
                let text = payload_text(&package, "<no message>");
                self.drop_item(&id, SubscriptionDropReason::ServerError, Some(ClientError::BadRequest(text)));
            }
            Command::NotHandled => match inspect_not_handled(&package, use_tls) {
                InspectionDecision::Reconnect(node) => {
                    self.requeue(&id);
                    return SubscriptionAction::Reconnect(node);
                }
                _ => {
                    self.requeue(&id);
                    self.schedule_waiting(sink, Instant::now());
                }
            },
            actual => {
                let expected = match item.request {
                    SubscriptionRequest::Volatile { .. } => Command::SubscriptionConfirmation,
                    SubscriptionRequest::Persistent { .. } => Command::PersistentSubscriptionConfirmation,
                };
                self.drop_item(
                    &id,
                    SubscriptionDropReason::ServerError,
                    Some(ClientError::UnexpectedCommand { expected, actual }),
                );
            }
        }
        SubscriptionAction::None
    }

    fn push_event(
        &mut self,
        id: Uuid,
        event: Result<ResolvedEvent, ClientError>,
        retry_count: Option<i32>,
        sink: &mut dyn PackageSink,
    ) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                self.drop_item(&id, SubscriptionDropReason::ServerError, Some(e));
                return;
            }
        };
        let Some(item) = self.active.get(&id) else {
            return;
        };
        if item.max_queue > 0 && item.depth.load(Ordering::Acquire) >= item.max_queue {
            warn!(
                correlation_id = %id,
                stream = %item.request.stream(),
                limit = item.max_queue,
                "subscription queue overflow"
            );
            let _ = sink.send_package(&item.unsubscribe_package());
            self.drop_item(&id, SubscriptionDropReason::ProcessingQueueOverflow, None);
            return;
        }
        item.depth.fetch_add(1, Ordering::AcqRel);
        if item.signals.send(SubscriptionSignal::Event { event, retry_count }).is_err() {
            // Consumer is gone; stop the server pushing.
            if let Some(item) = self.active.remove(&id) {
                let _ = sink.send_package(&item.unsubscribe_package());
            }
        }
    }

    fn drop_item(&mut self, id: &Uuid, reason: SubscriptionDropReason, error: Option<ClientError>) {
        if let Some(item) = self.active.remove(id) {
            item.drop_with(reason, error);
        }
    }

    fn requeue(&mut self, id: &Uuid) {
        if let Some(mut item) = self.active.remove(id) {
            item.retry_count += 1;
            item.confirmed = false;
            self.waiting.push(item);
        }
    }

    /// User-initiated unsubscribe. No drop signal is sent; the task reports
    /// its own drop.
    pub(crate) fn unsubscribe(&mut self, id: &Uuid, sink: Option<&mut dyn PackageSink>) {
        if let Some(item) = self.active.remove(id) {
            debug!(correlation_id = %id, stream = %item.request.stream(), "unsubscribing");
            if let Some(sink) = sink {
                let _ = sink.send_package(&item.unsubscribe_package());
            }
        } else {
            self.waiting.retain(|item| item.correlation_id != *id);
        }
    }

    /// Fail subscription requests the server never confirmed in time.
    pub(crate) fn check_timeouts(&mut self, now: Instant, fail_on_no_response: bool) {
        let expired: Vec<Uuid> = self
            .active
            .values()
            .filter(|item| !item.confirmed && now.saturating_duration_since(item.last_updated) > item.timeout)
            .map(|item| item.correlation_id)
            .collect();
        for id in expired {
            if fail_on_no_response {
                let Some(item) = self.active.remove(&id) else {
                    continue;
                };
                let error = ClientError::OperationTimedOut {
                    operation: item.request.name(),
                    elapsed: item.timeout,
                };
                item.drop_with(SubscriptionDropReason::SubscribingError, Some(error));
            } else {
                self.requeue(&id);
            }
        }
    }

    /// Confirmed subscriptions cannot survive a new transport: the server
    /// state is gone. Unconfirmed requests are resent after reconnecting.
    pub(crate) fn on_transport_lost(&mut self, reason: &str) {
        let ids: Vec<Uuid> = self.active.keys().copied().collect();
        for id in ids {
            let confirmed = self.active.get(&id).is_some_and(|item| item.confirmed);
            if confirmed {
                self.drop_item(
                    &id,
                    SubscriptionDropReason::ConnectionClosed,
                    Some(ClientError::ConnectionClosed(reason.to_string())),
                );
            } else {
                self.requeue(&id);
            }
        }
    }

    pub(crate) fn cleanup(&mut self, error: &ClientError) {
        let active = self.active.drain().map(|(_, item)| item);
        for item in active.chain(self.waiting.drain(..)) {
            item.drop_with(SubscriptionDropReason::ConnectionClosed, Some(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstore_proto::messages::EventRecord;

    #[derive(Default)]
    struct Wire(Vec<Package>);

    impl PackageSink for Wire {
        fn send_package(&mut self, package: &Package) -> crate::error::ClientResult<()> {
            self.0.push(package.clone());
            Ok(())
        }
    }

    struct TaskSide {
        rx: mpsc::UnboundedReceiver<SubscriptionSignal>,
        depth: Arc<AtomicUsize>,
    }

    fn subscribe(subs: &mut SubscriptionsManager, max_queue: usize) -> (Uuid, TaskSide) {
        subscribe_as(subs, max_queue, None)
    }

    fn subscribe_as(
        subs: &mut SubscriptionsManager,
        max_queue: usize,
        credentials: Option<UserCredentials>,
    ) -> (Uuid, TaskSide) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let item = SubscriptionItem::new(
            SubscriptionRequest::Volatile {
                stream: "orders".into(),
                resolve_link_tos: false,
            },
            credentials,
            3,
            Duration::from_secs(5),
            max_queue,
            tx,
            depth.clone(),
            Instant::now(),
        );
        let id = item.correlation_id;
        subs.enqueue(item);
        (id, TaskSide { rx, depth })
    }

    fn confirmation(id: Uuid) -> Package {
        Package::from_message(
            Command::SubscriptionConfirmation,
            id,
            &messages::SubscriptionConfirmation {
                last_commit_position: 42,
                last_event_number: Some(9),
            },
        )
    }

    fn appeared(id: Uuid, number: i64) -> Package {
        let record = EventRecord {
            event_stream_id: "orders".into(),
            event_number: number,
            event_id: Uuid::new_v4().to_bytes_le().to_vec(),
            event_type: "OrderPlaced".into(),
            data_content_type: 1,
            metadata_content_type: 0,
            data: b"{}".to_vec(),
            metadata: None,
            created: None,
            created_epoch: None,
        };
        Package::from_message(
            Command::StreamEventAppeared,
            id,
            &messages::StreamEventAppeared {
                event: Some(messages::ResolvedEvent {
                    event: Some(record),
                    link: None,
                    commit_position: number * 10,
                    prepare_position: number * 10,
                }),
            },
        )
    }

    #[test]
    fn confirmation_and_events_reach_the_task() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let (id, mut task) = subscribe(&mut subs, 0);
        subs.schedule_waiting(&mut wire, Instant::now());
        assert_eq!(wire.0[0].command, Command::SubscribeToStream);

        subs.handle_package(confirmation(id), false, &mut wire);
        subs.handle_package(appeared(id, 10), false, &mut wire);

        match task.rx.try_recv().unwrap() {
            SubscriptionSignal::Confirmed {
                last_commit_position,
                last_event_number,
                ..
            } => {
                assert_eq!(last_commit_position, 42);
                assert_eq!(last_event_number, Some(9));
            }
            other => panic!("unexpected {other:?}"),
        }
        match task.rx.try_recv().unwrap() {
            SubscriptionSignal::Event { event, .. } => assert_eq!(event.original_event_number(), Some(10)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(task.depth.load(Ordering::Acquire), 1);
    }

    #[test]
    fn overflow_drops_and_unsubscribes() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let (id, mut task) = subscribe(&mut subs, 2);
        subs.schedule_waiting(&mut wire, Instant::now());
        subs.handle_package(confirmation(id), false, &mut wire);
        for n in 0..3 {
            subs.handle_package(appeared(id, n), false, &mut wire);
        }

        assert!(!subs.contains(&id));
        assert_eq!(wire.0.last().unwrap().command, Command::UnsubscribeFromStream);
        let mut signals = Vec::new();
        while let Ok(signal) = task.rx.try_recv() {
            signals.push(signal);
        }
        assert_eq!(signals.len(), 4);
        assert!(matches!(
            signals[3],
            SubscriptionSignal::Dropped {
                reason: SubscriptionDropReason::ProcessingQueueOverflow,
                ..
            }
        ));
    }

    #[test]
    fn server_drop_is_signalled_once() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let (id, mut task) = subscribe(&mut subs, 0);
        subs.schedule_waiting(&mut wire, Instant::now());
        let dropped = Package::from_message(
            Command::SubscriptionDropped,
            id,
            &messages::SubscriptionDropped {
                reason: Some(DroppedReason::AccessDenied as i32),
            },
        );
        subs.handle_package(dropped.clone(), false, &mut wire);
        subs.handle_package(dropped, false, &mut wire);

        assert!(matches!(
            task.rx.try_recv().unwrap(),
            SubscriptionSignal::Dropped {
                reason: SubscriptionDropReason::AccessDenied,
                ..
            }
        ));
        assert!(task.rx.try_recv().is_err());
    }

    #[test]
    fn transport_loss_drops_confirmed_and_resends_pending() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let (live, mut live_task) = subscribe(&mut subs, 0);
        let (pending, mut pending_task) = subscribe(&mut subs, 0);
        subs.schedule_waiting(&mut wire, Instant::now());
        subs.handle_package(confirmation(live), false, &mut wire);
        let _ = live_task.rx.try_recv();

        subs.on_transport_lost("peer reset");
        assert!(matches!(
            live_task.rx.try_recv().unwrap(),
            SubscriptionSignal::Dropped {
                reason: SubscriptionDropReason::ConnectionClosed,
                ..
            }
        ));
        assert!(pending_task.rx.try_recv().is_err());

        let mut next = Wire::default();
        subs.schedule_waiting(&mut next, Instant::now());
        assert_eq!(next.0.len(), 1);
        assert_eq!(next.0[0].correlation_id, pending);
    }

    #[test]
    fn user_unsubscribe_sends_request_without_signal() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let (id, mut task) = subscribe(&mut subs, 0);
        subs.schedule_waiting(&mut wire, Instant::now());
        subs.handle_package(confirmation(id), false, &mut wire);
        let _ = task.rx.try_recv();

        subs.unsubscribe(&id, Some(&mut wire));
        assert_eq!(wire.0.last().unwrap().command, Command::UnsubscribeFromStream);
        assert_eq!(subs.count(), 0);
        assert!(task.rx.try_recv().is_err());
    }

    #[test]
    fn unconfirmed_subscription_times_out() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let start = Instant::now();
        let (_id, mut task) = subscribe(&mut subs, 0);
        subs.schedule_waiting(&mut wire, start);

        subs.check_timeouts(start + Duration::from_secs(6), true);
        match task.rx.try_recv().unwrap() {
            SubscriptionSignal::Dropped { reason, error } => {
                assert_eq!(reason, SubscriptionDropReason::SubscribingError);
                assert!(matches!(error, Some(ClientError::OperationTimedOut { .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unencodable_request_is_dropped_not_retried() {
        let mut subs = SubscriptionsManager::new();
        let mut wire = Wire::default();
        let (_id, mut task) = subscribe_as(&mut subs, 0, Some(UserCredentials::new("u".repeat(300), "p")));
        subs.schedule_waiting(&mut wire, Instant::now());

        assert!(wire.0.is_empty());
        assert_eq!(subs.count(), 0);
        match task.rx.try_recv().unwrap() {
            SubscriptionSignal::Dropped { reason, error } => {
                assert_eq!(reason, SubscriptionDropReason::SubscribingError);
                assert!(matches!(error, Some(ClientError::Protocol(_))));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn legacy_drop_reasons_map() {
        assert_eq!(drop_reason(None), SubscriptionDropReason::UserInitiated);
        assert_eq!(
            drop_reason(Some(DroppedReason::SubscriberMaxCountReached as i32)),
            SubscriptionDropReason::MaxSubscribersReached
        );
        assert_eq!(drop_reason(Some(99)), SubscriptionDropReason::Unknown);
    }
}
