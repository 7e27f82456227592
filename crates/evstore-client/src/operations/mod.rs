//! Request/response operations and their registry.
//!
//! The engine is the only owner of [`OperationsManager`]. An operation moves
//! through three collections:
//!
//! ```text
//! enqueue ──► waiting (FIFO) ──► active (on the wire) ──► completed
//!                  ▲                     │
//!                  └──── retry_pending ◄─┘  retry / transport loss
//! ```
//!
//! Completion removes the item from `active` before its result is
//! delivered, so a late or duplicated response finds nothing to complete.

pub(crate) mod kinds;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use evstore_core::EndPoint;
use evstore_proto::messages::{MasterInfo, NotHandled, NotHandledReason};
use evstore_proto::Package;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::discovery::NodeEndpoints;
use crate::error::{ClientError, ClientResult};

/// What the engine should do with an item after it inspected a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InspectionDecision {
    /// The item completed; forget it.
    EndOperation,
    /// Resend with the same correlation id.
    Retry,
    /// Resend after reconnecting to this node.
    Reconnect(NodeEndpoints),
}

/// A request awaiting its response. Implementations own the caller's
/// result channel.
pub(crate) trait ClientOperation: Send {
    fn name(&self) -> &'static str;

    fn create_package(&self, correlation_id: Uuid) -> ClientResult<Package>;

    /// Handle a package addressed to this operation.
    fn inspect(&mut self, package: Package) -> InspectionDecision;

    /// Complete with `error`. Later calls are no-ops.
    fn fail(&mut self, error: ClientError);

    /// Whether the request may be replayed on a new transport after being
    /// in flight on a lost one.
    fn retriable_on_reconnect(&self) -> bool {
        true
    }
}

/// Where scheduled packages go. Implemented by the transport, and by plain
/// vectors in tests.
pub(crate) trait PackageSink {
    fn send_package(&mut self, package: &Package) -> ClientResult<()>;
}

/// Shared handling for `NotHandled` replies.
pub(crate) fn inspect_not_handled(package: &Package, use_tls: bool) -> InspectionDecision {
    let message = match package.message::<NotHandled>() {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "undecodable NotHandled payload, retrying");
            return InspectionDecision::Retry;
        }
    };
    match NotHandledReason::try_from(message.reason) {
        Ok(NotHandledReason::NotReady) | Ok(NotHandledReason::TooBusy) => InspectionDecision::Retry,
        Ok(NotHandledReason::NotMaster) => {
            let info = message
                .additional_info
                .as_deref()
                .and_then(|raw| <MasterInfo as prost::Message>::decode(raw).ok());
            match info {
                Some(info) => {
                    let node = master_endpoints(&info);
                    debug!(master = %node, "server is not the leader, reconnecting");
                    if node.select(use_tls).is_some() {
                        InspectionDecision::Reconnect(node)
                    } else {
                        InspectionDecision::Retry
                    }
                }
                None => InspectionDecision::Retry,
            }
        }
        Err(_) => InspectionDecision::Retry,
    }
}

fn master_endpoints(info: &MasterInfo) -> NodeEndpoints {
    let tcp = u16::try_from(info.external_tcp_port)
        .ok()
        .map(|port| EndPoint::new(info.external_tcp_address.clone(), port));
    let secure_tcp = match (&info.external_secure_tcp_address, info.external_secure_tcp_port) {
        (Some(host), Some(port)) if port > 0 => {
            u16::try_from(port).ok().map(|port| EndPoint::new(host.clone(), port))
        }
        _ => None,
    };
    NodeEndpoints { tcp, secure_tcp }
}

/// Payload of `BadRequest`/`NotAuthenticated` replies: plain UTF-8 text.
pub(crate) fn payload_text(package: &Package, fallback: &str) -> String {
    if package.payload.is_empty() {
        fallback.to_string()
    } else {
        String::from_utf8_lossy(&package.payload).into_owned()
    }
}

/// An operation plus its bookkeeping.
pub(crate) struct OperationItem {
    pub(crate) operation: Box<dyn ClientOperation>,
    pub(crate) correlation_id: Uuid,
    pub(crate) retry_count: i32,
    pub(crate) max_retries: i32,
    pub(crate) timeout: Duration,
    pub(crate) created: Instant,
    pub(crate) last_updated: Instant,
    /// Order in which the item was last sent.
    seq: u64,
}

impl OperationItem {
    pub(crate) fn new(
        operation: Box<dyn ClientOperation>,
        max_retries: i32,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            operation,
            correlation_id: Uuid::new_v4(),
            retry_count: 0,
            max_retries,
            timeout,
            created: now,
            last_updated: now,
            seq: 0,
        }
    }
}

impl std::fmt::Debug for OperationItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationItem")
            .field("operation", &self.operation.name())
            .field("correlation_id", &self.correlation_id)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// Registry of every pending operation.
pub(crate) struct OperationsManager {
    active: HashMap<Uuid, OperationItem>,
    waiting: VecDeque<OperationItem>,
    retry_pending: Vec<OperationItem>,
    max_concurrent: usize,
    max_queue_size: usize,
    next_seq: u64,
}

impl OperationsManager {
    pub(crate) fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self {
            active: HashMap::new(),
            waiting: VecDeque::new(),
            retry_pending: Vec::new(),
            max_concurrent: max_concurrent.max(1),
            max_queue_size,
            next_seq: 0,
        }
    }

    pub(crate) fn total_count(&self) -> usize {
        self.active.len() + self.waiting.len() + self.retry_pending.len()
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Queue a new operation behind everything already waiting.
    pub(crate) fn enqueue(&mut self, mut item: OperationItem) {
        if self.waiting.len() >= self.max_queue_size {
            warn!(operation = item.operation.name(), waiting = self.waiting.len(), "operation queue full");
            item.operation.fail(ClientError::QueueFull(self.waiting.len()));
            return;
        }
        debug!(
            operation = item.operation.name(),
            correlation_id = %item.correlation_id,
            "operation enqueued"
        );
        self.waiting.push_back(item);
    }

    /// Send waiting operations while there is room on the wire.
    pub(crate) fn schedule_waiting(&mut self, sink: &mut dyn PackageSink, now: Instant) {
        while self.active.len() < self.max_concurrent {
            let Some(item) = self.waiting.pop_front() else {
                break;
            };
            self.send(item, sink, now);
        }
    }

    fn send(&mut self, mut item: OperationItem, sink: &mut dyn PackageSink, now: Instant) {
        let package = match item
            .operation
            .create_package(item.correlation_id)
            .and_then(|package| package.validate().map(|()| package).map_err(ClientError::from))
        {
            Ok(package) => package,
            Err(e) => {
                warn!(
                    operation = item.operation.name(),
                    correlation_id = %item.correlation_id,
                    error = %e,
                    "operation cannot be encoded"
                );
                item.operation.fail(e);
                return;
            }
        };
        item.seq = self.next_seq;
        self.next_seq += 1;
        item.last_updated = now;
        match sink.send_package(&package) {
            Ok(()) => {
                self.active.insert(item.correlation_id, item);
            }
            Err(e) => {
                // Only closed-transport errors reach here; encoding was checked above.
                debug!(correlation_id = %item.correlation_id, error = %e, "send failed, requeueing");
                self.retry_pending.push(item);
            }
        }
    }

    /// Take the active operation awaiting `correlation_id`, if any.
    pub(crate) fn take_active(&mut self, correlation_id: &Uuid) -> Option<OperationItem> {
        self.active.remove(correlation_id)
    }

    /// Queue an item for resending with its correlation id unchanged.
    pub(crate) fn schedule_retry(&mut self, item: OperationItem) {
        debug!(
            operation = item.operation.name(),
            correlation_id = %item.correlation_id,
            retry = item.retry_count + 1,
            "operation scheduled for retry"
        );
        self.retry_pending.push(item);
    }

    /// Fail expired operations, then move retries behind the waiting
    /// queue and schedule.
    pub(crate) fn check_timeouts_and_retries(
        &mut self,
        sink: Option<&mut dyn PackageSink>,
        now: Instant,
        fail_on_no_response: bool,
    ) {
        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| now.saturating_duration_since(item.last_updated) > item.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(mut item) = self.active.remove(&id) else {
                continue;
            };
            if fail_on_no_response {
                let elapsed = now.saturating_duration_since(item.created);
                warn!(operation = item.operation.name(), correlation_id = %id, ?elapsed, "operation timed out");
                item.operation.fail(ClientError::OperationTimedOut {
                    operation: item.operation.name(),
                    elapsed,
                });
            } else {
                self.retry_pending.push(item);
            }
        }

        self.process_retries();

        if let Some(sink) = sink {
            self.schedule_waiting(sink, now);
        }
    }

    /// Bump retry counters and requeue retries after the waiting items,
    /// failing those past their budget.
    pub(crate) fn process_retries(&mut self) {
        let mut retries = std::mem::take(&mut self.retry_pending);
        retries.sort_by_key(|item| item.seq);
        for mut item in retries {
            item.retry_count += 1;
            if item.max_retries >= 0 && item.retry_count > item.max_retries {
                warn!(
                    operation = item.operation.name(),
                    correlation_id = %item.correlation_id,
                    limit = item.max_retries,
                    "retry limit reached"
                );
                item.operation.fail(ClientError::RetriesLimitReached {
                    operation: item.operation.name(),
                    limit: item.max_retries,
                });
                continue;
            }
            self.waiting.push_back(item);
        }
    }

    /// The transport carrying the active operations is gone.
    ///
    /// Retriable operations keep their correlation ids and wait for the next
    /// transport, behind anything that was never sent. The rest fail.
    pub(crate) fn on_transport_lost(&mut self, reason: &str) {
        let mut in_flight: Vec<OperationItem> = self.active.drain().map(|(_, item)| item).collect();
        in_flight.sort_by_key(|item| item.seq);
        for mut item in in_flight {
            if item.operation.retriable_on_reconnect() {
                self.retry_pending.push(item);
            } else {
                debug!(
                    operation = item.operation.name(),
                    correlation_id = %item.correlation_id,
                    "non-retriable operation lost with its transport"
                );
                item.operation.fail(ClientError::ConnectionClosed(format!(
                    "{} was in flight when the connection dropped: {reason}",
                    item.operation.name()
                )));
            }
        }
        self.process_retries();
    }

    /// Fail everything with the terminal error.
    pub(crate) fn cleanup(&mut self, error: &ClientError) {
        let active = self.active.drain().map(|(_, item)| item);
        let waiting = self.waiting.drain(..);
        let retries = self.retry_pending.drain(..);
        for mut item in active.chain(waiting).chain(retries) {
            item.operation.fail(error.clone());
        }
    }
}
