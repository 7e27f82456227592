//! Live-only subscriptions to a stream or `$all`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evstore_core::SubscriptionDropReason;
use evstore_proto::UserCredentials;
use tokio::sync::{Notify, watch};
use tracing::debug;

use super::handler::{EventHandler, SubscriptionContext, TaskHandle};
use super::{SubscriptionRequest, SubscriptionSignal};
use crate::engine::{EngineHandle, SubscriptionChannel};
use crate::error::{ClientError, ClientResult};

/// A confirmed live subscription.
pub struct VolatileSubscription {
    stream: String,
    last_commit_position: i64,
    last_event_number: Option<i64>,
    handle: TaskHandle,
}

impl VolatileSubscription {
    pub fn stream_id(&self) -> &str {
        &self.stream
    }

    /// Commit position of the log when the server confirmed the subscription.
    pub fn last_commit_position(&self) -> i64 {
        self.last_commit_position
    }

    /// Last event number of the stream at confirmation; `None` for `$all`
    /// or a stream that did not exist yet.
    pub fn last_event_number(&self) -> Option<i64> {
        self.last_event_number
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Unsubscribe and wait up to `timeout` for the handler to observe the drop.
    pub async fn stop(&self, timeout: Duration) -> ClientResult<()> {
        self.handle.stop(timeout).await
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for VolatileSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileSubscription")
            .field("stream", &self.stream)
            .field("last_commit_position", &self.last_commit_position)
            .field("last_event_number", &self.last_event_number)
            .finish()
    }
}

/// Subscribe and wait for the server's confirmation before spawning the
/// delivery task.
pub(crate) async fn subscribe<H: EventHandler>(
    engine: EngineHandle,
    stream: String,
    resolve_link_tos: bool,
    credentials: Option<UserCredentials>,
    max_queue: usize,
    handler: H,
) -> ClientResult<VolatileSubscription> {
    let mut channel = engine.subscribe(
        SubscriptionRequest::Volatile {
            stream: stream.clone(),
            resolve_link_tos,
        },
        credentials,
        max_queue,
    )?;

    let (last_commit_position, last_event_number) = match channel.signals.recv().await {
        Some(SubscriptionSignal::Confirmed {
            last_commit_position,
            last_event_number,
            ..
        }) => (last_commit_position, last_event_number),
        Some(SubscriptionSignal::Dropped { reason, error }) => {
            return Err(error.unwrap_or(ClientError::SubscriptionDropped(reason)));
        }
        Some(SubscriptionSignal::Event { .. }) => {
            engine.unsubscribe(channel.correlation_id);
            return Err(ClientError::Protocol("event before subscription confirmation".into()));
        }
        None => return Err(ClientError::ConnectionClosed("connection engine stopped".into())),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop = Arc::new(stop_tx);
    let abort = Arc::new(Notify::new());
    let current = Arc::new(Mutex::new(Some(channel.correlation_id)));
    let ctx = SubscriptionContext::new(stream.clone(), stop.clone());
    let task = tokio::spawn(run(
        engine.clone(),
        channel,
        ctx,
        stop_rx,
        abort.clone(),
        current.clone(),
        handler,
    ));

    Ok(VolatileSubscription {
        stream,
        last_commit_position,
        last_event_number,
        handle: TaskHandle::new(engine, stop, abort, current, task),
    })
}

async fn run<H: EventHandler>(
    engine: EngineHandle,
    mut channel: SubscriptionChannel,
    ctx: SubscriptionContext,
    mut stop: watch::Receiver<bool>,
    abort: Arc<Notify>,
    current: Arc<Mutex<Option<uuid::Uuid>>>,
    mut handler: H,
) {
    let (reason, error) = tokio::select! {
        biased;
        _ = abort.notified() => (SubscriptionDropReason::UserInitiated, None),
        outcome = deliver(&engine, &mut channel, &ctx, &mut stop, &mut handler) => outcome,
    };

    if let Ok(mut current) = current.lock() {
        current.take();
    }
    debug!(stream = %ctx.stream_id(), %reason, "volatile subscription finished");
    handler.dropped(&ctx, reason, error);
}

/// Hand events to `handler` until the subscription ends.
async fn deliver<H: EventHandler>(
    engine: &EngineHandle,
    channel: &mut SubscriptionChannel,
    ctx: &SubscriptionContext,
    stop: &mut watch::Receiver<bool>,
    handler: &mut H,
) -> (SubscriptionDropReason, Option<anyhow::Error>) {
    let id = channel.correlation_id;
    loop {
        if *stop.borrow_and_update() {
            engine.unsubscribe(id);
            break (SubscriptionDropReason::UserInitiated, None);
        }
        tokio::select! {
            biased;
            _ = stop.changed() => continue,
            signal = channel.signals.recv() => match signal {
                Some(SubscriptionSignal::Event { event, .. }) => {
                    let result = handler.event_appeared(ctx, event).await;
                    channel.depth.fetch_sub(1, Ordering::AcqRel);
                    if let Err(e) = result {
                        engine.unsubscribe(id);
                        break (SubscriptionDropReason::EventHandlerException, Some(e));
                    }
                }
                Some(SubscriptionSignal::Dropped { reason, error }) => {
                    break (reason, error.map(anyhow::Error::from));
                }
                Some(SubscriptionSignal::Confirmed { .. }) => {}
                None => break (SubscriptionDropReason::ConnectionClosed, None),
            },
        }
    }
}
