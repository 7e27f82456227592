//! Competing-consumer subscriptions to a server-side group.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evstore_core::SubscriptionDropReason;
use evstore_proto::UserCredentials;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use super::handler::{PersistentEventHandler, PersistentSubscriptionContext, TaskHandle};
use super::{SubscriptionRequest, SubscriptionSignal};
use crate::engine::{EngineHandle, SubscriptionChannel};
use crate::error::{ClientError, ClientResult};

/// A connection to a persistent subscription group.
pub struct PersistentSubscription {
    context: PersistentSubscriptionContext,
    handle: TaskHandle,
}

impl PersistentSubscription {
    pub fn group(&self) -> &str {
        self.context.group()
    }

    pub fn stream_id(&self) -> &str {
        self.context.stream_id()
    }

    pub fn subscription_id(&self) -> &str {
        self.context.subscription_id()
    }

    /// Context for acknowledging events outside the handler.
    pub fn context(&self) -> &PersistentSubscriptionContext {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub async fn stop(&self, timeout: Duration) -> ClientResult<()> {
        self.handle.stop(timeout).await
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for PersistentSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSubscription")
            .field("context", &self.context)
            .finish()
    }
}

/// Connect to `group` on `stream` and wait for the server's confirmation.
///
/// At most `buffer_size` delivered events are unacknowledged at any time;
/// further events wait until something is acknowledged or failed. With
/// `auto_ack`, every event the handler returns `Ok` for is acknowledged.
/// A handler error drops the subscription without a nak.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn connect<H: PersistentEventHandler>(
    engine: EngineHandle,
    group: String,
    stream: String,
    buffer_size: usize,
    auto_ack: bool,
    credentials: Option<UserCredentials>,
    handler: H,
) -> ClientResult<PersistentSubscription> {
    let buffer_size = buffer_size.max(1);
    let mut channel = engine.subscribe(
        SubscriptionRequest::Persistent {
            group: group.clone(),
            stream: stream.clone(),
            allowed_in_flight: i32::try_from(buffer_size).unwrap_or(i32::MAX),
        },
        credentials.clone(),
        0,
    )?;

    let subscription_id = match channel.signals.recv().await {
        Some(SubscriptionSignal::Confirmed { subscription_id, .. }) => subscription_id.unwrap_or_default(),
        Some(SubscriptionSignal::Dropped { reason, error }) => {
            return Err(error.unwrap_or(ClientError::SubscriptionDropped(reason)));
        }
        Some(SubscriptionSignal::Event { .. }) => {
            engine.unsubscribe(channel.correlation_id);
            return Err(ClientError::Protocol("event before subscription confirmation".into()));
        }
        None => return Err(ClientError::ConnectionClosed("connection engine stopped".into())),
    };
    info!(%group, %stream, %subscription_id, buffer_size, "connected to persistent subscription");

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop = Arc::new(stop_tx);
    let abort = Arc::new(Notify::new());
    let current = Arc::new(Mutex::new(Some(channel.correlation_id)));
    let context = PersistentSubscriptionContext::new(
        engine.clone(),
        group,
        stream,
        subscription_id,
        channel.correlation_id,
        credentials,
        buffer_size,
        stop.clone(),
    );
    let task = tokio::spawn(run(
        engine.clone(),
        channel,
        context.clone(),
        stop_rx,
        abort.clone(),
        current.clone(),
        auto_ack,
        handler,
    ));

    Ok(PersistentSubscription {
        context,
        handle: TaskHandle::new(engine, stop, abort, current, task),
    })
}

#[allow(clippy::too_many_arguments)]
async fn run<H: PersistentEventHandler>(
    engine: EngineHandle,
    mut channel: SubscriptionChannel,
    ctx: PersistentSubscriptionContext,
    mut stop: watch::Receiver<bool>,
    abort: Arc<Notify>,
    current: Arc<Mutex<Option<uuid::Uuid>>>,
    auto_ack: bool,
    mut handler: H,
) {
    // Events handed out before an abort stay unacknowledged and return to
    // the server's retry queue.
    let (reason, error) = tokio::select! {
        biased;
        _ = abort.notified() => (SubscriptionDropReason::UserInitiated, None),
        outcome = deliver(&engine, &mut channel, &ctx, &mut stop, auto_ack, &mut handler) => outcome,
    };

    if let Ok(mut current) = current.lock() {
        current.take();
    }
    debug!(
        group = %ctx.group(),
        stream = %ctx.stream_id(),
        %reason,
        unacknowledged = ctx.in_flight(),
        "persistent subscription finished"
    );
    handler.dropped(&ctx, reason, error);
}

async fn deliver<H: PersistentEventHandler>(
    engine: &EngineHandle,
    channel: &mut SubscriptionChannel,
    ctx: &PersistentSubscriptionContext,
    stop: &mut watch::Receiver<bool>,
    auto_ack: bool,
    handler: &mut H,
) -> (SubscriptionDropReason, Option<anyhow::Error>) {
    let id = channel.correlation_id;
    'outer: loop {
        if *stop.borrow_and_update() {
            engine.unsubscribe(id);
            break (SubscriptionDropReason::UserInitiated, None);
        }
        let signal = tokio::select! {
            biased;
            _ = stop.changed() => continue,
            signal = channel.signals.recv() => signal,
        };
        match signal {
            Some(SubscriptionSignal::Event { event, retry_count }) => {
                // Hold the event until the handler has room for it.
                while !ctx.has_capacity() {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => {
                            if *stop.borrow_and_update() {
                                engine.unsubscribe(id);
                                break 'outer (SubscriptionDropReason::UserInitiated, None);
                            }
                        }
                        _ = ctx.capacity_freed() => {}
                    }
                }
                ctx.track(&event);
                let ack_target = auto_ack.then(|| event.clone());
                let result = handler.event_appeared(ctx, event, retry_count).await;
                channel.depth.fetch_sub(1, Ordering::AcqRel);
                match result {
                    Ok(()) => {
                        if let Some(event) = ack_target {
                            if let Err(e) = ctx.acknowledge(&event) {
                                warn!(error = %e, "automatic acknowledgement failed");
                            }
                        }
                    }
                    Err(e) => {
                        // Unacknowledged events go back to the server's retry queue.
                        engine.unsubscribe(id);
                        break (SubscriptionDropReason::EventHandlerException, Some(e));
                    }
                }
            }
            Some(SubscriptionSignal::Dropped { reason, error }) => {
                break (reason, error.map(anyhow::Error::from));
            }
            Some(SubscriptionSignal::Confirmed { .. }) => {}
            None => break (SubscriptionDropReason::ConnectionClosed, None),
        }
    }
}
