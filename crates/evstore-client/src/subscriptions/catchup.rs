//! Catch-up subscriptions: read history from a checkpoint, then switch to
//! live events without gaps or duplicates.
//!
//! ```text
//! ReadingHistory ──► Subscribing ──► ReadingGap ──► Live
//!       ▲                                            │
//!       └──────────── connection lost (resubscribe) ─┘
//! ```
//!
//! Every delivered event advances a checkpoint. Events at or before the
//! checkpoint are skipped wherever they come from.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evstore_core::{
    CatchUpSubscriptionSettings, Position, ReadDirection, ResolvedEvent, SliceReadStatus,
    SubscriptionDropReason,
};
use evstore_proto::UserCredentials;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{EventHandler, SubscriptionContext, TaskHandle};
use super::{ALL_STREAM, SubscriptionRequest, SubscriptionSignal};
use crate::engine::EngineHandle;
use crate::error::{ClientError, ClientResult};
use crate::operations::kinds::{ReadAllEvents, ReadStreamEvents};

/// Where a catch-up subscription starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpTarget {
    /// `last_checkpoint` is the last event number already processed;
    /// `None` starts from the beginning of the stream.
    Stream {
        stream: String,
        last_checkpoint: Option<i64>,
    },
    /// `last_checkpoint` is the position of the last event already
    /// processed; `None` starts from the beginning of the log.
    All { last_checkpoint: Option<Position> },
}

impl CatchUpTarget {
    fn stream(&self) -> &str {
        match self {
            CatchUpTarget::Stream { stream, .. } => stream,
            CatchUpTarget::All { .. } => ALL_STREAM,
        }
    }
}

/// Last processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    Stream(Option<i64>),
    All(Option<Position>),
}

impl Checkpoint {
    /// Whether `event` is past the checkpoint. Equal counts as seen.
    fn is_new(&self, event: &ResolvedEvent) -> bool {
        match self {
            Checkpoint::Stream(last) => match (last, event.original_event_number()) {
                (Some(last), Some(number)) => number > *last,
                (None, Some(_)) => true,
                (_, None) => false,
            },
            Checkpoint::All(last) => match (last, event.original_position) {
                (Some(last), Some(position)) => position > *last,
                (None, Some(_)) => true,
                (_, None) => false,
            },
        }
    }

    fn advance(&mut self, event: &ResolvedEvent) {
        match self {
            Checkpoint::Stream(last) => {
                if let Some(number) = event.original_event_number() {
                    *last = Some(number);
                }
            }
            Checkpoint::All(last) => {
                if let Some(position) = event.original_position {
                    *last = Some(position);
                }
            }
        }
    }
}

/// A running catch-up subscription.
pub struct CatchUpSubscription {
    stream: String,
    handle: TaskHandle,
}

impl CatchUpSubscription {
    pub fn stream_id(&self) -> &str {
        &self.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.stream == ALL_STREAM
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Stop at the next batch or event boundary and wait up to `timeout`
    /// for the handler's drop notification.
    pub async fn stop(&self, timeout: Duration) -> ClientResult<()> {
        self.handle.stop(timeout).await
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for CatchUpSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchUpSubscription")
            .field("stream", &self.stream)
            .finish()
    }
}

/// Start the subscription task. Returns immediately; history is read in
/// the background.
pub(crate) fn start<H: EventHandler>(
    engine: EngineHandle,
    target: CatchUpTarget,
    settings: CatchUpSubscriptionSettings,
    credentials: Option<UserCredentials>,
    handler: H,
) -> CatchUpSubscription {
    let stream = target.stream().to_string();
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop = Arc::new(stop_tx);
    let abort = Arc::new(Notify::new());
    let current = Arc::new(Mutex::new(None));
    let runner = CatchUpRunner {
        engine: engine.clone(),
        checkpoint: match &target {
            CatchUpTarget::Stream { last_checkpoint, .. } => Checkpoint::Stream(*last_checkpoint),
            CatchUpTarget::All { last_checkpoint } => Checkpoint::All(*last_checkpoint),
        },
        ctx: SubscriptionContext::new(stream.clone(), stop.clone()),
        stream: stream.clone(),
        settings,
        credentials,
        stop: stop_rx,
        current: current.clone(),
        live_started: false,
    };
    let task = tokio::spawn(runner.run(handler, abort.clone()));
    CatchUpSubscription {
        stream,
        handle: TaskHandle::new(engine, stop, abort, current, task),
    }
}

/// Why a phase ended early.
enum Interrupt {
    Stopped,
    Read(ClientError),
    Handler(anyhow::Error),
    Dropped(SubscriptionDropReason, Option<ClientError>),
}

impl From<ClientError> for Interrupt {
    fn from(e: ClientError) -> Self {
        Interrupt::Read(e)
    }
}

struct CatchUpRunner {
    engine: EngineHandle,
    checkpoint: Checkpoint,
    ctx: SubscriptionContext,
    stream: String,
    settings: CatchUpSubscriptionSettings,
    credentials: Option<UserCredentials>,
    stop: watch::Receiver<bool>,
    current: Arc<Mutex<Option<Uuid>>>,
    live_started: bool,
}

impl CatchUpRunner {
    async fn run<H: EventHandler>(mut self, mut handler: H, abort: Arc<Notify>) {
        info!(
            subscription = %self.settings.subscription_name,
            stream = %self.stream,
            checkpoint = ?self.checkpoint,
            "catch-up subscription starting"
        );
        let interrupt = tokio::select! {
            biased;
            _ = abort.notified() => Interrupt::Stopped,
            interrupt = self.cycles(&mut handler) => interrupt,
        };

        // The engine ignores ids it no longer tracks.
        if let Some(id) = self.take_current() {
            self.engine.unsubscribe(id);
        }
        let (reason, error) = match interrupt {
            Interrupt::Stopped => (SubscriptionDropReason::UserInitiated, None),
            Interrupt::Read(e) => (SubscriptionDropReason::CatchUpError, Some(anyhow::Error::from(e))),
            Interrupt::Handler(e) => (SubscriptionDropReason::EventHandlerException, Some(e)),
            Interrupt::Dropped(reason, error) => (reason, error.map(anyhow::Error::from)),
        };
        debug!(stream = %self.stream, %reason, "catch-up subscription finished");
        handler.dropped(&self.ctx, reason, error);
    }

    /// Run cycles until one ends for a reason other than a recoverable
    /// connection loss.
    async fn cycles<H: EventHandler>(&mut self, handler: &mut H) -> Interrupt {
        loop {
            match self.cycle(handler).await {
                Interrupt::Dropped(SubscriptionDropReason::ConnectionClosed, _)
                    if self.settings.resubscribe_on_reconnect
                        && !*self.stop.borrow()
                        && self.engine.is_open() =>
                {
                    warn!(
                        stream = %self.stream,
                        checkpoint = ?self.checkpoint,
                        "connection lost, catching up again"
                    );
                }
                other => return other,
            }
        }
    }

    /// One pass of history, subscribe, gap and live. Only returns when
    /// the subscription ended.
    async fn cycle<H: EventHandler>(&mut self, handler: &mut H) -> Interrupt {
        if let Err(interrupt) = self.read_history(handler).await {
            return interrupt;
        }

        let request = SubscriptionRequest::Volatile {
            stream: self.stream.clone(),
            resolve_link_tos: self.settings.resolve_link_tos,
        };
        let mut channel = match self.engine.subscribe(request, self.credentials.clone(), self.settings.max_live_queue_size) {
            Ok(channel) => channel,
            Err(e) => return Interrupt::Read(e),
        };
        let id = channel.correlation_id;
        self.set_current(id);

        // Wait for confirmation; events cannot arrive before it.
        loop {
            if *self.stop.borrow_and_update() {
                self.engine.unsubscribe(id);
                return Interrupt::Stopped;
            }
            tokio::select! {
                biased;
                _ = self.stop.changed() => continue,
                signal = channel.signals.recv() => match signal {
                    Some(SubscriptionSignal::Confirmed { .. }) => break,
                    Some(SubscriptionSignal::Dropped { reason, error }) => return Interrupt::Dropped(reason, error),
                    Some(SubscriptionSignal::Event { .. }) => {
                        channel.depth.fetch_sub(1, Ordering::AcqRel);
                    }
                    None => return Interrupt::Dropped(SubscriptionDropReason::ConnectionClosed, None),
                },
            }
        }

        // Events appended between the history read and the confirmation.
        // Live events arriving meanwhile queue up in the channel.
        if let Err(interrupt) = self.read_history(handler).await {
            if !matches!(interrupt, Interrupt::Dropped(..)) {
                self.engine.unsubscribe(id);
            }
            return interrupt;
        }

        if !self.live_started {
            self.live_started = true;
            info!(stream = %self.stream, checkpoint = ?self.checkpoint, "live processing started");
            handler.live_processing_started(&self.ctx);
        }

        loop {
            if *self.stop.borrow_and_update() {
                self.engine.unsubscribe(id);
                return Interrupt::Stopped;
            }
            tokio::select! {
                biased;
                _ = self.stop.changed() => continue,
                signal = channel.signals.recv() => match signal {
                    Some(SubscriptionSignal::Event { event, .. }) => {
                        let result = self.deliver(handler, event).await;
                        channel.depth.fetch_sub(1, Ordering::AcqRel);
                        if let Err(e) = result {
                            self.engine.unsubscribe(id);
                            return Interrupt::Handler(e);
                        }
                    }
                    Some(SubscriptionSignal::Dropped { reason, error }) => return Interrupt::Dropped(reason, error),
                    Some(SubscriptionSignal::Confirmed { .. }) => {}
                    None => return Interrupt::Dropped(SubscriptionDropReason::ConnectionClosed, None),
                },
            }
        }
    }

    /// Deliver `event` unless it is at or before the checkpoint.
    async fn deliver<H: EventHandler>(&mut self, handler: &mut H, event: ResolvedEvent) -> anyhow::Result<()> {
        if !self.checkpoint.is_new(&event) {
            return Ok(());
        }
        self.checkpoint.advance(&event);
        handler.event_appeared(&self.ctx, event).await
    }

    /// Read forward from the checkpoint until the end, checking for a stop
    /// request between batches.
    async fn read_history<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), Interrupt> {
        match self.checkpoint {
            Checkpoint::Stream(last) => {
                let mut from = last.map_or(0, |n| n + 1);
                loop {
                    if *self.stop.borrow() {
                        return Err(Interrupt::Stopped);
                    }
                    let read = ReadStreamEvents {
                        stream: self.stream.clone(),
                        from_event_number: from,
                        max_count: self.settings.read_batch_size,
                        resolve_link_tos: self.settings.resolve_link_tos,
                        require_master: self.engine.settings().require_master,
                        direction: ReadDirection::Forward,
                    };
                    let slice = self.read(read).await?;
                    match slice.status {
                        SliceReadStatus::Success => {}
                        SliceReadStatus::StreamNotFound => return Ok(()),
                        SliceReadStatus::StreamDeleted => {
                            return Err(Interrupt::Read(ClientError::InvalidOperation(format!(
                                "stream '{}' is deleted",
                                self.stream
                            ))));
                        }
                    }
                    for event in slice.events {
                        if *self.stop.borrow() {
                            return Err(Interrupt::Stopped);
                        }
                        self.deliver(handler, event).await.map_err(Interrupt::Handler)?;
                    }
                    if slice.is_end_of_stream {
                        return Ok(());
                    }
                    from = slice.next_event_number;
                }
            }
            Checkpoint::All(last) => {
                let mut from = last.unwrap_or(Position::START);
                loop {
                    if *self.stop.borrow() {
                        return Err(Interrupt::Stopped);
                    }
                    let read = ReadAllEvents {
                        position: from,
                        max_count: self.settings.read_batch_size,
                        resolve_link_tos: self.settings.resolve_link_tos,
                        require_master: self.engine.settings().require_master,
                        direction: ReadDirection::Forward,
                    };
                    let slice = self.read(read).await?;
                    if slice.is_end_of_stream() {
                        return Ok(());
                    }
                    for event in slice.events {
                        if *self.stop.borrow() {
                            return Err(Interrupt::Stopped);
                        }
                        self.deliver(handler, event).await.map_err(Interrupt::Handler)?;
                    }
                    from = slice.next_position;
                }
            }
        }
    }

    /// A read that fails because the connection closed is reported as a
    /// drop so the resubscribe rule applies to it.
    async fn read<K>(&self, kind: K) -> Result<K::Output, Interrupt>
    where
        K: crate::operations::kinds::RequestKind,
    {
        match self.engine.execute(kind, self.credentials.clone()).await {
            Ok(output) => Ok(output),
            Err(ClientError::ConnectionClosed(reason)) => Err(Interrupt::Dropped(
                SubscriptionDropReason::ConnectionClosed,
                Some(ClientError::ConnectionClosed(reason)),
            )),
            Err(e) => Err(Interrupt::Read(e)),
        }
    }

    fn set_current(&self, id: Uuid) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(id);
        }
    }

    fn take_current(&self) -> Option<Uuid> {
        self.current.lock().ok().and_then(|mut current| current.take())
    }
}
