//! Long-running subscription commands. Both print events until Ctrl-C or
//! until the server drops the subscription.

use std::time::Duration;

use anyhow::bail;
use evstore_client::{
    EventHandler, PersistentEventHandler, PersistentSubscriptionContext, ResolvedEvent,
    SubscriptionContext, SubscriptionDropReason,
};
use evstore_core::{CatchUpSubscriptionSettings, ConnectionSettings, PersistentSubscriptionSettings};
use tokio::sync::mpsc;
use tracing::info;

use super::{connect, format_event};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

type DropReport = (SubscriptionDropReason, Option<String>);

struct Printer {
    dropped: mpsc::UnboundedSender<DropReport>,
}

impl EventHandler for Printer {
    async fn event_appeared(&mut self, _ctx: &SubscriptionContext, event: ResolvedEvent) -> anyhow::Result<()> {
        println!("{}", format_event(&event));
        Ok(())
    }

    fn live_processing_started(&mut self, ctx: &SubscriptionContext) {
        eprintln!("-- caught up on {}, now live --", ctx.stream_id());
    }

    fn dropped(&mut self, _ctx: &SubscriptionContext, reason: SubscriptionDropReason, error: Option<anyhow::Error>) {
        let _ = self.dropped.send((reason, error.map(|e| e.to_string())));
    }
}

impl PersistentEventHandler for Printer {
    async fn event_appeared(
        &mut self,
        _ctx: &PersistentSubscriptionContext,
        event: ResolvedEvent,
        retry_count: Option<i32>,
    ) -> anyhow::Result<()> {
        match retry_count {
            Some(retries) if retries > 0 => println!("{} (retry {retries})", format_event(&event)),
            _ => println!("{}", format_event(&event)),
        }
        Ok(())
    }

    fn dropped(
        &mut self,
        _ctx: &PersistentSubscriptionContext,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        let _ = self.dropped.send((reason, error.map(|e| e.to_string())));
    }
}

pub async fn catch_up(
    settings: ConnectionSettings,
    stream: Option<String>,
    from: Option<i64>,
    resolve_links: bool,
) -> anyhow::Result<()> {
    let conn = connect(settings).await?;
    let (tx, mut dropped) = mpsc::unbounded_channel();
    let printer = Printer { dropped: tx };
    let sub_settings = CatchUpSubscriptionSettings {
        resolve_link_tos: resolve_links,
        subscription_name: "evstore-cli".into(),
        ..Default::default()
    };

    let sub = match stream {
        Some(stream) => conn.subscribe_to_stream_from(stream, from, sub_settings, printer, None)?,
        None if from.is_some() => bail!("--from needs a stream; $all checkpoints are positions"),
        None => conn.subscribe_to_all_from(None, sub_settings, printer, None)?,
    };
    info!(stream = %sub.stream_id(), "catch-up subscription started");

    let outcome = wait(&mut dropped).await;
    sub.stop(STOP_TIMEOUT).await.ok();
    conn.close().await;
    outcome
}

pub async fn persistent(
    settings: ConnectionSettings,
    stream: &str,
    group: &str,
    buffer_size: usize,
    create: bool,
) -> anyhow::Result<()> {
    let conn = connect(settings).await?;
    if create {
        conn.create_persistent_subscription(
            stream,
            group,
            PersistentSubscriptionSettings::default().start_from_beginning(),
            None,
        )
        .await?;
        info!(%stream, %group, "persistent subscription group created");
    }

    let (tx, mut dropped) = mpsc::unbounded_channel();
    let sub = conn
        .connect_to_persistent_subscription(stream, group, Printer { dropped: tx }, buffer_size, true, None)
        .await?;
    info!(%stream, %group, id = %sub.subscription_id(), "joined persistent subscription");

    let outcome = wait(&mut dropped).await;
    sub.stop(STOP_TIMEOUT).await.ok();
    conn.close().await;
    outcome
}

async fn wait(dropped: &mut mpsc::UnboundedReceiver<DropReport>) -> anyhow::Result<()> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping subscription");
            Ok(())
        }
        report = dropped.recv() => match report {
            Some((reason, Some(error))) => bail!("subscription dropped ({reason}): {error}"),
            Some((reason, None)) => bail!("subscription dropped ({reason})"),
            None => Ok(()),
        },
    }
}
