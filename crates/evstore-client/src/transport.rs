//! TCP/TLS transport carrying framed packages.
//!
//! A [`Transport`] owns one socket. Two background tasks service it:
//!
//! ```text
//!            send(pkg) ──► mpsc ──► writer task ──► socket
//!   engine ◄── TransportEvent ◄── reader task ◄── socket
//! ```
//!
//! Every event carries the transport's `conn_id` so the engine can discard
//! traffic from a transport it has already replaced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use evstore_core::{EndPoint, TlsConfig};
use evstore_proto::Package;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Signals raised by a transport's reader and writer tasks.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Package { conn_id: u64, package: Package },
    Closed { conn_id: u64, error: Option<String> },
}

/// How to open the socket.
#[derive(Debug, Clone)]
pub(crate) struct TransportSettings {
    /// TLS config and the server name to present.
    pub tls: Option<(TlsConfig, Option<String>)>,
    pub connect_timeout: Duration,
}

/// One live socket.
pub(crate) struct Transport {
    conn_id: u64,
    endpoint: EndPoint,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("conn_id", &self.conn_id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Transport {
    /// Connect to `endpoint` and start the I/O tasks.
    pub(crate) async fn connect(
        conn_id: u64,
        endpoint: EndPoint,
        settings: &TransportSettings,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> ClientResult<Self> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = tokio::time::timeout(settings.connect_timeout, connect)
            .await
            .map_err(|_| {
                ClientError::Io(format!(
                    "connect to {endpoint} timed out after {:?}",
                    settings.connect_timeout
                ))
            })?
            .map_err(|e| ClientError::Io(format!("connect to {endpoint}: {e}")))?;
        stream.set_nodelay(true)?;

        match &settings.tls {
            None => {
                debug!(%endpoint, conn_id, "tcp connection established");
                Ok(Self::spawn(conn_id, endpoint, stream, events))
            }
            Some((tls, target_host)) => {
                let host = target_host.as_deref().unwrap_or(&endpoint.host);
                let name = TlsConfig::server_name(host)?;
                let handshake = tls.connector().connect(name, stream);
                let tls_stream = tokio::time::timeout(settings.connect_timeout, handshake)
                    .await
                    .map_err(|_| ClientError::Tls(format!("handshake with {endpoint} timed out")))?
                    .map_err(|e| ClientError::Tls(format!("handshake with {endpoint}: {e}")))?;
                debug!(%endpoint, conn_id, "tls connection established");
                Ok(Self::spawn(conn_id, endpoint, tls_stream, events))
            }
        }
    }

    fn spawn<S>(
        conn_id: u64,
        endpoint: EndPoint,
        stream: S,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(
            conn_id,
            reader,
            events.clone(),
            shutdown_rx.clone(),
            closed.clone(),
        ));
        tokio::spawn(write_loop(
            conn_id,
            writer,
            outbound_rx,
            events,
            shutdown_rx,
            closed.clone(),
        ));

        Self {
            conn_id,
            endpoint,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            closed,
        }
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub(crate) fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a package for writing. Fails once the transport is closed.
    pub(crate) fn send(&self, package: &Package) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed(format!(
                "transport to {} is closed",
                self.endpoint
            )));
        }
        let frame = package.encode()?;
        self.outbound.send(frame).map_err(|_| {
            ClientError::ConnectionClosed(format!("transport to {} is closed", self.endpoint))
        })
    }

    /// Stop both I/O tasks and release the socket. Idempotent.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint, conn_id = self.conn_id, "closing transport");
        }
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Report closure exactly once, whichever side notices first.
fn report_closed(
    conn_id: u64,
    closed: &AtomicBool,
    events: &mpsc::UnboundedSender<TransportEvent>,
    error: Option<String>,
) {
    if !closed.swap(true, Ordering::AcqRel) {
        let _ = events.send(TransportEvent::Closed { conn_id, error });
    }
}

async fn read_loop<R>(
    conn_id: u64,
    mut reader: R,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let error = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break Some("connection closed by peer".to_string()),
                Ok(_) => {
                    let mut failed = None;
                    loop {
                        match Package::decode_frame(&mut buf) {
                            Ok(Some(package)) => {
                                if events.send(TransportEvent::Package { conn_id, package }).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(conn_id, error = %e, "undecodable frame, dropping connection");
                                failed = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    if failed.is_some() {
                        break failed;
                    }
                }
                Err(e) => break Some(e.to_string()),
            },
        }
    };
    report_closed(conn_id, &closed, &events, error);
}

async fn write_loop<W>(
    conn_id: u64,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(conn_id, error = %e, "write failed");
                    report_closed(conn_id, &closed, &events, Some(e.to_string()));
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
