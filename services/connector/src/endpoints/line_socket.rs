//! Local Unix domain socket endpoints (spec.md §4.5).
//!
//! `LineSocketServer` is the Socket→Bus pipeline's source: it accepts
//! connections on a configured path, decodes each newline-terminated line
//! with the codec, and hands the result to an ingest callback (normally
//! `SessionManager::ingest`). It also implements `BackpressureSink` so the
//! `SessionManager` can tell it to stop reading under backpressure.
//!
//! `LineSocketClient` is the Bus→Socket pipeline's sink: it maintains a
//! reconnecting connection to a configured path and implements
//! `BusPublisher` by writing the already-serialized payload followed by two
//! newlines.

use bridge_protocol::capability::{BackpressureSink, BoxFuture, BusPublisher, PublishOutcome, PublishRequest, TransportError};
use bridge_protocol::message::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

type Ingest = dyn Fn(Message) + Send + Sync;

/// Accepts line-oriented connections on a Unix socket and ingests each
/// parsed line (spec.md §4.5, "LineSocketServer").
pub struct LineSocketServer {
    paused: AtomicBool,
    resume: Notify,
}

impl LineSocketServer {
    pub fn new() -> Arc<Self> {
        Arc::new(LineSocketServer { paused: AtomicBool::new(false), resume: Notify::new() })
    }

    /// Bind `path` and run the accept loop until the listener errors. Removes
    /// any stale socket file left behind by a previous run.
    pub async fn serve(self: Arc<Self>, path: &str, ingest: Arc<Ingest>) -> std::io::Result<()> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(path, "line socket server listening");
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let this = self.clone();
                    let ingest = ingest.clone();
                    tokio::spawn(async move { this.serve_connection(stream, ingest).await });
                }
                Err(e) => {
                    error!(error = %e, "line socket accept failed");
                    return Err(e);
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: UnixStream, ingest: Arc<Ingest>) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            if self.paused.load(Ordering::SeqCst) {
                self.resume.notified().await;
            }
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(msg) = bridge_protocol::codec::parse(line.as_bytes()) {
                        ingest(msg);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "line socket read failed");
                    break;
                }
            }
        }
    }
}

impl BackpressureSink for LineSocketServer {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }
}

/// Reconnecting client for the Bus→Socket direction's sink. Implements
/// `BusPublisher` so it can be handed straight to a `Forwarder` (spec.md
/// §4.5, "LineSocketClient").
pub struct LineSocketClient {
    path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl LineSocketClient {
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Arc::new(LineSocketClient { path: path.into(), stream: Mutex::new(None) })
    }

    /// Maintain a reconnecting connection in the background, with
    /// exponential backoff capped at 30s (spec.md §4.5, "reconnect-with-
    /// backoff").
    pub fn start_reconnect_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_millis(200);
        loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    info!(path = %self.path, "line socket client connected");
                    backoff = Duration::from_millis(200);
                    *self.stream.lock().await = Some(stream);
                    while self.is_connected().await {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    warn!(path = %self.path, "line socket client lost connection; reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, path = %self.path, "line socket client connect failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }
}

impl BusPublisher for LineSocketClient {
    /// Sockets have no async completion signal distinct from the write
    /// itself, so a successful write is reported as an immediate `Ack`
    /// (spec.md §4.5).
    fn publish(&self, req: PublishRequest) -> BoxFuture<'_, Result<Option<PublishOutcome>, TransportError>> {
        Box::pin(async move {
            let mut guard = self.stream.lock().await;
            match guard.as_mut() {
                Some(stream) => {
                    let mut buf = req.payload;
                    buf.extend_from_slice(b"\n\n");
                    match stream.write_all(&buf).await {
                        Ok(()) => Ok(Some(PublishOutcome::Ack)),
                        Err(e) => {
                            *guard = None;
                            Err(TransportError(format!("line socket write failed: {e}")))
                        }
                    }
                }
                None => Err(TransportError("line socket client not connected".to_owned())),
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.stream.try_lock().map(|g| g.is_some()).unwrap_or(false)
    }
}
