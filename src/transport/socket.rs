//! WebSocket transport.
//!
//! One task per open connection owns the socket: it forwards queued outbound
//! frames and decodes inbound text/binary frames into JSON values. A dialled
//! transport can re-open itself after an unexpected close when
//! auto-reconnect is enabled; accepted (server-side) connections cannot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{StatsCell, Transport, TransportEvent, TransportStats};
use crate::errors::RouterError;
use crate::events::EventNotifier;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect` waits for the close handshake before aborting.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Configuration ───────────────────────────────────────────────────────────

/// Socket transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketTransportConfig {
    /// Re-open the connection after an unexpected close.
    pub auto_reconnect: bool,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_interval: Duration,
    /// Attempts before giving up and emitting a terminal error.
    pub max_reconnect_attempts: u32,
    /// Largest message accepted in either direction, in bytes.
    pub max_message_size: usize,
}

impl Default for SocketTransportConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            max_message_size: 1024 * 1024,
        }
    }
}

enum Mode {
    /// Client side: dials `url`.
    Dial { url: String },
    /// Server side: wraps a socket accepted by a listener. The stream is
    /// held until `connect` starts pumping it.
    Accepted { pending: Mutex<Option<WsStream>> },
}

// ─── SocketTransport ─────────────────────────────────────────────────────────

/// WebSocket-backed [`Transport`].
pub struct SocketTransport {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    label: String,
    mode: Mode,
    config: SocketTransportConfig,
    /// Outbound queue of the live connection, if any.
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Task owning the live connection (or running reconnect attempts).
    task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    /// Set while a local disconnect is in progress or done.
    closing: AtomicBool,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    events: EventNotifier<TransportEvent>,
    stats: StatsCell,
    /// Serialises connect, reconnect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketTransport {
    /// Transport that dials `url` (`ws://` or `wss://`) on connect.
    pub fn new(url: impl Into<String>, config: SocketTransportConfig) -> Self {
        let url = url.into();
        Self::build(url.clone(), Mode::Dial { url }, config)
    }

    /// Transport over a connection accepted by a WebSocket listener.
    pub fn accepted(stream: WsStream, peer: &str, config: SocketTransportConfig) -> Self {
        Self::build(
            format!("ws-peer://{peer}"),
            Mode::Accepted {
                pending: Mutex::new(Some(stream)),
            },
            SocketTransportConfig {
                auto_reconnect: false,
                ..config
            },
        )
    }

    fn build(label: String, mode: Mode, config: SocketTransportConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                label,
                mode,
                config,
                writer: Mutex::new(None),
                task: Mutex::new(None),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                subscriber: Mutex::new(None),
                events: EventNotifier::new(),
                stats: StatsCell::default(),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&self) -> Result<(), RouterError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        inner.closing.store(false, Ordering::SeqCst);

        let stream = inner.open().await.inspect_err(|_| inner.stats.record_error())?;
        inner.establish(stream);
        tracing::info!(transport = %inner.label, "socket transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RouterError> {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        let _guard = inner.lifecycle.lock().await;

        let was_connected = inner.connected.swap(false, Ordering::SeqCst);
        // Dropping the writer makes the connection task send a close frame.
        lock(&inner.writer).take();
        lock(&inner.subscriber).take();
        let task = lock(&inner.task).take();
        if let Some(mut task) = task {
            if !was_connected {
                // Not a live connection: a reconnect loop, or a finished task.
                task.abort();
            } else if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                tracing::debug!(transport = %inner.label, "close handshake timed out");
                task.abort();
            }
        }

        if was_connected {
            inner.stats.mark_disconnected();
            inner
                .events
                .emit(TransportEvent::Disconnected { graceful: true });
            tracing::info!(transport = %inner.label, "socket transport disconnected");
        }
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<(), RouterError> {
        let inner = &self.inner;
        let text = serde_json::to_string(&message)?;
        if text.len() > inner.config.max_message_size {
            return Err(RouterError::InvalidRequest {
                reason: format!(
                    "message of {} bytes exceeds limit of {} bytes",
                    text.len(),
                    inner.config.max_message_size
                ),
            });
        }

        let bytes = text.len();
        let writer = lock(&inner.writer).clone();
        let Some(writer) = writer else {
            return Err(RouterError::NotConnected {
                target: inner.label.clone(),
            });
        };
        writer.send(Message::text(text)).map_err(|_| {
            inner.stats.record_error();
            RouterError::connection(inner.label.clone(), "connection closed while sending")
        })?;
        inner.stats.record_sent(bytes);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.subscriber) = Some(tx);
        rx
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    fn reconnects(&self) -> bool {
        self.inner.can_reconnect()
    }

    fn describe(&self) -> String {
        self.inner.label.clone()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        lock(&self.inner.writer).take();
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
    }
}

// ─── Connection Task ─────────────────────────────────────────────────────────

impl SocketInner {
    fn can_reconnect(&self) -> bool {
        self.config.auto_reconnect && matches!(self.mode, Mode::Dial { .. })
    }

    /// Obtain a fresh WebSocket stream.
    async fn open(&self) -> Result<WsStream, RouterError> {
        match &self.mode {
            Mode::Dial { url } => {
                let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| RouterError::connection(url.clone(), e))?;
                Ok(stream)
            }
            Mode::Accepted { pending } => {
                let stream = lock(pending).take();
                stream.ok_or_else(|| {
                    RouterError::connection(self.label.clone(), "accepted connection already closed")
                })
            }
        }
    }

    /// Start the connection task for `stream` and mark connected.
    fn establish(self: &Arc<Self>, stream: WsStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.writer) = Some(tx);
        let task = tokio::spawn(run_connection(self.clone(), stream, rx));
        *lock(&self.task) = Some(task);
        self.connected.store(true, Ordering::SeqCst);
        self.stats.mark_connected();
        self.events.emit(TransportEvent::Connected);
    }

    /// Decode one inbound frame and hand it to the subscriber.
    fn deliver(&self, data: &[u8]) {
        if data.len() > self.config.max_message_size {
            self.stats.record_error();
            tracing::warn!(
                transport = %self.label,
                size = data.len(),
                limit = self.config.max_message_size,
                "dropping oversized inbound message"
            );
            return;
        }
        let value: Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                self.stats.record_error();
                tracing::warn!(transport = %self.label, error = %e, "dropping malformed inbound message");
                return;
            }
        };
        self.stats.record_received(data.len());
        match lock(&self.subscriber).as_ref() {
            Some(tx) if tx.send(value).is_ok() => {}
            _ => tracing::debug!(transport = %self.label, "no subscriber, message dropped"),
        }
    }

    /// Bookkeeping after the peer closed or the socket failed.
    async fn on_unexpected_close(self: Arc<Self>, reason: String) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.writer).take();
        self.stats.mark_disconnected();
        tracing::warn!(transport = %self.label, reason = %reason, "socket closed unexpectedly");
        self.events
            .emit(TransportEvent::Disconnected { graceful: false });

        if self.can_reconnect() {
            reconnect(self).await;
        } else {
            // Ends the inbound stream.
            lock(&self.subscriber).take();
        }
    }
}

/// Own one open socket until either side closes it.
async fn run_connection(
    inner: Arc<SocketInner>,
    mut stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let close_reason = loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(frame) => {
                    if let Err(e) = stream.send(frame).await {
                        inner.stats.record_error();
                        break Some(format!("write failed: {e}"));
                    }
                }
                None => {
                    // Local disconnect.
                    let _ = stream.close(None).await;
                    break None;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.deliver(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => inner.deliver(&data),
                Some(Ok(Message::Close(_))) | None => break Some("closed by peer".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    inner.stats.record_error();
                    break Some(format!("read failed: {e}"));
                }
            },
        }
    };

    if let Some(reason) = close_reason {
        inner.on_unexpected_close(reason).await;
    }
}

/// Fixed-interval reconnect loop, run at the tail of a dropped connection's
/// task.
fn reconnect(inner: Arc<SocketInner>) -> BoxFuture<'static, ()> {
    async move {
        let max = inner.config.max_reconnect_attempts;
        for attempt in 1..=max {
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            inner.events.emit(TransportEvent::Reconnecting { attempt });
            tracing::info!(transport = %inner.label, attempt, max, "reconnecting");
            tokio::time::sleep(inner.config.reconnect_interval).await;

            let _guard = inner.lifecycle.lock().await;
            if inner.closing.load(Ordering::SeqCst) || inner.connected.load(Ordering::SeqCst) {
                return;
            }
            match inner.open().await {
                Ok(stream) => {
                    inner.establish(stream);
                    tracing::info!(transport = %inner.label, attempt, "reconnected");
                    return;
                }
                Err(e) => {
                    inner.stats.record_error();
                    tracing::warn!(transport = %inner.label, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        let reason = format!("gave up after {max} reconnect attempts");
        tracing::error!(transport = %inner.label, "{reason}");
        lock(&inner.subscriber).take();
        inner.events.emit(TransportEvent::Error { reason });
    }
    .boxed()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
