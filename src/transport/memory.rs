//! In-process transport.
//!
//! [`InMemoryTransport::pair`] returns two connected ends. Sending on one end
//! queues the message on the other end's inbound stream, preserving order.
//! Closing either end also closes its peer, the way a socket close would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use super::{StatsCell, Transport, TransportEvent, TransportStats};
use crate::errors::RouterError;
use crate::events::EventNotifier;

/// One side of an in-process pair.
struct Endpoint {
    label: String,
    connected: AtomicBool,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    events: EventNotifier<TransportEvent>,
    stats: StatsCell,
}

impl Endpoint {
    fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            connected: AtomicBool::new(false),
            subscriber: Mutex::new(None),
            events: EventNotifier::new(),
            stats: StatsCell::default(),
        })
    }

    fn subscriber(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Value>>> {
        self.subscriber.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed. Returns whether the endpoint was open.
    fn close(&self) -> bool {
        let was_open = self.connected.swap(false, Ordering::SeqCst);
        if was_open {
            // Ends the current inbound stream.
            self.subscriber().take();
            self.stats.mark_disconnected();
        }
        was_open
    }
}

/// In-process transport end.
pub struct InMemoryTransport {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

impl InMemoryTransport {
    /// Create a linked pair. Both ends start disconnected; each must be
    /// connected before it can send.
    pub fn pair(name: &str) -> (Self, Self) {
        let a = Endpoint::new(format!("memory://{name}#client"));
        let b = Endpoint::new(format!("memory://{name}#server"));
        (
            Self {
                local: a.clone(),
                peer: b.clone(),
            },
            Self { local: b, peer: a },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<(), RouterError> {
        if !self.local.connected.swap(true, Ordering::SeqCst) {
            self.local.stats.mark_connected();
            self.local.events.emit(TransportEvent::Connected);
            tracing::debug!(transport = %self.local.label, "in-process transport connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RouterError> {
        if self.local.close() {
            self.local
                .events
                .emit(TransportEvent::Disconnected { graceful: true });
            if self.peer.close() {
                self.peer
                    .events
                    .emit(TransportEvent::Disconnected { graceful: false });
            }
            tracing::debug!(transport = %self.local.label, "in-process transport disconnected");
        }
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<(), RouterError> {
        if !self.local.connected.load(Ordering::SeqCst) {
            return Err(RouterError::NotConnected {
                target: self.local.label.clone(),
            });
        }
        if !self.peer.connected.load(Ordering::SeqCst) {
            self.local.stats.record_error();
            return Err(RouterError::connection(
                self.local.label.clone(),
                "peer is not connected",
            ));
        }

        let bytes = message.to_string().len();
        self.local.stats.record_sent(bytes);

        let delivered = match self.peer.subscriber().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };
        if delivered {
            self.peer.stats.record_received(bytes);
        } else {
            tracing::debug!(transport = %self.peer.label, "no subscriber, message dropped");
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.local.subscriber() = Some(tx);
        rx
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.local.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.local.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.local.stats.snapshot()
    }

    fn describe(&self) -> String {
        self.local.label.clone()
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        if self.local.close() && self.peer.close() {
            self.peer
                .events
                .emit(TransportEvent::Disconnected { graceful: false });
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connected_pair() -> (InMemoryTransport, InMemoryTransport) {
        let (a, b) = InMemoryTransport::pair("test");
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (a, _b) = InMemoryTransport::pair("test");
        let err = a.send(json!({"id": "1"})).await.unwrap_err();
        assert_eq!(err.code(), "not_connected");
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (a, b) = connected_pair().await;
        let mut rx = b.subscribe();

        for i in 0..10 {
            a.send(json!({"seq": i})).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap()["seq"], i);
        }

        assert_eq!(a.stats().messages_sent, 10);
        assert_eq!(b.stats().messages_received, 10);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (a, _b) = connected_pair().await;
        a.disconnect().await.unwrap();
        let err = a.send(json!({})).await.unwrap_err();
        assert_eq!(err.code(), "not_connected");
        // Idempotent.
        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_closes_peer() {
        let (a, b) = connected_pair().await;
        let mut rx = b.subscribe();
        let mut events = b.events();

        a.disconnect().await.unwrap();

        assert!(!b.is_connected());
        assert!(rx.recv().await.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Disconnected { graceful: false }
        );
        assert_eq!(b.send(json!({})).await.unwrap_err().code(), "not_connected");
    }

    #[tokio::test]
    async fn test_send_to_unconnected_peer_is_connection_error() {
        let (a, _b) = InMemoryTransport::pair("test");
        a.connect().await.unwrap();
        let err = a.send(json!({})).await.unwrap_err();
        assert_eq!(err.code(), "connection_error");
        assert_eq!(a.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_stream() {
        let (a, b) = connected_pair().await;
        let mut first = b.subscribe();
        let mut second = b.subscribe();

        a.send(json!({"n": 1})).await.unwrap();
        assert!(first.recv().await.is_none());
        assert_eq!(second.recv().await.unwrap()["n"], 1);
    }
}
