//! Transport abstraction.
//!
//! A transport is a bidirectional channel carrying JSON messages. It knows
//! nothing about requests, responses or handshakes; those live in
//! [`crate::protocol`]. Inbound messages are delivered on a single ordered
//! stream obtained from [`Transport::subscribe`]. Lifecycle changes are
//! published as [`TransportEvent`]s.

pub mod factory;
pub mod memory;
pub mod socket;
pub mod stdio;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::errors::RouterError;

pub use factory::{DefaultTransportFactory, TransportFactory};
pub use memory::InMemoryTransport;
pub use socket::{SocketTransport, SocketTransportConfig};
pub use stdio::{StdioCommand, StdioTransport};

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// Bidirectional message channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. No-op if already connected.
    async fn connect(&self) -> Result<(), RouterError>;

    /// Close the channel. Always succeeds; closing a closed channel is a no-op.
    async fn disconnect(&self) -> Result<(), RouterError>;

    /// Send one message. Fails with `not_connected` before `connect` or
    /// after `disconnect`.
    async fn send(&self, message: Value) -> Result<(), RouterError>;

    /// Take the inbound message stream.
    ///
    /// There is one stream per transport: subscribing again replaces the
    /// previous stream, which then ends. Messages arriving while nobody is
    /// subscribed are dropped.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value>;

    /// Lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Whether the channel is currently open.
    fn is_connected(&self) -> bool;

    /// Counters since creation.
    fn stats(&self) -> TransportStats;

    /// Whether this transport re-opens itself after an unexpected close.
    fn reconnects(&self) -> bool {
        false
    }

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Lifecycle notifications published by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// `graceful` is true when the close was requested locally.
    Disconnected { graceful: bool },
    /// Emitted before each reconnect attempt (1-based).
    Reconnecting { attempt: u32 },
    /// Terminal failure, e.g. reconnect attempts exhausted.
    Error { reason: String },
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// Snapshot of transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    /// Set while connected.
    pub connected_since: Option<DateTime<Utc>>,
}

/// Interior-mutable counters shared by the transport implementations.
#[derive(Debug, Default)]
pub(crate) struct StatsCell(Mutex<TransportStats>);

impl StatsCell {
    fn with<R>(&self, f: impl FnOnce(&mut TransportStats) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.with(|s| {
            s.messages_sent += 1;
            s.bytes_sent += bytes as u64;
        });
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.with(|s| {
            s.messages_received += 1;
            s.bytes_received += bytes as u64;
        });
    }

    pub(crate) fn record_error(&self) {
        self.with(|s| s.errors += 1);
    }

    pub(crate) fn mark_connected(&self) {
        self.with(|s| s.connected_since = Some(Utc::now()));
    }

    pub(crate) fn mark_disconnected(&self) {
        self.with(|s| s.connected_since = None);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        self.with(|s| s.clone())
    }
}
