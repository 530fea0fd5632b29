//! Router: directory of known servers and their live connections.
//!
//! All operations on one server id are serialised through a per-id async
//! lock, so concurrent register/connect/unregister calls for the same id
//! can never leave two live connections behind. Operations on different ids
//! run in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

use super::types::{RouterEvent, ServerRecord};
use crate::discovery::ServerDiscoveryHandler;
use crate::errors::RouterError;
use crate::events::EventNotifier;
use crate::protocol::{ClientEvent, ClientProtocol, ClientSettings, HandshakeReply};
use crate::transport::{Transport, TransportFactory, TransportStats};

// ─── ConnectionHandle ────────────────────────────────────────────────────────

/// One live connection: exactly one transport and one client protocol.
struct ConnectionHandle {
    /// Distinguishes successive connections to the same id.
    seq: u64,
    transport: Arc<dyn Transport>,
    client: ClientProtocol,
    watcher: JoinHandle<()>,
}

/// Held per-id lock. Dropping it prunes the map entry once unused.
struct IdGuard<'a> {
    owner: &'a RouterInner,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.release_id_lock(&self.id);
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Multiplexes one logical client onto many backend servers.
///
/// Cloning shares the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    servers: RwLock<HashMap<String, ServerRecord>>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    id_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    factory: Arc<dyn TransportFactory>,
    client_settings: ClientSettings,
    events: EventNotifier<RouterEvent>,
    next_seq: AtomicU64,
}

impl Router {
    /// Create an empty router.
    pub fn new(factory: Arc<dyn TransportFactory>, client_settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                servers: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                id_locks: std::sync::Mutex::new(HashMap::new()),
                factory,
                client_settings,
                events: EventNotifier::new(),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to `server:*` lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Insert or replace a server record (last write wins).
    ///
    /// A live connection is kept as is, even if the address changed.
    pub async fn register_server(&self, record: ServerRecord) -> Result<(), RouterError> {
        record.validate()?;
        let id = record.id.clone();
        let _guard = self.inner.lock_id(&id).await;

        let previous = self
            .inner
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), record.clone());

        match previous {
            None => tracing::info!(server = %id, address = %record.address, "server registered"),
            Some(old) => {
                if old.address != record.address && self.inner.has_connection(&id) {
                    tracing::warn!(
                        server = %id,
                        old_address = %old.address,
                        new_address = %record.address,
                        "address changed while connected; keeping the live connection"
                    );
                } else {
                    tracing::debug!(server = %id, "server record refreshed");
                }
            }
        }
        self.inner
            .events
            .emit(RouterEvent::Registered { server_id: id });
        Ok(())
    }

    /// Remove a server, disconnecting it first if it is live.
    pub async fn unregister_server(&self, id: &str) -> Result<(), RouterError> {
        if !self.inner.has_record(id) {
            return Err(RouterError::NotFound { id: id.to_string() });
        }
        let _guard = self.inner.lock_id(id).await;

        // Re-check under the lock; a concurrent unregister may have won.
        if !self.inner.has_record(id) {
            return Err(RouterError::NotFound { id: id.to_string() });
        }
        self.inner.disconnect_locked(id).await;
        self.inner
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        tracing::info!(server = %id, "server unregistered");
        self.inner.events.emit(RouterEvent::Unregistered {
            server_id: id.to_string(),
        });
        Ok(())
    }

    /// Every registered server, sorted by id.
    pub fn get_all_servers(&self) -> Vec<ServerRecord> {
        let mut servers: Vec<ServerRecord> = self
            .inner
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// Look up one server record.
    pub fn get_server(&self, id: &str) -> Option<ServerRecord> {
        self.inner
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// Whether `id` has a live, handshaken connection.
    pub fn is_server_connected(&self, id: &str) -> bool {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .is_some_and(|handle| handle.client.is_ready())
    }

    /// Ids with a live connection, sorted.
    pub fn connected_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, handle)| handle.client.is_ready())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Open a connection to `id` and complete the handshake.
    ///
    /// Fails with `not_found` for unknown ids before any I/O. Connecting an
    /// id that already has a connection is a no-op.
    pub async fn connect_to_server(&self, id: &str) -> Result<(), RouterError> {
        if !self.inner.has_record(id) {
            return Err(RouterError::NotFound { id: id.to_string() });
        }

        let _guard = self.inner.lock_id(id).await;

        if self.inner.has_connection(id) {
            tracing::debug!(server = %id, "already connected");
            return Ok(());
        }
        // Re-read under the lock; it may have been unregistered meanwhile.
        let record = self
            .get_server(id)
            .ok_or_else(|| RouterError::NotFound { id: id.to_string() })?;

        match self.inner.open_connection(&record).await {
            Ok(handle) => {
                self.inner
                    .connections
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.to_string(), handle);
                tracing::info!(server = %id, address = %record.address, "server connected");
                self.inner.events.emit(RouterEvent::Connected {
                    server_id: id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "failed to connect");
                self.inner.events.emit(RouterEvent::ConnectionError {
                    server_id: id.to_string(),
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Connect every registered server concurrently.
    ///
    /// One failure does not affect the others. Returns the failures.
    pub async fn connect_to_all_servers(&self) -> Vec<(String, RouterError)> {
        let ids: Vec<String> = self.get_all_servers().into_iter().map(|s| s.id).collect();
        let attempts = ids.iter().map(|id| async move {
            let result = self.connect_to_server(id).await;
            (id.clone(), result)
        });

        let failures: Vec<(String, RouterError)> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if !failures.is_empty() {
            tracing::warn!(
                failed = failures.len(),
                total = ids.len(),
                "some servers failed to connect"
            );
        }
        failures
    }

    /// Close the connection to `id`, if any.
    pub async fn disconnect_from_server(&self, id: &str) -> Result<(), RouterError> {
        if !self.inner.has_record(id) && !self.inner.has_connection(id) {
            return Err(RouterError::NotFound { id: id.to_string() });
        }
        let _guard = self.inner.lock_id(id).await;
        self.inner.disconnect_locked(id).await;
        Ok(())
    }

    /// Disconnect every live server.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let count = ids.len();
        futures::future::join_all(ids.iter().map(|id| self.disconnect_from_server(id))).await;
        tracing::info!(count, "router shut down");
    }

    // ─── Forwarding ──────────────────────────────────────────────────────

    /// Forward `{method, params?}` to server `id` and return its result.
    pub async fn forward_request(&self, id: &str, payload: Value) -> Result<Value, RouterError> {
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| RouterError::InvalidRequest {
                reason: "payload must carry a string 'method'".into(),
            })?
            .to_string();
        let params = payload.get("params").cloned();

        let client = self.inner.client(id)?;
        tracing::debug!(server = %id, method = %method, "forwarding request");
        client.request(&method, params).await
    }

    /// Identity and methods the server announced in its handshake.
    pub fn get_server_capabilities(&self, id: &str) -> Result<HandshakeReply, RouterError> {
        self.inner
            .client(id)?
            .server_info()
            .ok_or_else(|| RouterError::NotConnected {
                target: id.to_string(),
            })
    }

    /// Transport counters for every live connection, sorted by id.
    pub fn connection_stats(&self) -> Vec<(String, TransportStats)> {
        let mut stats: Vec<(String, TransportStats)> = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (id.clone(), handle.transport.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

impl RouterInner {
    /// Take the per-id lock. The map entry lives only while someone holds
    /// or waits on it.
    async fn lock_id(&self, id: &str) -> IdGuard<'_> {
        let lock = self
            .id_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone();
        IdGuard {
            owner: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release_id_lock(&self, id: &str) {
        let mut locks = self.id_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn id_lock_count(&self) -> usize {
        self.id_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn has_record(&self, id: &str) -> bool {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn has_connection(&self, id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// The ready client for `id`.
    fn client(&self, id: &str) -> Result<ClientProtocol, RouterError> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|handle| handle.client.clone())
            .ok_or_else(|| RouterError::NotConnected {
                target: id.to_string(),
            })
    }

    async fn open_connection(
        self: &Arc<Self>,
        record: &ServerRecord,
    ) -> Result<ConnectionHandle, RouterError> {
        let transport = self.factory.create(&record.id, &record.address).await?;
        let client = ClientProtocol::new(&record.id, transport.clone(), self.client_settings.clone());
        let client_events = client.events();
        client.connect().await?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let watcher = tokio::spawn(watch_connection(
            Arc::downgrade(self),
            record.id.clone(),
            seq,
            client_events,
        ));
        Ok(ConnectionHandle {
            seq,
            transport,
            client,
            watcher,
        })
    }

    /// Tear down the connection for `id`. Caller holds the id lock.
    async fn disconnect_locked(&self, id: &str) {
        let handle = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(handle) = handle else {
            return;
        };

        handle.watcher.abort();
        if let Err(e) = handle.client.disconnect().await {
            tracing::debug!(server = %id, error = %e, "client disconnect failed");
        }
        tracing::info!(server = %id, "server disconnected");
        self.events.emit(RouterEvent::Disconnected {
            server_id: id.to_string(),
        });
    }

    /// Drop the connection for `id` if it is still connection `seq`.
    fn forget_connection(&self, id: &str, seq: u64) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.get(id).is_some_and(|handle| handle.seq == seq) {
            connections.remove(id);
            true
        } else {
            false
        }
    }
}

/// Translate one connection's client events into router events.
async fn watch_connection(
    router: Weak<RouterInner>,
    id: String,
    seq: u64,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    let mut reconnecting = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };
        let Some(router) = router.upgrade() else {
            return;
        };

        match event {
            ClientEvent::Reconnecting { attempt } => {
                reconnecting = true;
                router.events.emit(RouterEvent::Reconnecting {
                    server_id: id.clone(),
                    attempt,
                });
            }
            ClientEvent::Ready => {
                if reconnecting {
                    reconnecting = false;
                    tracing::info!(server = %id, "server reconnected");
                    router.events.emit(RouterEvent::Connected {
                        server_id: id.clone(),
                    });
                }
            }
            ClientEvent::Lost { reason } => {
                // connect_to_server inserts the handle under this lock.
                let _guard = router.lock_id(&id).await;
                if router.forget_connection(&id, seq) {
                    tracing::warn!(server = %id, reason = %reason, "connection lost");
                    router.events.emit(RouterEvent::ConnectionError {
                        server_id: id.clone(),
                        error: RouterError::connection(id.clone(), reason),
                    });
                    router.events.emit(RouterEvent::Disconnected {
                        server_id: id.clone(),
                    });
                }
                return;
            }
            ClientEvent::Closed => return,
        }
    }
}

// ─── Discovery Integration ───────────────────────────────────────────────────

#[async_trait]
impl ServerDiscoveryHandler for Router {
    async fn on_server_discovered(&self, record: ServerRecord) {
        let id = record.id.clone();
        if let Err(e) = self.register_server(record).await {
            tracing::warn!(server = %id, error = %e, "could not register discovered server");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
