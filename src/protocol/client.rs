//! Outbound side of the protocol: one [`ClientProtocol`] per connection.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──transport open──▶ Handshaking ──reply──▶ Ready
//!      ▲                                                                            │
//!      └──────────────────────────── disconnect / failure ──────────────────────────┘
//! ```
//!
//! Responses are routed by a single receive task into the connection's
//! [`ResponseCorrelator`]. A second task watches transport events: when an
//! auto-reconnecting transport comes back, in-flight requests are cancelled
//! and a fresh handshake runs before the client reports `Ready` again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::correlator::ResponseCorrelator;
use super::types::{
    methods, next_request_id, HandshakeInfo, HandshakeReply, Message, RequestMessage,
    ToolDescriptor, ToolsListResult,
};
use crate::errors::RouterError;
use crate::events::EventNotifier;
use crate::transport::{Transport, TransportEvent, TransportStats};

/// Cancellation reason used by [`ClientProtocol::disconnect`].
pub const DISCONNECT_REASON: &str = "client disconnecting";

/// Cancellation reason used when the transport drops underneath us.
const CONNECTION_LOST_REASON: &str = "connection lost";

// ─── Types ───────────────────────────────────────────────────────────────────

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

/// Notifications published by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake completed (initially or after a reconnect).
    Ready,
    /// The transport is about to retry (1-based attempt).
    Reconnecting { attempt: u32 },
    /// The connection ended without a local `disconnect`.
    Lost { reason: String },
    /// `disconnect` completed.
    Closed,
}

/// Identity and request policy of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Sent as handshake params.
    pub info: HandshakeInfo,
    /// Per-request timeout; zero waits indefinitely.
    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            info: HandshakeInfo::new("mcp-router", env!("CARGO_PKG_VERSION"), &["tools"]),
            request_timeout_ms: 30_000,
        }
    }
}

// ─── ClientProtocol ──────────────────────────────────────────────────────────

/// Client end of one connection. Cloning shares the connection.
#[derive(Clone)]
pub struct ClientProtocol {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    target: String,
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    correlator: ResponseCorrelator,
    state: watch::Sender<ClientState>,
    server: RwLock<Option<HandshakeReply>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    /// Set after an unexpected drop on a reconnecting transport.
    reconnect_pending: AtomicBool,
    events: EventNotifier<ClientEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientProtocol {
    /// Create a disconnected client for `target` over `transport`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(target: &str, transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                target: target.to_string(),
                settings,
                transport,
                correlator: ResponseCorrelator::new(),
                state,
                server: RwLock::new(None),
                receive_task: Mutex::new(None),
                monitor_task: Mutex::new(None),
                reconnect_pending: AtomicBool::new(false),
                events: EventNotifier::new(),
            }),
        }
    }

    /// Open the transport and perform the handshake.
    ///
    /// Fails immediately unless the client is `Disconnected`. On any failure
    /// the transport is closed again and the client is left `Disconnected`.
    pub async fn connect(&self) -> Result<(), RouterError> {
        let inner = &self.inner;
        if !inner.transition(ClientState::Disconnected, ClientState::Connecting) {
            return Err(RouterError::connection(
                inner.target.clone(),
                format!("cannot connect while {:?}", self.state()),
            ));
        }

        tracing::debug!(server = %inner.target, transport = %inner.transport.describe(), "connecting");
        let inbound = inner.transport.subscribe();
        let transport_events = inner.transport.events();
        if let Err(e) = inner.transport.connect().await {
            inner.state.send_replace(ClientState::Disconnected);
            tracing::warn!(server = %inner.target, error = %e, "transport connect failed");
            return Err(e);
        }

        *lock(&inner.receive_task) = Some(tokio::spawn(receive_loop(
            inner.target.clone(),
            inner.correlator.clone(),
            inbound,
        )));
        *lock(&inner.monitor_task) = Some(tokio::spawn(monitor(
            Arc::downgrade(inner),
            transport_events,
        )));

        if !inner.transition(ClientState::Connecting, ClientState::Handshaking) {
            // Disconnected while the transport was opening.
            inner.close(DISCONNECT_REASON, true).await;
            return Err(RouterError::Cancelled {
                reason: DISCONNECT_REASON.into(),
            });
        }
        if let Err(e) = inner.handshake().await {
            tracing::warn!(server = %inner.target, error = %e, "handshake failed");
            inner.close(DISCONNECT_REASON, true).await;
            return Err(e);
        }

        if !inner.promote_to_ready() {
            // A concurrent disconnect won.
            return Err(RouterError::Cancelled {
                reason: DISCONNECT_REASON.into(),
            });
        }
        tracing::info!(server = %inner.target, "connection ready");
        Ok(())
    }

    /// Cancel pending requests and close the transport. Idempotent.
    pub async fn disconnect(&self) -> Result<(), RouterError> {
        if self.state() == ClientState::Disconnected {
            return Ok(());
        }
        self.inner.close(DISCONNECT_REASON, true).await;
        self.inner.events.emit(ClientEvent::Closed);
        tracing::info!(server = %self.inner.target, "disconnected");
        Ok(())
    }

    /// Send `method` and wait for its settled result.
    ///
    /// Only valid while `Ready`; fails with `not_connected` otherwise.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RouterError> {
        self.ensure_ready()?;
        self.inner.call(method, params).await
    }

    /// Fetch the server's tool set.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RouterError> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let list: ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    /// Send `method` without waiting for (or expecting) a reply.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RouterError> {
        self.ensure_ready()?;
        let message = serde_json::to_value(RequestMessage::notification(method, params))?;
        self.inner.transport.send(message).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to client events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the handshake completed and requests are accepted.
    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Server identity and methods from the last successful handshake.
    pub fn server_info(&self) -> Option<HandshakeReply> {
        self.inner
            .server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Label used in logs and errors.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Underlying transport counters.
    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    /// Requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count().await
    }

    fn ensure_ready(&self) -> Result<(), RouterError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RouterError::NotConnected {
                target: self.inner.target.clone(),
            })
        }
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Move `from → to`. Returns false if the state was not `from`.
    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// `Handshaking → Ready`. Returns false if the state moved on meanwhile.
    fn promote_to_ready(&self) -> bool {
        let promoted = self.transition(ClientState::Handshaking, ClientState::Ready);
        if promoted {
            self.events.emit(ClientEvent::Ready);
        }
        promoted
    }

    /// Correlated request without the `Ready` check.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RouterError> {
        let id = next_request_id();
        let message = serde_json::to_value(RequestMessage::new(id.clone(), method, params))?;
        let pending = self
            .correlator
            .register(&id, self.settings.request_timeout_ms)?;
        if let Err(e) = self.transport.send(message).await {
            self.correlator.discard(&id, e);
        }
        pending.await
    }

    async fn handshake(&self) -> Result<(), RouterError> {
        let params = serde_json::to_value(&self.settings.info)?;
        let result = self.call(methods::HANDSHAKE, Some(params)).await?;
        let reply: HandshakeReply = serde_json::from_value(result)?;
        tracing::debug!(
            server = %self.target,
            remote = %reply.server.name,
            remote_version = %reply.server.version,
            methods = reply.methods.len(),
            "handshake complete"
        );
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = Some(reply);
        Ok(())
    }

    /// Stop delivery, reject everything pending, close the transport.
    ///
    /// Delivery stops before pending requests are rejected, so nothing can be
    /// resolved after this returns.
    async fn close(&self, reason: &str, stop_monitor: bool) {
        if let Some(task) = lock(&self.receive_task).take() {
            task.abort();
        }
        if stop_monitor {
            if let Some(task) = lock(&self.monitor_task).take() {
                task.abort();
            }
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);

        let cancelled = self.correlator.cancel_all(reason).await;
        if cancelled > 0 {
            tracing::debug!(server = %self.target, cancelled, reason, "rejected pending requests");
        }
        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!(server = %self.target, error = %e, "transport disconnect failed");
        }
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.state.send_replace(ClientState::Disconnected);
    }

    /// Tear down after an unrecoverable transport failure.
    async fn lose(&self, reason: String) {
        tracing::warn!(server = %self.target, reason = %reason, "connection lost");
        self.close(CONNECTION_LOST_REASON, false).await;
        self.events.emit(ClientEvent::Lost { reason });
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for slot in [&self.receive_task, &self.monitor_task] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Route inbound responses to their waiters, in arrival order.
async fn receive_loop(
    target: String,
    correlator: ResponseCorrelator,
    mut inbound: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(raw) = inbound.recv().await {
        match Message::from_value(raw) {
            Ok(Message::Response(response)) => correlator.dispatch_response(response),
            Ok(Message::Request(request)) => {
                tracing::debug!(server = %target, method = ?request.method, "ignoring server-initiated message");
            }
            Err(e) => {
                tracing::warn!(server = %target, error = %e, "dropping malformed message");
            }
        }
    }
    tracing::debug!(server = %target, "receive loop ended");
}

/// React to transport lifecycle events.
async fn monitor(inner: Weak<ClientInner>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "transport events lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Disconnected { graceful: false } => {
                if inner.state() == ClientState::Disconnected {
                    continue;
                }
                if !inner.transport.reconnects() {
                    inner.lose("connection closed by peer".into()).await;
                    return;
                }
                // Requests sent on the dropped connection will never be
                // answered.
                let cancelled = inner.correlator.cancel_all(CONNECTION_LOST_REASON).await;
                tracing::warn!(server = %inner.target, cancelled, "connection dropped, waiting for reconnect");
                inner.reconnect_pending.store(true, Ordering::SeqCst);
                inner.state.send_replace(ClientState::Connecting);
            }
            TransportEvent::Reconnecting { attempt } => {
                inner.events.emit(ClientEvent::Reconnecting { attempt });
            }
            TransportEvent::Connected => {
                if !inner.reconnect_pending.swap(false, Ordering::SeqCst) {
                    continue;
                }
                if !inner.transition(ClientState::Connecting, ClientState::Handshaking) {
                    continue;
                }
                match inner.handshake().await {
                    Ok(()) => {
                        if inner.promote_to_ready() {
                            tracing::info!(server = %inner.target, "connection re-established");
                        }
                    }
                    Err(e) => {
                        if inner.state() != ClientState::Disconnected {
                            inner.lose(format!("handshake after reconnect failed: {e}")).await;
                        }
                        return;
                    }
                }
            }
            TransportEvent::Error { reason } => {
                if inner.state() != ClientState::Disconnected {
                    inner.lose(reason).await;
                }
                return;
            }
            TransportEvent::Disconnected { graceful: true } => {}
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handlers::handler_fn;
    use crate::protocol::server::ServerProtocol;
    use crate::protocol::tools::ToolRegistry;
    use crate::transport::InMemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    fn test_server() -> ServerProtocol {
        let tools = ToolRegistry::with_tools(vec![
            ToolDescriptor::new("screenshot", "Screenshot", "Capture the screen"),
            ToolDescriptor::new("clipboard", "Clipboard", "Read the clipboard"),
        ])
        .unwrap();
        let server = ServerProtocol::new(
            HandshakeInfo::new("test-server", "2.0.0", &["tools"]),
            Arc::new(tools),
        );
        server.register_handler(
            "echo",
            handler_fn(|msg| async move { Ok(msg.params.unwrap_or(Value::Null)) }),
        );
        server.register_handler(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("finally"))
            }),
        );
        server
    }

    /// A client wired to `server` through an in-process pair. The server end
    /// is returned so tests can close it.
    async fn wired_client(
        server: &ServerProtocol,
        settings: ClientSettings,
    ) -> (ClientProtocol, Arc<InMemoryTransport>) {
        let (client_end, server_end) = InMemoryTransport::pair("test");
        let server_end = Arc::new(server_end);
        server.attach(server_end.clone()).await.unwrap();
        let client = ClientProtocol::new("test", Arc::new(client_end), settings);
        (client, server_end)
    }

    #[tokio::test]
    async fn test_connect_handshake_ready() {
        let server = test_server();
        let (client, _server_end) = wired_client(&server, ClientSettings::default()).await;
        let mut events = client.events();

        assert_eq!(client.state(), ClientState::Disconnected);
        client.connect().await.unwrap();
        assert_eq!(client.state(), ClientState::Ready);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Ready);

        let info = client.server_info().unwrap();
        assert_eq!(info.server.name, "test-server");
        assert!(info.methods.contains(&"echo".to_string()));
        assert_eq!(server.connected_clients().len(), 1);
    }

    #[tokio::test]
    async fn test_request_requires_ready() {
        let server = test_server();
        let (client, _server_end) = wired_client(&server, ClientSettings::default()).await;

        let err = client.request("echo", None).await.unwrap_err();
        assert_eq!(err.code(), "not_connected");
        assert_eq!(client.list_tools().await.unwrap_err().code(), "not_connected");
    }

    #[tokio::test]
    async fn test_list_tools_and_request() {
        let server = test_server();
        let (client, _server_end) = wired_client(&server, ClientSettings::default()).await;
        client.connect().await.unwrap();

        let ids: Vec<String> = client
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["screenshot", "clipboard"]);

        let echoed = client.request("echo", Some(json!({"x": 1}))).await.unwrap();
        assert_eq!(echoed, json!({"x": 1}));

        let err = client.request("missing", None).await.unwrap_err();
        assert_eq!(err.code(), "method_not_found");
    }

    #[tokio::test]
    async fn test_second_connect_fails_while_ready() {
        let server = test_server();
        let (client, _server_end) = wired_client(&server, ClientSettings::default()).await;
        client.connect().await.unwrap();

        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[tokio::test]
    async fn test_rejected_handshake_rolls_back() {
        let server = test_server();
        let settings = ClientSettings {
            info: HandshakeInfo {
                name: "client".into(),
                version: "1.0".into(),
                capabilities: vec![],
            },
            ..ClientSettings::default()
        };
        let (client, server_end) = wired_client(&server, settings).await;

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.code(), "invalid_params");
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!server_end.is_connected());
        assert!(server.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn test_connect_fails_when_transport_fails() {
        let (client_end, _server_end) = InMemoryTransport::pair("nobody");
        let client = ClientProtocol::new(
            "nobody",
            Arc::new(client_end),
            ClientSettings {
                request_timeout_ms: 100,
                ..ClientSettings::default()
            },
        );
        // Nobody serves the other end, so the handshake cannot be delivered.
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.code(), "connection_error");
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_and_is_idempotent() {
        let server = test_server();
        let (client, _server_end) = wired_client(&server, ClientSettings::default()).await;
        client.connect().await.unwrap();

        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move { client.request("slow", None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(client.pending_requests().await, 1);

        client.disconnect().await.unwrap();
        match in_flight.await.unwrap().unwrap_err() {
            RouterError::Cancelled { reason } => assert_eq!(reason, DISCONNECT_REASON),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.server_info().is_none());

        client.disconnect().await.unwrap();

        // The slow handler finishing later must not resurrect anything.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let server = test_server();
        let settings = ClientSettings {
            request_timeout_ms: 50,
            ..ClientSettings::default()
        };
        let (client, _server_end) = wired_client(&server, settings).await;
        client.connect().await.unwrap();

        let err = client.request("slow", None).await.unwrap_err();
        assert_eq!(err.code(), "timeout");
        // Still usable afterwards.
        assert_eq!(client.request("echo", Some(json!(7))).await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_peer_close_reports_lost() {
        let server = test_server();
        let (client, server_end) = wired_client(&server, ClientSettings::default()).await;
        client.connect().await.unwrap();
        let mut events = client.events();

        server_end.disconnect().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ClientEvent::Lost { .. }));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.request("echo", None).await.unwrap_err().code(), "not_connected");
    }

    #[tokio::test]
    async fn test_notify_requires_ready() {
        let server = test_server();
        let (client, _server_end) = wired_client(&server, ClientSettings::default()).await;
        assert_eq!(
            client.notify("echo", None).await.unwrap_err().code(),
            "not_connected"
        );
        client.connect().await.unwrap();
        client.notify("echo", Some(json!(1))).await.unwrap();
        assert_eq!(client.pending_requests().await, 0);
    }

    /// In-process end whose `connect` takes a while.
    struct SlowConnect {
        inner: InMemoryTransport,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Transport for SlowConnect {
        async fn connect(&self) -> Result<(), RouterError> {
            tokio::time::sleep(self.delay).await;
            self.inner.connect().await
        }
        async fn disconnect(&self) -> Result<(), RouterError> {
            self.inner.disconnect().await
        }
        async fn send(&self, message: Value) -> Result<(), RouterError> {
            self.inner.send(message).await
        }
        fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
            self.inner.subscribe()
        }
        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.inner.events()
        }
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
        fn stats(&self) -> TransportStats {
            self.inner.stats()
        }
        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_transport_opens_cancels_connect() {
        let server = test_server();
        let (client_end, server_end) = InMemoryTransport::pair("slow-open");
        server.attach(Arc::new(server_end)).await.unwrap();
        let client = ClientProtocol::new(
            "slow-open",
            Arc::new(SlowConnect {
                inner: client_end,
                delay: Duration::from_millis(100),
            }),
            ClientSettings::default(),
        );

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state(), ClientState::Connecting);
        client.disconnect().await.unwrap();

        let err = connecting.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(server.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_rehandshakes_and_cancels_in_flight() {
        use crate::protocol::server::test_support::spawn_dropping_socket_server;
        use crate::transport::{SocketTransport, SocketTransportConfig};

        let server = test_server();
        // The first connection is dropped right after the handshake reply.
        let url = spawn_dropping_socket_server(server.clone(), 1).await;
        let transport = SocketTransport::new(
            url,
            SocketTransportConfig {
                auto_reconnect: true,
                reconnect_interval: Duration::from_millis(20),
                max_reconnect_attempts: 5,
                ..SocketTransportConfig::default()
            },
        );
        let client = ClientProtocol::new("flaky", Arc::new(transport), ClientSettings::default());
        let mut events = client.events();

        client.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Ready);
        assert!(!client.server_info().unwrap().methods.contains(&"late".to_string()));

        // Only the next handshake can announce this method.
        server.register_handler("late", handler_fn(|_| async { Ok(json!("here")) }));

        let in_flight = client.request("slow", None).await.unwrap_err();
        match in_flight {
            RouterError::Cancelled { reason } => assert_eq!(reason, CONNECTION_LOST_REASON),
            other => panic!("expected Cancelled, got {other:?}"),
        }

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            let ready = event == ClientEvent::Ready;
            seen.push(event);
            if ready {
                break;
            }
        }
        assert_eq!(seen.first(), Some(&ClientEvent::Reconnecting { attempt: 1 }));
        assert_eq!(client.state(), ClientState::Ready);

        let info = client.server_info().unwrap();
        assert!(info.methods.contains(&"late".to_string()));
        assert_eq!(client.request("late", None).await.unwrap(), json!("here"));

        client.disconnect().await.unwrap();
    }
}
