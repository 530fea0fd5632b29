//! Receiving side of the protocol.
//!
//! [`ServerProtocol`] validates handshakes, remembers connected clients and
//! dispatches requests through its [`MessageHandlerRegistry`]. Two methods
//! are built in: `handshake` and `tools/list`. Everything else is whatever
//! the embedding application registers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::handlers::{handler_fn, MessageHandler, MessageHandlerRegistry};
use super::tools::ToolCatalog;
use super::types::{
    methods, HandshakeInfo, HandshakeReply, Message, RequestMessage, ResponseMessage,
    ToolsListResult,
};
use crate::errors::RouterError;
use crate::transport::{SocketTransport, SocketTransportConfig, Transport};

// ─── ServerProtocol ──────────────────────────────────────────────────────────

/// Server-side protocol state. Cloning shares it.
#[derive(Clone)]
pub struct ServerProtocol {
    state: Arc<ServerState>,
}

struct ServerState {
    info: HandshakeInfo,
    handlers: MessageHandlerRegistry,
    /// Declared client identities, keyed by handshake message id.
    clients: RwLock<HashMap<String, HandshakeInfo>>,
    tools: Arc<dyn ToolCatalog>,
}

impl ServerProtocol {
    /// Create a server announcing `info` and serving `tools` from `tools/list`.
    pub fn new(info: HandshakeInfo, tools: Arc<dyn ToolCatalog>) -> Self {
        let state = Arc::new(ServerState {
            info,
            handlers: MessageHandlerRegistry::new(),
            clients: RwLock::new(HashMap::new()),
            tools,
        });

        let weak = Arc::downgrade(&state);
        state
            .handlers
            .register_handler(methods::HANDSHAKE, handshake_handler(weak.clone()));
        state
            .handlers
            .register_handler(methods::TOOLS_LIST, tools_list_handler(weak));

        Self { state }
    }

    /// Server identity.
    pub fn info(&self) -> &HandshakeInfo {
        &self.state.info
    }

    /// The dispatch table. Register application methods here.
    pub fn handlers(&self) -> &MessageHandlerRegistry {
        &self.state.handlers
    }

    /// Shorthand for `handlers().register_handler(..)`.
    pub fn register_handler(&self, method: &str, handler: MessageHandler) {
        self.state.handlers.register_handler(method, handler);
    }

    /// Identity a client declared in the handshake with message id `id`.
    pub fn client(&self, id: &str) -> Option<HandshakeInfo> {
        self.state
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All registered clients as `(handshake id, identity)`, sorted by id.
    pub fn connected_clients(&self) -> Vec<(String, HandshakeInfo)> {
        let mut clients: Vec<_> = self
            .state
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients
    }

    /// Dispatch one request and build its response.
    pub async fn handle_message(&self, message: RequestMessage) -> ResponseMessage {
        let id = message.id.clone();
        match self.dispatch(message).await {
            Ok(result) => ResponseMessage::success(id, result),
            Err(e) => {
                tracing::debug!(request_id = %id, code = e.code(), error = %e, "request failed");
                ResponseMessage::failure(id, &e)
            }
        }
    }

    async fn dispatch(&self, message: RequestMessage) -> Result<Value, RouterError> {
        let method = message
            .method
            .clone()
            .ok_or_else(|| RouterError::InvalidRequest {
                reason: "missing 'method'".into(),
            })?;
        let handler = self
            .state
            .handlers
            .get_handler(&method)
            .ok_or(RouterError::MethodNotFound { method })?;
        handler(message).await.map_err(classify_handler_error)
    }

    fn forget_clients(&self, ids: &[String]) {
        let mut clients = self
            .state
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            clients.remove(id);
        }
    }

    // ─── Serving ─────────────────────────────────────────────────────────

    /// Serve one connection until it closes.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<(), RouterError> {
        let label = transport.describe();
        let task = self.attach(transport).await?;
        if let Err(e) = task.await {
            tracing::warn!(transport = %label, error = %e, "connection task failed");
        }
        Ok(())
    }

    /// Connect `transport` and spawn its receive loop.
    ///
    /// The transport is subscribed before it is connected, so nothing the
    /// peer sends first can be lost. The returned task ends when the
    /// connection closes.
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> Result<JoinHandle<()>, RouterError> {
        let inbound = transport.subscribe();
        transport.connect().await?;
        tracing::debug!(transport = %transport.describe(), "serving connection");
        Ok(tokio::spawn(self.clone().receive_loop(transport, inbound)))
    }

    async fn receive_loop(
        self,
        transport: Arc<dyn Transport>,
        mut inbound: tokio::sync::mpsc::UnboundedReceiver<Value>,
    ) {
        let mut handshaken = false;
        let mut handshake_ids: Vec<String> = Vec::new();

        while let Some(raw) = inbound.recv().await {
            let raw_id = raw.get("id").and_then(Value::as_str).map(str::to_string);
            let request = match Message::from_value(raw) {
                Ok(Message::Request(request)) => request,
                Ok(Message::Response(response)) => {
                    tracing::debug!(request_id = %response.id, "ignoring response sent to server");
                    continue;
                }
                Err(e) => {
                    // Reply only if there is an id to correlate with.
                    if let Some(id) = raw_id {
                        reply(&transport, ResponseMessage::failure(id, &e)).await;
                    } else {
                        tracing::warn!(error = %e, "dropping malformed message");
                    }
                    continue;
                }
            };

            let is_handshake = request.method.as_deref() == Some(methods::HANDSHAKE);
            if is_handshake {
                // Inline, so nothing dispatched after it can overtake it.
                let response = self.handle_message(request.clone()).await;
                if response.success {
                    handshaken = true;
                    handshake_ids.push(request.id.clone());
                }
                if request.expects_reply() {
                    reply(&transport, response).await;
                }
                continue;
            }

            if !handshaken {
                if request.expects_reply() {
                    let err = RouterError::InvalidRequest {
                        reason: "handshake required before other methods".into(),
                    };
                    reply(&transport, ResponseMessage::failure(request.id.clone(), &err)).await;
                }
                continue;
            }

            let server = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                let expects_reply = request.expects_reply();
                let response = server.handle_message(request).await;
                if expects_reply {
                    reply(&transport, response).await;
                }
            });
        }

        self.forget_clients(&handshake_ids);
        tracing::debug!(transport = %transport.describe(), "connection closed");
    }
}

async fn reply(transport: &Arc<dyn Transport>, response: ResponseMessage) {
    let value = match serde_json::to_value(&response) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(request_id = %response.id, error = %e, "failed to encode response");
            return;
        }
    };
    if let Err(e) = transport.send(value).await {
        tracing::debug!(request_id = %response.id, error = %e, "could not deliver response");
    }
}

/// Map a handler failure onto the wire taxonomy.
fn classify_handler_error(error: anyhow::Error) -> RouterError {
    match error.downcast::<RouterError>() {
        Ok(e) if e.is_protocol_error() => e,
        Ok(e) => RouterError::InternalError {
            reason: e.to_string(),
        },
        Err(e) => RouterError::InternalError {
            reason: format!("{e:#}"),
        },
    }
}

// ─── Built-in Handlers ───────────────────────────────────────────────────────

fn server_gone() -> anyhow::Error {
    RouterError::InternalError {
        reason: "server is shutting down".into(),
    }
    .into()
}

fn handshake_handler(state: Weak<ServerState>) -> MessageHandler {
    handler_fn(move |message: RequestMessage| {
        let state = state.clone();
        async move {
            let state = state.upgrade().ok_or_else(server_gone)?;
            let client = HandshakeInfo::from_params(message.params.as_ref())?;
            tracing::info!(
                client = %client.name,
                version = %client.version,
                "client handshake accepted"
            );
            state
                .clients
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(message.id.clone(), client);

            let reply = HandshakeReply {
                server: state.info.clone(),
                methods: state.handlers.methods(),
            };
            Ok(serde_json::to_value(reply)?)
        }
    })
}

fn tools_list_handler(state: Weak<ServerState>) -> MessageHandler {
    handler_fn(move |_message: RequestMessage| {
        let state = state.clone();
        async move {
            let state = state.upgrade().ok_or_else(server_gone)?;
            let result = ToolsListResult {
                tools: state.tools.list_tools(),
            };
            Ok(serde_json::to_value(result)?)
        }
    })
}

// ─── SocketServer ────────────────────────────────────────────────────────────

/// WebSocket listener serving every accepted connection with one
/// [`ServerProtocol`].
pub struct SocketServer {
    listener: TcpListener,
    protocol: ServerProtocol,
    config: SocketTransportConfig,
}

impl SocketServer {
    /// Bind to `addr` (e.g. `127.0.0.1:0`).
    pub async fn bind(
        addr: &str,
        protocol: ServerProtocol,
        config: SocketTransportConfig,
    ) -> Result<Self, RouterError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RouterError::connection(addr, e))?;
        Ok(Self {
            listener,
            protocol,
            config,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, RouterError> {
        self.listener
            .local_addr()
            .map_err(|e| RouterError::connection("listener", e))
    }

    /// Accept connections forever on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept loop.
    pub async fn run(self) {
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let protocol = self.protocol.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let stream = tokio_tungstenite::MaybeTlsStream::Plain(tcp);
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "websocket upgrade failed");
                        return;
                    }
                };
                let transport = SocketTransport::accepted(ws, &peer.to_string(), config);
                if let Err(e) = protocol.serve(Arc::new(transport)).await {
                    tracing::warn!(peer = %peer, error = %e, "connection failed");
                }
            });
        }
    }
}

// ─── Test Support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use super::*;

    /// Serve `protocol` over WebSocket on a loopback port and return its
    /// `ws://` url. The first accepted connection is closed by the server
    /// shortly after it has sent `replies` messages; later ones stay open.
    pub(crate) async fn spawn_dropping_socket_server(protocol: ServerProtocol, replies: u64) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((tcp, peer)) = listener.accept().await {
                let stream = tokio_tungstenite::MaybeTlsStream::Plain(tcp);
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let transport = Arc::new(SocketTransport::accepted(
                    ws,
                    &peer.to_string(),
                    SocketTransportConfig::default(),
                ));
                if protocol.attach(transport.clone()).await.is_err() {
                    continue;
                }
                if std::mem::take(&mut first) {
                    tokio::spawn(async move {
                        while transport.stats().messages_sent < replies {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        // Let the last reply land before the close frame.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let _ = transport.disconnect().await;
                    });
                }
            }
        });
        format!("ws://{addr}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

// ─── Tests ───────────────────────────────────────────────────────────────────
