//! Address → transport mapping.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use url::Url;

use super::stdio::STDIO_SCHEME;
use super::{
    InMemoryTransport, SocketTransport, SocketTransportConfig, StdioCommand, StdioTransport,
    Transport,
};
use crate::errors::RouterError;
use crate::protocol::ServerProtocol;

/// Scheme for servers living in the same process.
pub const MEMORY_SCHEME: &str = "memory";

/// Creates a fresh, unconnected transport for a server address.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, server_id: &str, address: &str)
        -> Result<Arc<dyn Transport>, RouterError>;
}

// ─── DefaultTransportFactory ─────────────────────────────────────────────────

/// Maps addresses by scheme:
///
/// | scheme            | transport                                   |
/// |-------------------|---------------------------------------------|
/// | `ws`, `wss`       | [`SocketTransport`] to the same URL         |
/// | `http`, `https`   | [`SocketTransport`] to the `ws`/`wss` URL   |
/// | `memory://<name>` | in-process pair served by a registered server |
/// | `stdio:<program> [args]` | [`StdioTransport`] to a spawned child |
pub struct DefaultTransportFactory {
    socket: SocketTransportConfig,
    in_process: RwLock<HashMap<String, ServerProtocol>>,
}

impl DefaultTransportFactory {
    pub fn new(socket: SocketTransportConfig) -> Self {
        Self {
            socket,
            in_process: RwLock::new(HashMap::new()),
        }
    }

    /// Make `server` reachable at `memory://<name>`.
    pub fn register_in_process(&self, name: &str, server: ServerProtocol) {
        self.in_process
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), server);
    }

    /// Remove an in-process server. Existing connections are unaffected.
    pub fn unregister_in_process(&self, name: &str) -> bool {
        self.in_process
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    async fn in_process_transport(
        &self,
        server_id: &str,
        name: &str,
    ) -> Result<Arc<dyn Transport>, RouterError> {
        let server = self
            .in_process
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                RouterError::connection(server_id, format!("no in-process server named '{name}'"))
            })?;

        let (client_end, server_end) = InMemoryTransport::pair(name);
        server.attach(Arc::new(server_end)).await?;
        Ok(Arc::new(client_end))
    }
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new(SocketTransportConfig::default())
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        server_id: &str,
        address: &str,
    ) -> Result<Arc<dyn Transport>, RouterError> {
        let is_stdio = address
            .strip_prefix(STDIO_SCHEME)
            .is_some_and(|rest| rest.starts_with(':'));
        if is_stdio {
            let command = StdioCommand::from_address(address).ok_or_else(|| {
                RouterError::connection(server_id, format!("no command in address '{address}'"))
            })?;
            tracing::debug!(server = server_id, program = %command.program, "creating stdio transport");
            return Ok(Arc::new(StdioTransport::new(
                command,
                self.socket.max_message_size,
            )));
        }

        let url = Url::parse(address)
            .map_err(|e| RouterError::connection(server_id, format!("invalid address '{address}': {e}")))?;

        if url.scheme() == MEMORY_SCHEME {
            let name = url.host_str().unwrap_or_default();
            return self.in_process_transport(server_id, name).await;
        }

        let ws_url = websocket_url(server_id, url)?;
        tracing::debug!(server = server_id, url = %ws_url, "creating socket transport");
        Ok(Arc::new(SocketTransport::new(
            ws_url.to_string(),
            self.socket.clone(),
        )))
    }
}

/// Rewrite an address to its WebSocket form.
pub fn websocket_url(server_id: &str, mut url: Url) -> Result<Url, RouterError> {
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(RouterError::connection(
                server_id,
                format!("unsupported address scheme '{other}'"),
            ))
        }
    };
    url.set_scheme(scheme).map_err(|()| {
        RouterError::connection(server_id, format!("cannot rewrite '{url}' to {scheme}"))
    })?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandshakeInfo, ToolRegistry};

    fn parse(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_websocket_url_mapping() {
        assert_eq!(
            websocket_url("a", parse("http://10.0.0.5:8080")).unwrap().as_str(),
            "ws://10.0.0.5:8080/"
        );
        assert_eq!(
            websocket_url("a", parse("https://example.com/mcp")).unwrap().as_str(),
            "wss://example.com/mcp"
        );
        assert_eq!(
            websocket_url("a", parse("ws://localhost:9000/x")).unwrap().as_str(),
            "ws://localhost:9000/x"
        );
        let err = websocket_url("a", parse("ftp://host")).unwrap_err();
        assert_eq!(err.code(), "connection_error");
    }

    #[tokio::test]
    async fn test_unknown_in_process_server() {
        let factory = DefaultTransportFactory::default();
        let err = factory.create("a", "memory://ghost").await.err().unwrap();
        assert_eq!(err.code(), "connection_error");
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let factory = DefaultTransportFactory::default();
        let err = factory.create("a", "not a url").await.err().unwrap();
        assert_eq!(err.code(), "connection_error");
    }

    #[tokio::test]
    async fn test_in_process_transport_is_served() {
        let factory = DefaultTransportFactory::default();
        let server = ServerProtocol::new(
            HandshakeInfo::new("local", "1.0", &["tools"]),
            Arc::new(ToolRegistry::new()),
        );
        factory.register_in_process("local", server);

        let transport = factory.create("a", "memory://local").await.unwrap();
        let mut inbound = transport.subscribe();
        transport.connect().await.unwrap();
        transport
            .send(serde_json::json!({"id": "h", "method": "handshake",
                "params": {"name": "c", "version": "1", "capabilities": ["tools"]}}))
            .await
            .unwrap();
        let reply = inbound.recv().await.unwrap();
        assert_eq!(reply["success"], true);

        assert!(factory.unregister_in_process("local"));
    }

    #[tokio::test]
    async fn test_stdio_address_creates_child_transport() {
        let factory = DefaultTransportFactory::default();
        let transport = factory.create("a", "stdio:cat -u").await.unwrap();
        assert_eq!(transport.describe(), "stdio://cat");
        assert!(!transport.is_connected());
        assert!(!transport.reconnects());

        let err = factory.create("a", "stdio:  ").await.err().unwrap();
        assert_eq!(err.code(), "connection_error");
    }
}
