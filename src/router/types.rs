//! Router data model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RouterError;

// ─── ServerRecord ────────────────────────────────────────────────────────────

/// A known backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique within the router.
    pub id: String,
    pub name: String,
    /// Where to reach the server (`ws://`, `http://`, `memory://`, ...).
    #[serde(alias = "url")]
    pub address: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ServerRecord {
    pub fn new(id: &str, name: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            metadata: Map::new(),
        }
    }

    /// Builder-style metadata entry.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Alias for `address`.
    pub fn url(&self) -> &str {
        &self.address
    }

    /// Reject records the router cannot work with.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.id.trim().is_empty() {
            return Err(RouterError::InvalidParams {
                reason: "server id must not be empty".into(),
            });
        }
        if self.address.trim().is_empty() {
            return Err(RouterError::InvalidParams {
                reason: format!("server '{}' has no address", self.id),
            });
        }
        Ok(())
    }
}

// ─── RouterEvent ─────────────────────────────────────────────────────────────

/// Lifecycle notifications published by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    Registered { server_id: String },
    Unregistered { server_id: String },
    Connected { server_id: String },
    Disconnected { server_id: String },
    ConnectionError { server_id: String, error: RouterError },
    Reconnecting { server_id: String, attempt: u32 },
}

impl RouterEvent {
    /// Topic name, e.g. `server:connected`.
    pub fn name(&self) -> &'static str {
        match self {
            RouterEvent::Registered { .. } => "server:registered",
            RouterEvent::Unregistered { .. } => "server:unregistered",
            RouterEvent::Connected { .. } => "server:connected",
            RouterEvent::Disconnected { .. } => "server:disconnected",
            RouterEvent::ConnectionError { .. } => "server:connection-error",
            RouterEvent::Reconnecting { .. } => "server:reconnecting",
        }
    }

    /// The server this event is about.
    pub fn server_id(&self) -> &str {
        match self {
            RouterEvent::Registered { server_id }
            | RouterEvent::Unregistered { server_id }
            | RouterEvent::Connected { server_id }
            | RouterEvent::Disconnected { server_id }
            | RouterEvent::ConnectionError { server_id, .. }
            | RouterEvent::Reconnecting { server_id, .. } => server_id,
        }
    }
}
