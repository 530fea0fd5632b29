//! Wire types shared by the client and server sides.
//!
//! Messages are JSON objects. Requests carry `{id, method?, params?, ...}`,
//! responses carry `{id, success, result?, error?}`. Unknown request fields
//! are preserved so forwarded payloads survive a round trip untouched.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ErrorBody, RouterError};

// ─── Well-known Methods ──────────────────────────────────────────────────────

/// Built-in method names.
pub mod methods {
    /// First message on every connection.
    pub const HANDSHAKE: &str = "handshake";
    /// Returns `{tools: ToolDescriptor[]}`.
    pub const TOOLS_LIST: &str = "tools/list";
}

// ─── Correlation IDs ─────────────────────────────────────────────────────────

/// Per-process sequence mixed into correlation ids.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Generate a fresh correlation id.
///
/// Format: `{unix_millis_hex}-{sequence}-{random8}`. The time prefix keeps ids
/// roughly sortable; the sequence and random suffix rule out collisions
/// between rapid calls in one process and across processes.
pub fn next_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let random = uuid::Uuid::new_v4().simple().to_string();
    let suffix = random.get(..8).unwrap_or(&random);
    format!("{millis:x}-{seq}-{suffix}")
}

// ─── Envelopes ───────────────────────────────────────────────────────────────

/// Request (or notification) envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation id. Empty for fire-and-forget notifications.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Any additional fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestMessage {
    /// Build a request for `method` with a given correlation id.
    pub fn new(id: impl Into<String>, method: &str, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: Some(method.to_string()),
            params,
            extra: Map::new(),
        }
    }

    /// Build a notification: no correlation id, no reply expected.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self::new(String::new(), method, params)
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseMessage {
    /// Successful response carrying `result`.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response carrying `error`.
    pub fn failure(id: impl Into<String>, error: &RouterError) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.to_wire()),
        }
    }

    /// Settle this response into the caller-facing result.
    pub fn into_result(self) -> Result<Value, RouterError> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(match self.error {
            Some(body) => RouterError::from_wire(body),
            None => RouterError::InternalError {
                reason: "response marked unsuccessful without an error object".into(),
            },
        })
    }
}

/// Any inbound message. Responses are recognised by their `success` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Response(ResponseMessage),
    Request(RequestMessage),
}

impl Message {
    /// Parse a raw JSON value into a message.
    pub fn from_value(value: Value) -> Result<Self, RouterError> {
        if !value.is_object() {
            return Err(RouterError::InvalidRequest {
                reason: "message must be a JSON object".into(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Identity exchanged once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

impl HandshakeInfo {
    /// Create an identity.
    pub fn new(name: &str, version: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Parse and validate handshake params.
    ///
    /// `name`, `version` and `capabilities` must all be present and non-empty.
    pub fn from_params(params: Option<&Value>) -> Result<Self, RouterError> {
        let params = params
            .and_then(Value::as_object)
            .ok_or_else(|| RouterError::InvalidParams {
                reason: "handshake params must be an object".into(),
            })?;

        let name = non_empty_str(params, "name")?;
        let version = non_empty_str(params, "version")?;

        let capabilities = params
            .get("capabilities")
            .and_then(Value::as_array)
            .ok_or_else(|| RouterError::InvalidParams {
                reason: "missing 'capabilities'".into(),
            })?;
        if capabilities.is_empty() {
            return Err(RouterError::InvalidParams {
                reason: "'capabilities' must not be empty".into(),
            });
        }
        let capabilities = capabilities
            .iter()
            .map(|c| match c.as_str() {
                Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
                _ => Err(RouterError::InvalidParams {
                    reason: "'capabilities' entries must be non-empty strings".into(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            version,
            capabilities,
        })
    }
}

fn non_empty_str(params: &Map<String, Value>, field: &str) -> Result<String, RouterError> {
    match params.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        Some(_) => Err(RouterError::InvalidParams {
            reason: format!("'{field}' must not be empty"),
        }),
        None => Err(RouterError::InvalidParams {
            reason: format!("missing '{field}'"),
        }),
    }
}

/// Server's answer to a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Server identity.
    pub server: HandshakeInfo,
    /// Methods the server currently dispatches, sorted.
    #[serde(default)]
    pub methods: Vec<String>,
}

// ─── Tools ───────────────────────────────────────────────────────────────────

/// Opaque tool descriptor. Only `id`, `name` and `description` are looked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Everything else the server attached, untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolDescriptor {
    /// Create a descriptor with no extra fields.
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            extra: Map::new(),
        }
    }
}

/// Result payload of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDescriptor>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| next_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_request_serialization_omits_absent_fields() {
        let req = RequestMessage::new("r1", "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":\"r1\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_request_preserves_extra_fields() {
        let raw = json!({"id": "a", "method": "x", "trace": "t-1"});
        let req: RequestMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(req.extra["trace"], "t-1");
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["trace"], "t-1");
    }

    #[test]
    fn test_message_distinguishes_responses() {
        let resp = Message::from_value(json!({"id": "a", "success": true, "result": 1})).unwrap();
        assert!(matches!(resp, Message::Response(_)));

        let req = Message::from_value(json!({"id": "a", "method": "m"})).unwrap();
        assert!(matches!(req, Message::Request(_)));

        assert!(Message::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_failed_response_into_result() {
        let resp = ResponseMessage::failure(
            "a",
            &RouterError::MethodNotFound {
                method: "nope".into(),
            },
        );
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code(), "method_not_found");
    }

    #[test]
    fn test_success_without_result_is_null() {
        let resp = ResponseMessage {
            id: "a".into(),
            success: true,
            result: None,
            error: None,
        };
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_handshake_params_valid() {
        let params = json!({"name": "client", "version": "1.0", "capabilities": ["tools"]});
        let info = HandshakeInfo::from_params(Some(&params)).unwrap();
        assert_eq!(info.name, "client");
        assert_eq!(info.capabilities, vec!["tools"]);
    }

    #[test]
    fn test_handshake_params_missing_fields() {
        let cases = [
            json!({"version": "1.0", "capabilities": ["tools"]}),
            json!({"name": "c", "capabilities": ["tools"]}),
            json!({"name": "c", "version": "1.0"}),
            json!({"name": "", "version": "1.0", "capabilities": ["tools"]}),
            json!({"name": "c", "version": "1.0", "capabilities": []}),
            json!({"name": "c", "version": "1.0", "capabilities": [""]}),
            json!("not an object"),
        ];
        for params in cases {
            let err = HandshakeInfo::from_params(Some(&params)).unwrap_err();
            assert_eq!(err.code(), "invalid_params", "accepted {params}");
        }
        assert!(HandshakeInfo::from_params(None).is_err());
    }

    #[test]
    fn test_tool_descriptor_keeps_opaque_fields() {
        let raw = json!({
            "id": "screenshot",
            "name": "Screenshot",
            "description": "Capture the screen",
            "inputSchema": {"type": "object"}
        });
        let tool: ToolDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(tool.id, "screenshot");
        assert_eq!(tool.extra["inputSchema"]["type"], "object");
    }
}
