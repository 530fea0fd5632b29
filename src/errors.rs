//! Router error types.
//!
//! Every component in the crate reports failures through [`RouterError`].
//! Each variant maps to a stable, machine-readable string code (see
//! [`codes`]) so that errors can cross the wire inside a response envelope
//! and be matched on by callers without depending on message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Stable Error Codes ──────────────────────────────────────────────────────

/// Well-known error codes carried in response envelopes.
pub mod codes {
    /// The message is not a valid request (e.g. missing `method`).
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Method parameters failed validation.
    pub const INVALID_PARAMS: &str = "invalid_params";
    /// No handler is registered for the method.
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    /// A handler failed with an untyped error.
    pub const INTERNAL_ERROR: &str = "internal_error";
    /// The target connection is not established.
    pub const NOT_CONNECTED: &str = "not_connected";
    /// The addressed server is not registered.
    pub const NOT_FOUND: &str = "not_found";
    /// No response arrived within the request timeout.
    pub const TIMEOUT: &str = "timeout";
    /// A newer request reused the same correlation id.
    pub const SUPERSEDED: &str = "superseded";
    /// The pending request was cancelled (disconnect, shutdown).
    pub const CANCELLED: &str = "cancelled";
    /// Transport-level failure (socket drop, DNS, refused connection).
    pub const CONNECTION_ERROR: &str = "connection_error";
    /// Configuration could not be loaded or failed validation.
    pub const CONFIG_ERROR: &str = "config_error";
}

// ─── RouterError ─────────────────────────────────────────────────────────────

/// Errors that can occur anywhere in the router core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    /// The message is structurally invalid.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Request parameters failed validation.
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    /// No handler is registered for the requested method.
    #[error("method not found: '{method}'")]
    MethodNotFound { method: String },

    /// A handler failed in an unexpected way.
    #[error("internal error: {reason}")]
    InternalError { reason: String },

    /// The operation requires an established connection.
    #[error("not connected: {target}")]
    NotConnected { target: String },

    /// The addressed server id is not registered.
    #[error("server '{id}' not found")]
    NotFound { id: String },

    /// No response arrived before the request deadline.
    #[error("request '{request_id}' timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    /// A newer request was registered under the same correlation id.
    #[error("request '{request_id}' superseded by a newer request with the same id")]
    Superseded { request_id: String },

    /// The request was cancelled before a response arrived.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },

    /// Transport-level failure.
    #[error("connection error for '{target}': {reason}")]
    ConnectionError { target: String, reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The peer answered with an error envelope.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },
}

impl RouterError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            RouterError::InvalidRequest { .. } => codes::INVALID_REQUEST,
            RouterError::InvalidParams { .. } => codes::INVALID_PARAMS,
            RouterError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            RouterError::InternalError { .. } => codes::INTERNAL_ERROR,
            RouterError::NotConnected { .. } => codes::NOT_CONNECTED,
            RouterError::NotFound { .. } => codes::NOT_FOUND,
            RouterError::Timeout { .. } => codes::TIMEOUT,
            RouterError::Superseded { .. } => codes::SUPERSEDED,
            RouterError::Cancelled { .. } => codes::CANCELLED,
            RouterError::ConnectionError { .. } => codes::CONNECTION_ERROR,
            RouterError::ConfigError { .. } => codes::CONFIG_ERROR,
            RouterError::Remote { code, .. } => code,
        }
    }

    /// Whether this error belongs to the protocol-level taxonomy that is
    /// returned to a peer as-is rather than wrapped as `internal_error`.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            RouterError::InvalidRequest { .. }
                | RouterError::InvalidParams { .. }
                | RouterError::MethodNotFound { .. }
                | RouterError::InternalError { .. }
                | RouterError::Remote { .. }
        )
    }

    /// Convert into the error object carried by a response envelope.
    pub fn to_wire(&self) -> ErrorBody {
        match self {
            RouterError::Remote {
                code,
                message,
                details,
            } => ErrorBody {
                code: code.clone(),
                message: message.clone(),
                details: details.clone(),
            },
            other => ErrorBody {
                code: other.code().to_string(),
                message: other.to_string(),
                details: None,
            },
        }
    }

    /// Build an error from a response envelope's error object.
    pub fn from_wire(body: ErrorBody) -> Self {
        RouterError::Remote {
            code: body.code,
            message: body.message,
            details: body.details,
        }
    }

    /// Shorthand for a transport failure against `target`.
    pub fn connection(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RouterError::ConnectionError {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(e: serde_json::Error) -> Self {
        RouterError::InvalidRequest {
            reason: format!("malformed JSON payload: {e}"),
        }
    }
}

// ─── Wire Representation ─────────────────────────────────────────────────────

/// Error object embedded in a failed response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let cases = [
            (
                RouterError::InvalidRequest { reason: "x".into() },
                "invalid_request",
            ),
            (
                RouterError::InvalidParams { reason: "x".into() },
                "invalid_params",
            ),
            (
                RouterError::MethodNotFound { method: "x".into() },
                "method_not_found",
            ),
            (
                RouterError::InternalError { reason: "x".into() },
                "internal_error",
            ),
            (
                RouterError::NotConnected { target: "a".into() },
                "not_connected",
            ),
            (RouterError::NotFound { id: "a".into() }, "not_found"),
            (
                RouterError::Timeout {
                    request_id: "r".into(),
                    timeout_ms: 5,
                },
                "timeout",
            ),
            (
                RouterError::Superseded {
                    request_id: "r".into(),
                },
                "superseded",
            ),
            (
                RouterError::connection("a", "refused"),
                "connection_error",
            ),
        ];

        for (err, code) in cases {
            assert_eq!(err.code(), code, "unexpected code for {err}");
        }
    }

    #[test]
    fn test_remote_error_keeps_peer_code() {
        let err = RouterError::from_wire(ErrorBody {
            code: "method_not_found".into(),
            message: "no handler for 'x'".into(),
            details: Some(serde_json::json!({"method": "x"})),
        });
        assert_eq!(err.code(), "method_not_found");

        let body = err.to_wire();
        assert_eq!(body.code, "method_not_found");
        assert_eq!(body.message, "no handler for 'x'");
        assert_eq!(body.details.unwrap()["method"], "x");
    }

    #[test]
    fn test_to_wire_uses_display_message() {
        let body = RouterError::InvalidParams {
            reason: "missing 'name'".into(),
        }
        .to_wire();
        assert_eq!(body.code, "invalid_params");
        assert!(body.message.contains("missing 'name'"));
        assert!(body.details.is_none());
    }

    #[test]
    fn test_protocol_error_classification() {
        assert!(RouterError::InvalidParams { reason: "x".into() }.is_protocol_error());
        assert!(!RouterError::Timeout {
            request_id: "r".into(),
            timeout_ms: 1
        }
        .is_protocol_error());
        assert!(!RouterError::NotFound { id: "a".into() }.is_protocol_error());
    }

    #[test]
    fn test_error_body_omits_missing_details() {
        let body = ErrorBody {
            code: "timeout".into(),
            message: "late".into(),
            details: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("details"));
    }
}
