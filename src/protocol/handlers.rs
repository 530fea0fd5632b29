//! Method dispatch table for the server side.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::types::RequestMessage;

/// An async method handler.
///
/// Handlers return `anyhow::Result` so they can use `?` on anything. A
/// returned [`crate::errors::RouterError`] that belongs to the protocol
/// taxonomy reaches the caller unchanged; every other error is reported as
/// `internal_error`.
pub type MessageHandler =
    Arc<dyn Fn(RequestMessage) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |message: RequestMessage| f(message).boxed())
}

// ─── MessageHandlerRegistry ──────────────────────────────────────────────────

/// Exact-match `method → handler` table.
///
/// Cloning shares the same table.
#[derive(Clone, Default)]
pub struct MessageHandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, MessageHandler>>>,
}

impl MessageHandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`. A later registration for the same
    /// method replaces the earlier one.
    pub fn register_handler(&self, method: &str, handler: MessageHandler) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), handler)
            .is_some();
        if replaced {
            tracing::debug!(method, "replaced message handler");
        }
    }

    /// Remove the handler for `method`. Returns whether one was registered.
    pub fn unregister_handler(&self, method: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
            .is_some()
    }

    /// Look up the handler for `method`.
    pub fn get_handler(&self, method: &str) -> Option<MessageHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }
}

impl std::fmt::Debug for MessageHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: Value) -> MessageHandler {
        handler_fn(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = MessageHandlerRegistry::new();
        registry.register_handler("echo", handler_fn(|msg| async move {
            Ok(msg.params.unwrap_or(Value::Null))
        }));

        let handler = registry.get_handler("echo").unwrap();
        let out = handler(RequestMessage::new("1", "echo", Some(json!({"a": 1}))))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
        assert!(registry.get_handler("Echo").is_none());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = MessageHandlerRegistry::new();
        registry.register_handler("m", constant(json!("first")));
        registry.register_handler("m", constant(json!("second")));

        let handler = registry.get_handler("m").unwrap();
        let out = handler(RequestMessage::new("1", "m", None)).await.unwrap();
        assert_eq!(out, json!("second"));
        assert_eq!(registry.methods(), vec!["m"]);
    }

    #[test]
    fn test_unregister_and_methods_sorted() {
        let registry = MessageHandlerRegistry::new();
        registry.register_handler("tools/list", constant(Value::Null));
        registry.register_handler("handshake", constant(Value::Null));
        registry.register_handler("echo", constant(Value::Null));

        assert_eq!(registry.methods(), vec!["echo", "handshake", "tools/list"]);
        assert!(registry.unregister_handler("echo"));
        assert!(!registry.unregister_handler("echo"));
        assert_eq!(registry.methods(), vec!["handshake", "tools/list"]);
    }

    #[test]
    fn test_clones_share_table() {
        let registry = MessageHandlerRegistry::new();
        let other = registry.clone();
        other.register_handler("m", constant(Value::Null));
        assert!(registry.get_handler("m").is_some());
    }
}
