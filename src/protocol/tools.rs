//! Tool catalog served by `tools/list`.
//!
//! Tool descriptors are opaque to the router. The registry only checks that
//! each one carries a non-empty id, name and description, and preserves
//! registration order so `tools/list` output is stable.

use std::sync::{PoisonError, RwLock};

use crate::errors::RouterError;

use super::types::ToolDescriptor;

/// Source of the tool set a server advertises.
pub trait ToolCatalog: Send + Sync {
    /// The full current tool set, unfiltered.
    fn list_tools(&self) -> Vec<ToolDescriptor>;
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// In-memory tool catalog keyed by tool id.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with `tools`.
    pub fn with_tools(tools: Vec<ToolDescriptor>) -> Result<Self, RouterError> {
        let registry = Self::new();
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Add or replace a tool. Replacing keeps the original position.
    pub fn register(&self, tool: ToolDescriptor) -> Result<(), RouterError> {
        for (field, value) in [
            ("id", &tool.id),
            ("name", &tool.name),
            ("description", &tool.description),
        ] {
            if value.trim().is_empty() {
                return Err(RouterError::InvalidParams {
                    reason: format!("tool '{field}' must not be empty"),
                });
            }
        }

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        match tools.iter_mut().find(|t| t.id == tool.id) {
            Some(existing) => *existing = tool,
            None => tools.push(tool),
        }
        Ok(())
    }

    /// Remove a tool by id. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let before = tools.len();
        tools.retain(|t| t.id != id);
        tools.len() != before
    }

    /// Look up a tool by id.
    pub fn get(&self, id: &str) -> Option<ToolDescriptor> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ToolCatalog for ToolRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list_in_order() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::new("screenshot", "Screenshot", "Capture the screen"))
            .unwrap();
        registry
            .register(ToolDescriptor::new("clipboard", "Clipboard", "Read the clipboard"))
            .unwrap();

        let ids: Vec<String> = registry.list_tools().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["screenshot", "clipboard"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_replace_keeps_position() {
        let registry = ToolRegistry::with_tools(vec![
            ToolDescriptor::new("a", "A", "first"),
            ToolDescriptor::new("b", "B", "second"),
        ])
        .unwrap();
        registry
            .register(ToolDescriptor::new("a", "A", "updated"))
            .unwrap();

        let tools = registry.list_tools();
        assert_eq!(tools[0].description, "updated");
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn test_rejects_incomplete_descriptor() {
        let registry = ToolRegistry::new();
        let err = registry
            .register(ToolDescriptor::new("x", "", "desc"))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_params");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry =
            ToolRegistry::with_tools(vec![ToolDescriptor::new("a", "A", "first")]).unwrap();
        assert!(registry.get("a").is_some());
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get("a").is_none());
    }
}
