//! Tool Registry (C1): process-wide mapping of tool name → callable + descriptor.
//!
//! Grounded on `tool_protocol.rs`'s `ToolRegistry`/`Tool`/`ToolProtocol` trio, generalized to a
//! process-wide, thread-safe, single-writer/multi-reader contract with soft-unregister
//! semantics (`is_enabled = false` rather than a hard `remove_tool`).

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::model::ToolDescriptor;

/// Errors raised by tool execution, mirroring `tool_protocol.rs`'s `ToolError`.
#[derive(Debug, Clone)]
pub enum ToolError {
    NotFound(String),
    ExecutionFailed(String),
    InvalidParameters(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
            ToolError::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// A callable tool implementation. Application code implements this trait for each concrete
/// tool (search, finance, image generation, ...); this crate only cares about the contract.
#[async_trait]
pub trait ToolCallable: Send + Sync {
    async fn call(&self, parameters: Value) -> Result<Value, Box<dyn Error + Send + Sync>>;
}

struct Entry {
    descriptor: ToolDescriptor,
    callable: Arc<dyn ToolCallable>,
}

/// Process-wide tool registry. Internally `Arc<RwLock<...>>`-backed so that clones share
/// state, unlike a registry owned `&mut self`-only by one caller: many agents resolve and
/// call tools concurrently against a single shared table.
#[derive(Clone)]
pub struct ToolRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register (or replace) a tool. Replacing an existing tool resets `is_enabled = true`
    /// and preserves neither the old descriptor nor its usage counter.
    pub async fn register(&self, descriptor: ToolDescriptor, callable: Arc<dyn ToolCallable>) {
        let mut entries = self.entries.write().await;
        entries.insert(descriptor.name.clone(), Entry { descriptor, callable });
    }

    /// Soft-unregister: sets `is_enabled = false`. Never removes the entry, so references
    /// to it in agent definitions never dangle (§3 ToolDescriptor lifecycle).
    pub async fn unregister(&self, name: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.descriptor.is_enabled = false;
        }
    }

    /// Fetch a tool's descriptor and a handle to invoke it. Disabled tools are still
    /// returned (callers that need "bindable" semantics should check
    /// `descriptor.is_enabled` and treat `false` like not-found at materialization time,
    /// per `resolve_many`).
    pub async fn get(&self, name: &str) -> Option<(ToolDescriptor, Arc<dyn ToolCallable>)> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .map(|e| (e.descriptor.clone(), e.callable.clone()))
    }

    /// List descriptors, optionally filtered to enabled-only, ordered by name for a stable
    /// client-facing listing.
    pub async fn list(&self, enabled_only: bool) -> Vec<ToolDescriptor> {
        let entries = self.entries.read().await;
        let mut out: Vec<ToolDescriptor> = entries
            .values()
            .filter(|e| !enabled_only || e.descriptor.is_enabled)
            .map(|e| e.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Resolve a batch of plain tool names (the `agent:<id>` form is never passed here; C3
    /// filters those out before calling). Returns `(resolved, missing)` rather than failing
    /// outright — §4.1: "agent materialization can decide between hard-fail and best-effort
    /// binding". A registered-but-disabled tool counts as missing.
    pub async fn resolve_many(
        &self,
        names: &[String],
    ) -> (Vec<(ToolDescriptor, Arc<dyn ToolCallable>)>, Vec<String>) {
        let entries = self.entries.read().await;
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            match entries.get(name) {
                Some(e) if e.descriptor.is_enabled => {
                    resolved.push((e.descriptor.clone(), e.callable.clone()));
                }
                _ => missing.push(name.clone()),
            }
        }
        (resolved, missing)
    }

    /// Invoke a tool by name, bumping its usage counter on success. Used by the Runner
    /// Adapter boundary (C6) when a bound callable needs to be executed outside the
    /// Streaming Handler (which never executes tools itself, per §4.7 step 3).
    pub async fn call(&self, name: &str, parameters: Value) -> Result<Value, ToolError> {
        let callable = {
            let entries = self.entries.read().await;
            match entries.get(name) {
                Some(e) if e.descriptor.is_enabled => e.callable.clone(),
                Some(_) => return Err(ToolError::NotFound(name.to_string())),
                None => return Err(ToolError::NotFound(name.to_string())),
            }
        };
        let result = callable
            .call(parameters)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.descriptor.usage_count += 1;
        }
        Ok(result)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolCallable for Echo {
        async fn call(&self, parameters: Value) -> Result<Value, Box<dyn Error + Send + Sync>> {
            Ok(parameters)
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: "echoes its input".to_string(),
            category: "test".to_string(),
            version: "1.0".to_string(),
            author: "test".to_string(),
            is_enabled: true,
            usage_count: 0,
        }
    }

    #[tokio::test]
    async fn resolve_many_reports_missing_without_erroring() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("alpha"), Arc::new(Echo))
            .await;

        let (resolved, missing) = registry
            .resolve_many(&["alpha".to_string(), "beta".to_string()])
            .await;

        assert_eq!(resolved.len(), 1);
        assert_eq!(missing, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn unregister_is_soft_and_excludes_from_resolution() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("alpha"), Arc::new(Echo))
            .await;
        registry.unregister("alpha").await;

        assert!(registry.get("alpha").await.is_some());
        let (resolved, missing) = registry.resolve_many(&["alpha".to_string()]).await;
        assert!(resolved.is_empty());
        assert_eq!(missing, vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn call_bumps_usage_count() {
        let registry = ToolRegistry::new();
        registry
            .register(descriptor("alpha"), Arc::new(Echo))
            .await;

        registry
            .call("alpha", serde_json::json!({"x": 1}))
            .await
            .unwrap();

        let (descriptor, _) = registry.get("alpha").await.unwrap();
        assert_eq!(descriptor.usage_count, 1);
    }
}
