//! Capability registry and dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::schema::OperationSchema;

/// An external integration exposing one or more operations.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the capability's plugin key (e.g., "google-mail").
    fn plugin_key(&self) -> &str;

    /// Schemas of every operation this capability exposes.
    fn operations(&self) -> Vec<OperationSchema>;

    /// Execute one operation with fully resolved parameters.
    async fn execute(
        &self,
        operation_type: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}

/// Pure schema resolution, safe to call at compile time and to cache.
pub trait CapabilityCatalog: Send + Sync {
    fn resolve(&self, plugin_key: &str, operation_type: &str)
        -> Result<OperationSchema, ProviderError>;
}

/// Capability execution used by the runtime.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(
        &self,
        plugin_key: &str,
        operation_type: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}

/// Registry of available capabilities.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    schemas: HashMap<(String, String), OperationSchema>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
            schemas: HashMap::new(),
        }
    }

    /// Register a capability and cache its operation schemas.
    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        self.register_arc(Arc::new(capability));
    }

    /// Register a shared capability handle.
    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let key = capability.plugin_key().to_string();
        self.schemas.retain(|(plugin, _), _| plugin != &key);
        for op in capability.operations() {
            self.schemas
                .insert((key.clone(), op.operation_type.clone()), op);
        }
        tracing::debug!(plugin_key = %key, "Capability registered");
        self.capabilities.insert(key, capability);
    }

    /// Get a capability by plugin key.
    pub fn get(&self, plugin_key: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(plugin_key).cloned()
    }

    /// Check if a capability is registered.
    pub fn has(&self, plugin_key: &str) -> bool {
        self.capabilities.contains_key(plugin_key)
    }

    /// List all registered plugin keys, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }
}

impl CapabilityCatalog for CapabilityRegistry {
    fn resolve(
        &self,
        plugin_key: &str,
        operation_type: &str,
    ) -> Result<OperationSchema, ProviderError> {
        if !self.has(plugin_key) {
            return Err(ProviderError::NotFound(plugin_key.to_string()));
        }
        self.schemas
            .get(&(plugin_key.to_string(), operation_type.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::OperationNotFound {
                plugin_key: plugin_key.to_string(),
                operation_type: operation_type.to_string(),
            })
    }
}

#[async_trait]
impl CapabilityExecutor for CapabilityRegistry {
    async fn execute(
        &self,
        plugin_key: &str,
        operation_type: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let capability = self
            .get(plugin_key)
            .ok_or_else(|| ProviderError::NotFound(plugin_key.to_string()))?;

        // Operation existence is checked against the cached schemas so a
        // provider never receives an operation it did not declare.
        self.resolve(plugin_key, operation_type)?;

        capability.execute(operation_type, &params).await
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.list())
            .finish()
    }
}
