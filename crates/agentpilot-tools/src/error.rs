//! Capability provider error types.

use thiserror::Error;

/// Errors raised while resolving or executing a capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// No capability registered under this plugin key.
    #[error("Capability not found: {0}")]
    NotFound(String),

    /// The capability exists but does not expose the operation.
    #[error("Operation '{operation_type}' not found on capability '{plugin_key}'")]
    OperationNotFound {
        plugin_key: String,
        operation_type: String,
    },

    /// Parameters rejected by the provider.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Provider-side failure.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Provider call timed out.
    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

impl ProviderError {
    /// Returns true if the error means the capability could not be resolved at all.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ProviderError::NotFound(_) | ProviderError::OperationNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Json(e.to_string())
    }
}
