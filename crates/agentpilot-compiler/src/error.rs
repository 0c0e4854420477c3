//! Error types for the AgentPilot compiler.

use thiserror::Error;

use crate::validator::ValidationIssue;

/// Compilation errors.
///
/// Every variant names the IR node or step that caused it so callers can
/// point the user at the exact place to fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilationError {
    /// A `(plugin_key, operation_type)` pair the registry could not resolve.
    #[error("Unresolved capability {plugin_key}.{operation_type} requested by {node}: {reason}")]
    UnresolvedCapability {
        plugin_key: String,
        operation_type: String,
        node: String,
        reason: String,
    },

    /// A required IR field is absent.
    #[error("Missing required field '{field}' at {node}")]
    MissingField { node: String, field: String },

    /// The IR is structurally inconsistent.
    #[error("Invalid IR: {0}")]
    InvalidIr(String),

    /// No deterministic lowering exists for the IR.
    #[error("Unsupported pattern: {0}")]
    UnsupportedPattern(String),

    /// The compiled workflow failed validation and could not be repaired.
    #[error("Workflow validation failed: {}", summarize(.0))]
    Validation(Vec<ValidationIssue>),

    /// Parse error (YAML, JSON)
    #[error("Parse error: {0}")]
    Parse(String),

    /// The fallback compiler could not produce a workflow.
    #[error("Fallback compiler failed: {0}")]
    Fallback(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl CompilationError {
    pub fn missing(node: impl Into<String>, field: impl Into<String>) -> Self {
        CompilationError::MissingField {
            node: node.into(),
            field: field.into(),
        }
    }
}

/// Result type alias using CompilationError.
pub type CompileResult<T> = Result<T, CompilationError>;

impl From<serde_json::Error> for CompilationError {
    fn from(err: serde_json::Error) -> Self {
        CompilationError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for CompilationError {
    fn from(err: serde_yaml::Error) -> Self {
        CompilationError::Parse(err.to_string())
    }
}

impl From<envy::Error> for CompilationError {
    fn from(err: envy::Error) -> Self {
        CompilationError::Config(err.to_string())
    }
}
