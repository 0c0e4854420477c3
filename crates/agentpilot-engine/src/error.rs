//! Error types for the AgentPilot engine.

use agentpilot_tools::ProviderError;
use thiserror::Error;

/// Errors that abort a run.
///
/// Captured provider errors are not represented here: they land in the
/// failing step's `StepOutput.metadata.error` unless the step is fail-fast.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The workflow failed validation before any step ran.
    #[error("Workflow rejected: {}", .0.join("; "))]
    Rejected(Vec<String>),

    #[error("Unresolved reference '{reference}' (available: {})", .available.join(", "))]
    UnresolvedReference {
        reference: String,
        available: Vec<String>,
    },

    #[error("Reference '{reference}' has no field '{segment}' (available: {})", .available.join(", "))]
    MissingField {
        reference: String,
        segment: String,
        available: Vec<String>,
    },

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Step {step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("Transform {step} failed: {source}")]
    Transform {
        step: String,
        #[source]
        source: TransformError,
    },

    #[error("Condition of {step} failed: {source}")]
    Condition {
        step: String,
        #[source]
        source: ConditionError,
    },

    /// Provider error on a fail-fast action.
    #[error("Action {step} failed: {source}")]
    Provider {
        step: String,
        #[source]
        source: ProviderError,
    },

    /// A captured provider error escalated because it happened inside a
    /// scatter item.
    #[error("Action {step} reported an error: {message}")]
    ActionFailed { step: String, message: String },

    #[error("Scatter {step} input is not iterable: {message}")]
    ScatterInput { step: String, message: String },

    #[error("Scatter {step} item {index} failed: {source}")]
    ItemFailed {
        step: String,
        index: usize,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("Gather of {step} failed: {message}")]
    Gather { step: String, message: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Steps never became ready: {}", .0.join(", "))]
    Stalled(Vec<String>),

    #[error("Task join error: {0}")]
    Join(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecutionError {
    /// Attach the id of the step being executed.
    pub fn in_step(self, step: &str) -> Self {
        match self {
            already @ (ExecutionError::Step { .. }
            | ExecutionError::Transform { .. }
            | ExecutionError::Condition { .. }
            | ExecutionError::Provider { .. }
            | ExecutionError::ActionFailed { .. }
            | ExecutionError::ScatterInput { .. }
            | ExecutionError::ItemFailed { .. }
            | ExecutionError::Gather { .. }) => already,
            other => ExecutionError::Step {
                step: step.to_string(),
                source: Box::new(other),
            },
        }
    }
}

/// Transform operation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("{operation} requires an array, found {found}")]
    NotAnArray { operation: String, found: String },

    #[error("{operation} requires an array but the input has no array field (available: {})", .available.join(", "))]
    NoArrayField {
        operation: String,
        available: Vec<String>,
    },

    #[error("transform step has no input")]
    MissingInput,

    #[error("invalid {operation} config: {message}")]
    InvalidConfig { operation: String, message: String },

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("template error: {0}")]
    Template(String),
}

impl TransformError {
    pub fn config(operation: &str, message: impl Into<String>) -> Self {
        TransformError::InvalidConfig {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Condition evaluation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("operator '{operator}' expects a list value, found {found}")]
    ExpectedList { operator: String, found: String },

    #[error("NOT takes exactly one child condition, found {0}")]
    NotArity(usize),
}

/// Sandboxed expression errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("expression parse error: {0}")]
    Parse(String),

    #[error("expression evaluation error: {0}")]
    Eval(String),

    #[error("expression must return {expected}, got {found}")]
    Type { expected: String, found: String },
}

/// Result type alias using ExecutionError.
pub type EngineResult<T> = Result<T, ExecutionError>;

/// JSON type name for error messages.
pub(crate) fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
