//! Step and run results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Execution facts about one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetadata {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timing_ms: u64,
}

/// Output of one executed step, as seen by references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub step_id: String,

    /// Plugin key for actions, the step type otherwise.
    pub capability: String,

    /// Operation type for actions, the transform or gather operation otherwise.
    pub operation: String,

    #[serde(default)]
    pub data: serde_json::Value,

    pub metadata: StepMetadata,
}

impl StepOutput {
    pub fn success(
        step_id: impl Into<String>,
        capability: impl Into<String>,
        operation: impl Into<String>,
        data: serde_json::Value,
        timing_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            capability: capability.into(),
            operation: operation.into(),
            data,
            metadata: StepMetadata {
                success: true,
                error: None,
                timing_ms,
            },
        }
    }

    /// Output carrying an error marker instead of data.
    pub fn failure(
        step_id: impl Into<String>,
        capability: impl Into<String>,
        operation: impl Into<String>,
        error: impl Into<String>,
        timing_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            capability: capability.into(),
            operation: operation.into(),
            data: serde_json::Value::Null,
            metadata: StepMetadata {
                success: false,
                error: Some(error.into()),
                timing_ms,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.metadata.success
    }

    /// Whether a JSON value looks like a step output: a `stepId` next to
    /// `data`. `metadata` is not required.
    pub fn is_output_shaped(value: &serde_json::Value) -> bool {
        value
            .as_object()
            .map(|o| o.contains_key("stepId") && o.contains_key("data"))
            .unwrap_or(false)
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Every step ran but at least one captured an error.
    PartiallySucceeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::PartiallySucceeded => write!(f, "partially_succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A provider error captured during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    pub step_id: String,
    pub capability: String,
    pub operation: String,
    pub message: String,

    /// Scatter item index when the action ran inside a scatter body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
}

/// Result of running a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub steps_completed: usize,
    pub outputs: BTreeMap<String, StepOutput>,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_errors: Vec<ProviderFailure>,

    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn output(&self, step_id: &str) -> Option<&StepOutput> {
        self.outputs.get(step_id)
    }

    /// `data` of a step output.
    pub fn data(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.outputs.get(step_id).map(|o| &o.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_output_wire_format() {
        let output = StepOutput::success("step1", "sheets", "read", json!([1, 2]), 3);
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(
            value,
            json!({
                "stepId": "step1",
                "capability": "sheets",
                "operation": "read",
                "data": [1, 2],
                "metadata": {"success": true, "timingMs": 3}
            })
        );
        assert!(StepOutput::is_output_shaped(&value));
        assert!(!StepOutput::is_output_shaped(&json!({"data": []})));
        assert!(StepOutput::is_output_shaped(&json!({"stepId": "step2", "data": {}})));
    }

    #[test]
    fn test_failure_marker() {
        let output = StepOutput::failure("step4", "mail", "send_email", "smtp down", 0);
        assert!(!output.is_success());
        assert_eq!(output.data, serde_json::Value::Null);
        assert_eq!(output.metadata.error.as_deref(), Some("smtp down"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(RunStatus::PartiallySucceeded).unwrap(),
            json!("partially_succeeded")
        );
    }
}
