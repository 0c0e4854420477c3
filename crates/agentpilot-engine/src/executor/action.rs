//! Action steps: one capability call.

use std::time::Instant;

use agentpilot_compiler::workflow::ActionStep;
use serde_json::Value;
use tracing::{debug, warn};

use super::StepExecutor;
use crate::context::ExecutionContext;
use crate::error::{EngineResult, ExecutionError};
use crate::output::{ProviderFailure, StepOutput};

impl StepExecutor {
    /// Resolve parameters, call the capability and wrap the result.
    ///
    /// A provider error becomes a failed `StepOutput` and is recorded on
    /// the run, unless the step or the engine is fail-fast.
    pub async fn run_action(
        &self,
        step_id: &str,
        action: &ActionStep,
        ctx: &ExecutionContext,
    ) -> EngineResult<StepOutput> {
        let started = Instant::now();

        let mut params = serde_json::Map::new();
        for (name, value) in &action.params {
            let resolved = self
                .resolve_value(value, ctx)
                .map_err(|e| e.in_step(step_id))?;
            params.insert(name.clone(), resolved);
        }

        debug!(
            step = step_id,
            plugin = %action.plugin_key,
            operation = %action.operation_type,
            item = ?ctx.item_index(),
            "Calling capability"
        );

        let result = self
            .capabilities
            .execute(
                &action.plugin_key,
                &action.operation_type,
                Value::Object(params),
            )
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(data) => Ok(StepOutput::success(
                step_id,
                &action.plugin_key,
                &action.operation_type,
                data,
                elapsed,
            )),
            Err(source) if action.fail_fast || self.fail_fast_actions => {
                Err(ExecutionError::Provider {
                    step: step_id.to_string(),
                    source,
                })
            }
            Err(source) => {
                let message = source.to_string();
                warn!(
                    step = step_id,
                    plugin = %action.plugin_key,
                    operation = %action.operation_type,
                    error = %message,
                    "Provider error captured"
                );
                ctx.record_failure(ProviderFailure {
                    step_id: step_id.to_string(),
                    capability: action.plugin_key.clone(),
                    operation: action.operation_type.clone(),
                    message: message.clone(),
                    item_index: ctx.item_index(),
                });
                Ok(StepOutput::failure(
                    step_id,
                    &action.plugin_key,
                    &action.operation_type,
                    message,
                    elapsed,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::executor;
    use super::*;
    use crate::config::EngineConfig;
    use agentpilot_tools::RecordingSink;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn send(fail_fast: bool) -> ActionStep {
        let mut params = BTreeMap::new();
        params.insert("to".to_string(), json!("a@x.com"));
        params.insert("body".to_string(), json!("{{step1.data.rows}}"));
        ActionStep {
            plugin_key: "mail".to_string(),
            operation_type: "send_email".to_string(),
            params,
            fail_fast,
        }
    }

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(0);
        ctx.insert(StepOutput::success("step1", "sheets", "read", json!({"rows": [1, 2]}), 0));
        ctx
    }

    #[tokio::test]
    async fn test_action_delivers_resolved_params() {
        let sink = RecordingSink::email("mail");
        let exec = executor(sink.clone(), &EngineConfig::default());

        let output = exec.run_action("step2", &send(false), &context()).await.unwrap();
        assert!(output.is_success());
        assert_eq!(output.capability, "mail");
        assert_eq!(sink.deliveries()[0].params["body"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_provider_error_is_captured() {
        let exec = executor(RecordingSink::email("mail").failing("smtp down"), &EngineConfig::default());
        let ctx = context();

        let output = exec.run_action("step2", &send(false), &ctx).await.unwrap();
        assert!(!output.is_success());
        assert!(output.metadata.error.unwrap().contains("smtp down"));
        assert_eq!(ctx.provider_failures().len(), 1);
        assert_eq!(ctx.provider_failures()[0].step_id, "step2");
    }

    #[tokio::test]
    async fn test_fail_fast_step_raises() {
        let exec = executor(RecordingSink::email("mail").failing("smtp down"), &EngineConfig::default());
        let err = exec.run_action("step2", &send(true), &context()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Provider { ref step, .. } if step == "step2"));
    }

    #[tokio::test]
    async fn test_fail_fast_config_raises() {
        let config = EngineConfig {
            fail_fast_actions: true,
            ..EngineConfig::default()
        };
        let exec = executor(RecordingSink::email("mail").failing("smtp down"), &config);
        assert!(exec.run_action("step2", &send(false), &context()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_capability_is_a_provider_error() {
        let exec = executor(RecordingSink::email("mail"), &EngineConfig::default());
        let mut action = send(false);
        action.plugin_key = "fax".to_string();
        let output = exec.run_action("step2", &action, &context()).await.unwrap();
        assert!(output.metadata.error.unwrap().contains("fax"));
    }
}
