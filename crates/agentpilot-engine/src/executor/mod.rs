//! Step execution.
//!
//! The executor runs one leaf step (an action or a transform) or evaluates
//! the condition of a conditional step against an `ExecutionContext`.
//! Scheduling, nested bodies and scatter fan-out belong to the runner.

mod action;
pub mod extract;
mod transform;

use std::sync::Arc;

use agentpilot_compiler::workflow::{reference, Condition};
use agentpilot_tools::CapabilityExecutor;
use serde_json::Value;

use crate::condition;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineResult, ExecutionError};
use crate::expression::ExpressionEngine;
use crate::template::TemplateRenderer;

/// Executes individual steps.
pub struct StepExecutor {
    capabilities: Arc<dyn CapabilityExecutor>,
    expressions: ExpressionEngine,
    templates: TemplateRenderer,
    fail_fast_actions: bool,
}

impl StepExecutor {
    pub fn new(capabilities: Arc<dyn CapabilityExecutor>, config: &EngineConfig) -> Self {
        Self {
            capabilities,
            expressions: ExpressionEngine::new(config.max_expression_operations),
            templates: TemplateRenderer::new(),
            fail_fast_actions: config.fail_fast_actions,
        }
    }

    pub fn expressions(&self) -> &ExpressionEngine {
        &self.expressions
    }

    /// Resolve every reference inside a JSON value.
    ///
    /// A string that is exactly one reference yields the raw referenced
    /// value; a string mixing text and references is rendered as a template.
    pub fn resolve_value(&self, value: &Value, ctx: &ExecutionContext) -> EngineResult<Value> {
        match value {
            Value::String(s) => {
                if let Some(path) = reference::exact(s) {
                    ctx.resolve_path(path)
                } else if reference::is_template(s) {
                    self.render(s, &Value::Object(ctx.template_context()))
                        .map(Value::String)
                } else {
                    Ok(value.clone())
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v, ctx))
                .collect::<EngineResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            _ => Ok(value.clone()),
        }
    }

    pub fn render(&self, template: &str, context: &Value) -> EngineResult<String> {
        self.templates
            .render(template, context)
            .map_err(|e| ExecutionError::Template(e.to_string()))
    }

    /// Evaluate the condition of a conditional step. Field paths are rooted
    /// at a step id or a binding.
    pub fn evaluate_condition(
        &self,
        step_id: &str,
        condition: &Condition,
        ctx: &ExecutionContext,
    ) -> EngineResult<bool> {
        let taken = condition::evaluate(condition, ctx).map_err(|source| {
            ExecutionError::Condition {
                step: step_id.to_string(),
                source,
            }
        })?;
        tracing::debug!(step = step_id, taken, "Evaluated condition");
        Ok(taken)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use agentpilot_tools::{
        CapabilityRegistry, OperationSchema, OutputSchema, ParamType, ParameterSpec,
        RecordingSink, StaticSource,
    };
    use serde_json::json;

    use super::StepExecutor;
    use crate::config::EngineConfig;

    /// Registry with a `sheets` source and a `mail` sink.
    pub fn registry(sink: RecordingSink) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            StaticSource::new("sheets").with_operation(
                OperationSchema::new("", "read")
                    .with_parameters(vec![ParameterSpec::optional("range", ParamType::String)])
                    .with_output(OutputSchema::with_items_field("rows")),
                json!({"rows": [{"id": "1", "amount": 5}, {"id": "2", "amount": 7}]}),
            ),
        );
        registry.register(sink);
        registry
    }

    pub fn executor(sink: RecordingSink, config: &EngineConfig) -> StepExecutor {
        StepExecutor::new(Arc::new(registry(sink)), config)
    }
}
