//! Compilation state.
//!
//! `CompilerContext` is fixed once built: the IR, the configuration, the
//! chosen pattern and every capability schema the IR names. Everything
//! that changes while lowering (the id counter, warnings) lives in
//! `Lowering`, which is threaded explicitly through the stages.

use std::collections::BTreeMap;

use agentpilot_tools::{CapabilityCatalog, OperationSchema};

use crate::config::CompilerConfig;
use crate::error::{CompilationError, CompileResult};
use crate::ir::DeclarativeIR;
use crate::result_ext::ResultExt;
use crate::workflow::{reference, PatternType};

pub struct CompilerContext<'a> {
    pub ir: &'a DeclarativeIR,
    pub config: &'a CompilerConfig,
    pub pattern: PatternType,
    schemas: BTreeMap<(String, String), OperationSchema>,
}

impl<'a> CompilerContext<'a> {
    /// Resolve every capability the IR names. The first failure aborts
    /// with the offending IR node.
    pub fn build(
        ir: &'a DeclarativeIR,
        config: &'a CompilerConfig,
        catalog: &dyn CapabilityCatalog,
        pattern: PatternType,
    ) -> CompileResult<Self> {
        let mut requests: Vec<(String, &str, &str)> = Vec::new();

        for (idx, source) in ir.data_sources.iter().enumerate() {
            requests.push((
                format!("data_sources[{}]", idx),
                source.plugin_key.as_str(),
                source.operation_type.as_str(),
            ));
        }
        for (idx, op) in ir.ai_operations.iter().enumerate() {
            requests.push((
                format!("ai_operations[{}]", idx),
                op.plugin_key.as_str(),
                op.operation_type.as_str(),
            ));
        }
        let rules = &ir.delivery_rules;
        for (node, dest) in [
            ("summary_delivery", &rules.summary_delivery),
            ("per_item_delivery", &rules.per_item_delivery),
            ("per_group_delivery", &rules.per_group_delivery),
        ] {
            if let Some(dest) = dest {
                requests.push((
                    format!("delivery_rules.{}", node),
                    dest.plugin_key.as_str(),
                    dest.operation_type.as_str(),
                ));
            }
        }
        for (idx, dest) in rules.multiple_destinations.iter().enumerate() {
            requests.push((
                format!("delivery_rules.multiple_destinations[{}]", idx),
                dest.plugin_key.as_str(),
                dest.operation_type.as_str(),
            ));
        }

        let mut schemas = BTreeMap::new();
        for (node, plugin_key, operation_type) in requests {
            let key = (plugin_key.to_string(), operation_type.to_string());
            if schemas.contains_key(&key) {
                continue;
            }
            let schema = catalog
                .resolve(plugin_key, operation_type)
                .map_err(|e| CompilationError::UnresolvedCapability {
                    plugin_key: plugin_key.to_string(),
                    operation_type: operation_type.to_string(),
                    node: node.clone(),
                    reason: e.to_string(),
                })
                .log(format!("resolving capability for {}", node))?;
            schemas.insert(key, schema);
        }

        Ok(Self {
            ir,
            config,
            pattern,
            schemas,
        })
    }

    pub fn schema(&self, plugin_key: &str, operation_type: &str) -> CompileResult<&OperationSchema> {
        self.schemas
            .get(&(plugin_key.to_string(), operation_type.to_string()))
            .ok_or_else(|| CompilationError::UnresolvedCapability {
                plugin_key: plugin_key.to_string(),
                operation_type: operation_type.to_string(),
                node: "compiler".to_string(),
                reason: "schema was not resolved before lowering".to_string(),
            })
    }

    /// Reference to the records produced by an action step.
    ///
    /// Fully qualified when the schema names its items field; otherwise the
    /// whole `data` and the runtime picks the array.
    pub fn output_ref(&self, step_id: &str, schema: &OperationSchema) -> String {
        match &schema.output_schema.items_field {
            Some(field) => reference::field_ref(step_id, field),
            None => reference::data_ref(step_id),
        }
    }

    /// Concurrency bound for fan-out steps.
    pub fn max_concurrency(&self, lowering: &mut Lowering) -> usize {
        match self.ir.delivery_rules.max_concurrency {
            Some(n) => n,
            None => {
                lowering.warn(format!(
                    "delivery_rules.max_concurrency not set, defaulting to {}",
                    self.config.default_max_concurrency
                ));
                self.config.default_max_concurrency
            }
        }
    }
}

/// Current position in the data flow: the step that produced the data and
/// the reference downstream steps should read.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub step_id: String,
    pub reference: String,
}

impl Cursor {
    pub fn new(step_id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            reference: reference.into(),
        }
    }

    /// Cursor at the `data` of a transform or scatter step.
    pub fn data_of(step_id: &str) -> Self {
        Self::new(step_id, reference::data_ref(step_id))
    }
}

/// Mutable lowering state.
#[derive(Debug, Default)]
pub struct Lowering {
    counter: usize,
    warnings: Vec<String>,
}

impl Lowering {
    /// Allocate the next id in the global depth-first sequence.
    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("step{}", self.counter)
    }

    /// Record a compile-time fallback.
    pub fn warn(&mut self, message: String) {
        tracing::warn!(warning = %message, "Compile-time fallback applied");
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}
