//! Fallback compilation for IR no deterministic pattern covers.

use std::time::Instant;

use crate::error::{CompilationError, CompileResult};
use crate::ir::DeclarativeIR;
use crate::workflow::{CompiledWorkflow, CompilerKind, Workflow};

use super::PatternCompiler;

/// A secondary compiler (typically model backed) consulted only when the
/// deterministic compiler reports an unsupported pattern.
pub trait FallbackCompiler: Send + Sync {
    fn name(&self) -> &str {
        "fallback"
    }

    /// Produce a workflow for `ir`. `reason` is the deterministic
    /// compiler's explanation of why it gave up.
    fn compile(&self, ir: &DeclarativeIR, reason: &str) -> CompileResult<Workflow>;
}

/// Compile deterministically, handing unsupported shapes to `fallback`.
///
/// Fallback output goes through the same validator as deterministic output
/// and is stamped `fallback-llm`. Every other error is returned unchanged.
pub fn compile_with_fallback(
    compiler: &PatternCompiler<'_>,
    fallback: &dyn FallbackCompiler,
    ir: &DeclarativeIR,
) -> CompileResult<CompiledWorkflow> {
    let reason = match compiler.compile(ir) {
        Err(CompilationError::UnsupportedPattern(reason)) => reason,
        other => return other,
    };

    let start = Instant::now();
    tracing::warn!(
        fallback = fallback.name(),
        reason = %reason,
        "Deterministic compilation unsupported, using fallback compiler"
    );

    let mut workflow = fallback.compile(ir, &reason)?;
    workflow.metadata.compiler = CompilerKind::FallbackLlm;

    let mut warnings = vec![format!(
        "compiled by {} fallback: {}",
        fallback.name(),
        reason
    )];
    let workflow = compiler.check(workflow, &mut warnings)?;

    Ok(CompiledWorkflow {
        workflow,
        compile_time_ms: start.elapsed().as_millis() as u64,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_ir;
    use crate::workflow::{ActionStep, StepKind, WorkflowMetadata, WorkflowStep};
    use agentpilot_tools::{CapabilityRegistry, OperationSchema, RecordingSink, StaticSource};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Canned(Vec<WorkflowStep>);

    impl FallbackCompiler for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn compile(&self, _ir: &DeclarativeIR, _reason: &str) -> CompileResult<Workflow> {
            Ok(Workflow::new(self.0.clone(), WorkflowMetadata::default()))
        }
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            StaticSource::new("sheets").with_operation(OperationSchema::new("", "read"), json!([])),
        );
        registry.register(RecordingSink::email("mail"));
        registry
    }

    fn read_step(id: &str) -> WorkflowStep {
        WorkflowStep::new(
            id,
            "Read",
            StepKind::Action(ActionStep {
                plugin_key: "sheets".to_string(),
                operation_type: "read".to_string(),
                params: BTreeMap::new(),
                fail_fast: false,
            }),
        )
    }

    // per_group_delivery without grouping has no deterministic lowering.
    const UNSUPPORTED: &str = r#"{
        "data_sources": [{"plugin_key": "sheets", "operation_type": "read"}],
        "delivery_rules": {"per_group_delivery": {"plugin_key": "mail", "operation_type": "send_email", "config": {"to": "a@x.com"}}}
    }"#;

    #[test]
    fn test_fallback_used_for_unsupported_pattern() {
        let registry = registry();
        let compiler = PatternCompiler::new(&registry);
        let ir = parse_ir(UNSUPPORTED).unwrap();

        let compiled =
            compile_with_fallback(&compiler, &Canned(vec![read_step("step1")]), &ir).unwrap();
        assert_eq!(compiled.workflow.metadata.compiler, CompilerKind::FallbackLlm);
        assert!(compiled.warnings[0].starts_with("compiled by canned fallback"));
    }

    #[test]
    fn test_fallback_output_is_validated() {
        let registry = registry();
        let compiler = PatternCompiler::new(&registry);
        let ir = parse_ir(UNSUPPORTED).unwrap();

        // Depends on a step that does not exist.
        let broken = Canned(vec![read_step("step1").depends_on(["step9"])]);
        let err = compile_with_fallback(&compiler, &broken, &ir).unwrap_err();
        assert!(matches!(err, CompilationError::Validation(_)));
    }

    #[test]
    fn test_other_errors_skip_fallback() {
        let registry = CapabilityRegistry::new();
        let compiler = PatternCompiler::new(&registry);
        let ir = parse_ir(UNSUPPORTED).unwrap();

        let err = compile_with_fallback(&compiler, &Canned(Vec::new()), &ir).unwrap_err();
        assert!(matches!(err, CompilationError::UnresolvedCapability { .. }));
    }
}
