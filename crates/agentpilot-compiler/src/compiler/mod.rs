//! Pattern compiler: `DeclarativeIR -> Workflow`.
//!
//! Compilation is deterministic. The only external input is capability
//! schema resolution, which is pure. Step ids are allocated from a single
//! depth-first counter, nested bodies included, so identical IR always
//! yields a byte-identical workflow.
//!
//! Stages, in order:
//! 1. IR validation and pattern detection
//! 2. Capability resolution for every IR node
//! 3. Lowering: sources, filter, dedup, AI operations, delivery topology
//! 4. Step graph validation (with auto-fix when configured)

mod context;
pub mod fallback;
pub mod patterns;
mod render;
mod stages;

use std::time::Instant;

use agentpilot_tools::CapabilityCatalog;

use crate::config::CompilerConfig;
use crate::error::{CompilationError, CompileResult};
use crate::ir::{parse_ir, validate_ir, DeclarativeIR};
use crate::validator::Validator;
use crate::workflow::{CompiledWorkflow, CompilerKind, Workflow, WorkflowMetadata};

pub use context::{CompilerContext, Cursor, Lowering};
pub use fallback::{compile_with_fallback, FallbackCompiler};
pub use patterns::detect_pattern;

/// Deterministic IR compiler bound to a capability catalog.
pub struct PatternCompiler<'a> {
    catalog: &'a dyn CapabilityCatalog,
    config: CompilerConfig,
}

impl<'a> PatternCompiler<'a> {
    pub fn new(catalog: &'a dyn CapabilityCatalog) -> Self {
        Self {
            catalog,
            config: CompilerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile an IR document (JSON or YAML).
    pub fn compile_str(&self, content: &str) -> CompileResult<CompiledWorkflow> {
        let ir = parse_ir(content)?;
        self.compile(&ir)
    }

    pub fn compile(&self, ir: &DeclarativeIR) -> CompileResult<CompiledWorkflow> {
        let start = Instant::now();
        validate_ir(ir)?;

        let pattern = patterns::detect_pattern(ir);
        tracing::debug!(pattern = %pattern, "Detected compilation pattern");

        let ctx = CompilerContext::build(ir, &self.config, self.catalog, pattern)?;
        let mut lowering = Lowering::default();
        let steps = patterns::lower(&ctx, &mut lowering)?;

        let workflow = Workflow::new(
            steps,
            WorkflowMetadata {
                compiler: CompilerKind::Deterministic,
                pattern_type: pattern,
            },
        );

        let mut warnings = lowering.into_warnings();
        let workflow = self.check(workflow, &mut warnings)?;

        let compile_time_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            pattern = %pattern,
            steps = workflow.len(),
            warnings = warnings.len(),
            compile_time_ms,
            "Workflow compiled"
        );

        Ok(CompiledWorkflow {
            workflow,
            compile_time_ms,
            warnings,
        })
    }

    /// Run the step graph validator over a compiled workflow.
    ///
    /// Repaired issues and warnings are appended to `warnings`; remaining
    /// errors fail compilation.
    pub fn check(&self, workflow: Workflow, warnings: &mut Vec<String>) -> CompileResult<Workflow> {
        if !self.config.validate_output {
            return Ok(workflow);
        }

        let report = Validator::new()
            .with_catalog(self.catalog)
            .validate(&workflow, self.config.auto_fix);

        if !report.valid {
            let errors: Vec<_> = report.errors().cloned().collect();
            tracing::error!(errors = errors.len(), "Compiled workflow failed validation");
            return Err(CompilationError::Validation(errors));
        }

        for issue in &report.issues {
            if issue.fixed || issue.severity == crate::validator::Severity::Warning {
                warnings.push(issue.to_string());
            }
        }

        Ok(report.fixed_workflow.unwrap_or(workflow))
    }
}

/// Compile with the default configuration.
pub fn compile(ir: &DeclarativeIR, catalog: &dyn CapabilityCatalog) -> CompileResult<CompiledWorkflow> {
    PatternCompiler::new(catalog).compile(ir)
}
