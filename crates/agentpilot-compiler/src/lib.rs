//! AgentPilot Compiler
//!
//! Turns declarative workflow intent into an executable step graph.
//!
//! This crate provides:
//! - Declarative IR model and parser (JSON or YAML)
//! - Workflow step model, condition trees and the `{{ ... }}` reference grammar
//! - Deterministic pattern compiler with a fallback-compiler seam
//! - Rule based step graph validator with pure auto-fix and renumbering

pub mod compiler;
pub mod config;
pub mod error;
pub mod ir;
pub mod result_ext;
pub mod validator;
pub mod workflow;

pub use compiler::{compile, compile_with_fallback, detect_pattern, FallbackCompiler, PatternCompiler};
pub use config::CompilerConfig;
pub use error::{CompilationError, CompileResult};
pub use ir::{parse_ir, DeclarativeIR};
pub use validator::{validate, Severity, ValidationIssue, ValidationReport, Validator};
pub use workflow::{CompiledWorkflow, Condition, Workflow, WorkflowStep};
