//! AgentPilot Engine
//!
//! Executes compiled workflows against a capability executor.
//!
//! This crate provides:
//! - Reference resolution over step outputs and scoped bindings
//! - Step executor for actions, transforms and conditions
//! - Sandboxed expressions (rhai) and Jinja-style templates (minijinja)
//! - DAG runner with concurrent independent steps
//! - Bounded scatter/gather with ordered results

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod expression;
pub mod output;
pub mod runner;
pub mod scatter;
pub mod telemetry;
pub mod template;

pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use error::{EngineResult, ExecutionError};
pub use executor::StepExecutor;
pub use output::{ExecutionResult, ProviderFailure, RunStatus, StepOutput};
pub use runner::{execute, WorkflowRunner};
pub use scatter::{ScatterState, ScatterStats};
pub use telemetry::init_tracing;
