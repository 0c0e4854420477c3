//! AgentPilot Capability Library
//!
//! Contracts between the workflow engine and external capability providers.
//!
//! This crate provides:
//! - Capability trait and registry (schema resolution + execution dispatch)
//! - Parameter and output schemas for `(plugin_key, operation_type)` pairs
//! - Provider error types
//! - In-memory providers for demos and tests

pub mod error;
pub mod providers;
pub mod registry;
pub mod schema;

pub use error::ProviderError;
pub use providers::{Delivery, RecordingSink, StaticSource};
pub use registry::{Capability, CapabilityCatalog, CapabilityExecutor, CapabilityRegistry};
pub use schema::{OperationSchema, OutputSchema, ParamType, ParameterSpec, ParametersSchema};
