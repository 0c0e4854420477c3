//! Validation rules.
//!
//! Each file contains one rule:
//!
//! - `separation.rs` - transform configuration embedded in action params
//! - `transform_input.rs` - transforms without an input
//! - `references.rs` - references to ids not visible in scope
//! - `missing_dependency.rs` - references without a declared dependency
//! - `dag.rs` - unique ids, backward-only dependencies, no cycles
//! - `capability_params.rs` - action params against capability schemas

mod capability_params;
mod dag;
mod missing_dependency;
mod references;
mod separation;
mod transform_input;

pub use capability_params::CapabilityParamsRule;
pub use dag::DagIntegrityRule;
pub use missing_dependency::MissingDependencyRule;
pub use references::ReferenceResolutionRule;
pub use separation::ActionTransformSeparationRule;
pub use transform_input::TransformInputRule;
