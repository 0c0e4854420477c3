//! Compiled workflow model.

pub mod condition;
pub mod reference;
pub mod renumber;
pub mod types;

pub use condition::{
    Combinator, ComplexCondition, Condition, ConditionOperator, SimpleCondition,
};
pub use reference::{Reference, ReferenceError, Segment};
pub use renumber::renumber;
pub use types::*;
