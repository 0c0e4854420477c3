//! Declarative IR model and parser.

pub mod parser;
pub mod types;

pub use parser::{parse_ir, validate_ir};
pub use types::*;
