//! Conduit Expressions
//!
//! Leaf building blocks shared by connection filters and run-template
//! resolution:
//! - [`path`]: dotted-path lookup into event payloads
//! - [`ExpressionEvaluator`]: the evaluator seam, with a minijinja-backed
//!   implementation bounded by a [`Deadline`]

mod dialect;
mod engine;
mod error;
pub mod path;

pub use dialect::normalize;
pub use engine::{
  Binding, Bindings, DEFAULT_FUEL, DEFAULT_TIMEOUT, Deadline, EvaluatorConfig, ExpressionEvaluator,
  HostObject, MiniJinjaEvaluator, Program, kind_name,
};
pub use error::{ExpressionError, HostError, PathError};
