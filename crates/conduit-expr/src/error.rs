use std::time::Duration;

use thiserror::Error;

/// Structural failures when walking a JSON payload by path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
  #[error("key '{0}' not found")]
  KeyNotFound(String),

  #[error("key '{0}' is not a map")]
  NotAMap(String),

  #[error("empty path")]
  EmptyPath,
}

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
  /// The expression does not parse.
  #[error("syntax error: {0}")]
  Syntax(String),

  /// The expression references a name that is not bound.
  #[error("unknown name {0}")]
  UnboundName(String),

  /// Evaluation failed (type mismatch, undefined attribute, ...).
  #[error("evaluation failed: {0}")]
  Runtime(String),

  /// The evaluator ran out of its instruction budget.
  #[error("expression exceeded its evaluation budget")]
  Exhausted,

  /// The wall-clock deadline passed before evaluation finished.
  #[error("expression timed out after {0:?}")]
  Timeout(Duration),

  /// The caller cancelled evaluation.
  #[error("expression evaluation cancelled")]
  Cancelled,

  /// A host capability refused the call.
  #[error("unsupported: {0}")]
  Unsupported(String),

  /// A host capability failed.
  #[error("host call failed: {0}")]
  Host(String),

  /// The expression produced a value of the wrong type.
  #[error("expression returned {found}, expected {expected}")]
  UnexpectedType {
    expected: &'static str,
    found: &'static str,
  },
}

/// Errors returned by host objects exposed to expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
  #[error("{0}")]
  Unsupported(String),

  #[error("unknown method: {0}")]
  UnknownMethod(String),

  #[error("invalid arguments: {0}")]
  InvalidArguments(String),

  #[error("{0}")]
  Failed(String),
}
