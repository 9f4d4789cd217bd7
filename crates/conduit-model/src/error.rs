use thiserror::Error;

/// A stored label did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseLabelError {
  pub kind: &'static str,
  pub value: String,
}

/// A state change the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
  pub entity: &'static str,
  pub from: &'static str,
  pub to: &'static str,
}
