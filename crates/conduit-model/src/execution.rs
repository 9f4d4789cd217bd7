//! Stage executions: concrete runs of a stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::{StateMachine, labelled};

/// `pending -> started -> finished`, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
  Pending,
  Started,
  Finished,
}

labelled!(ExecutionState, "execution state", {
  Pending => "pending",
  Started => "started",
  Finished => "finished",
});

impl ExecutionState {
  /// States that count as in flight for admission.
  pub const ACTIVE: [ExecutionState; 2] = [Self::Pending, Self::Started];
}

impl StateMachine for ExecutionState {
  const ENTITY: &'static str = "stage execution";

  fn label(self) -> &'static str {
    self.as_str()
  }

  fn allows(self, next: Self) -> bool {
    matches!(
      (self, next),
      (Self::Pending, Self::Started) | (Self::Started, Self::Finished)
    )
  }
}

/// Outcome of a finished execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
  Passed,
  Failed,
}

labelled!(ExecutionResult, "execution result", {
  Passed => "passed",
  Failed => "failed",
});

/// One run of a stage, created from an admitted stage event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
  pub id: Uuid,
  pub stage_id: Uuid,
  pub stage_event_id: Uuid,
  pub state: ExecutionState,
  pub result: Option<ExecutionResult>,
  /// Identifier assigned by the system that runs the execution.
  pub reference_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sequential_transitions() {
    let state = ExecutionState::Pending;
    let state = state.transition(ExecutionState::Started).unwrap();
    let state = state.transition(ExecutionState::Finished).unwrap();
    assert_eq!(state, ExecutionState::Finished);
  }

  #[test]
  fn test_no_skipping() {
    let err = ExecutionState::Pending
      .transition(ExecutionState::Finished)
      .unwrap_err();
    assert_eq!(
      err.to_string(),
      "invalid stage execution transition: pending -> finished"
    );
    assert!(ExecutionState::Finished.transition(ExecutionState::Started).is_err());
    assert!(ExecutionState::Started.transition(ExecutionState::Started).is_err());
  }
}
