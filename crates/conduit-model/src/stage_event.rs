//! Stage events: candidate triggers queued on a stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionSource;
use crate::error::TransitionError;
use crate::lifecycle::{StateMachine, labelled};

/// Queue state of a [`StageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageEventState {
  Pending,
  WaitingForApproval,
  WaitingForTimeWindow,
  Processed,
}

labelled!(StageEventState, "stage event state", {
  Pending => "pending",
  WaitingForApproval => "waiting-for-approval",
  WaitingForTimeWindow => "waiting-for-time-window",
  Processed => "processed",
});

impl StageEventState {
  pub const ALL: [StageEventState; 4] = [
    Self::Pending,
    Self::WaitingForApproval,
    Self::WaitingForTimeWindow,
    Self::Processed,
  ];

  /// State a new stage event starts in.
  pub fn initial(approval_required: bool) -> Self {
    if approval_required {
      Self::WaitingForApproval
    } else {
      Self::Pending
    }
  }
}

impl StateMachine for StageEventState {
  const ENTITY: &'static str = "stage event";

  fn label(self) -> &'static str {
    self.as_str()
  }

  fn allows(self, next: Self) -> bool {
    use StageEventState::*;
    matches!(
      (self, next),
      (WaitingForApproval, Pending)
        | (Pending, WaitingForTimeWindow)
        | (WaitingForTimeWindow, Pending)
        | (Pending, Processed)
    )
  }
}

/// A candidate trigger for a stage, created when a connection accepts an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
  pub id: Uuid,
  pub stage_id: Uuid,
  pub event_id: Uuid,
  pub source: ConnectionSource,
  /// Name of the connection the event arrived over.
  pub source_name: String,
  pub state: StageEventState,
  pub created_at: DateTime<Utc>,
  pub approved_at: Option<DateTime<Utc>>,
  pub approved_by: Option<Uuid>,
}

impl StageEvent {
  /// Record an approval and release the event into the pending queue.
  pub fn approve(&mut self, approver: Uuid, at: DateTime<Utc>) -> Result<(), TransitionError> {
    self.state = self.state.transition(StageEventState::Pending)?;
    self.approved_at = Some(at);
    self.approved_by = Some(approver);
    Ok(())
  }
}

/// Auxiliary label on a stage event, used by health queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEventTag {
  pub stage_event_id: Uuid,
  pub name: String,
  pub value: String,
  pub healthy: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stage_event(state: StageEventState) -> StageEvent {
    StageEvent {
      id: Uuid::new_v4(),
      stage_id: Uuid::new_v4(),
      event_id: Uuid::new_v4(),
      source: ConnectionSource::EventSource(Uuid::new_v4()),
      source_name: "gh".to_string(),
      state,
      created_at: Utc::now(),
      approved_at: None,
      approved_by: None,
    }
  }

  #[test]
  fn test_initial_state() {
    assert_eq!(StageEventState::initial(false), StageEventState::Pending);
    assert_eq!(StageEventState::initial(true), StageEventState::WaitingForApproval);
  }

  #[test]
  fn test_approve() {
    let mut event = stage_event(StageEventState::WaitingForApproval);
    let approver = Uuid::new_v4();
    event.approve(approver, Utc::now()).unwrap();

    assert_eq!(event.state, StageEventState::Pending);
    assert_eq!(event.approved_by, Some(approver));
    assert!(event.approved_at.is_some());
  }

  #[test]
  fn test_approve_requires_waiting_state() {
    let mut event = stage_event(StageEventState::Pending);
    let err = event.approve(Uuid::new_v4(), Utc::now()).unwrap_err();
    assert_eq!(err.from, "pending");
    assert!(event.approved_by.is_none());
  }

  #[test]
  fn test_time_window_gate() {
    use StageEventState::*;
    assert!(Pending.allows(WaitingForTimeWindow));
    assert!(WaitingForTimeWindow.allows(Pending));
    assert!(!WaitingForTimeWindow.allows(Processed));
    assert!(!Processed.allows(Pending));
    assert!(!WaitingForApproval.allows(Processed));
  }

  #[test]
  fn test_labels() {
    for state in StageEventState::ALL {
      assert_eq!(state.as_str().parse::<StageEventState>().unwrap(), state);
    }
    assert_eq!(
      serde_json::to_value(StageEventState::WaitingForApproval).unwrap(),
      serde_json::json!("waiting-for-approval")
    );
  }
}
