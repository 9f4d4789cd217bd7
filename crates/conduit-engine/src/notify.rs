//! State transitions and notifiers.
//!
//! A [`Transition`] is emitted after every state change the engine commits, so
//! a surrounding service can publish it, stream it to a UI, or ignore it.

use conduit_model::ExecutionResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
  StageCreated {
    canvas_id: Uuid,
    stage_id: Uuid,
  },

  /// The stage's connections were replaced.
  StageUpdated {
    canvas_id: Uuid,
    stage_id: Uuid,
  },

  StageEventCreated {
    stage_id: Uuid,
    stage_event_id: Uuid,
  },

  StageEventApproved {
    stage_id: Uuid,
    stage_event_id: Uuid,
    approved_by: Uuid,
  },

  ExecutionCreated {
    stage_id: Uuid,
    execution_id: Uuid,
  },

  ExecutionStarted {
    stage_id: Uuid,
    execution_id: Uuid,
    reference_id: String,
  },

  ExecutionFinished {
    stage_id: Uuid,
    execution_id: Uuid,
    result: ExecutionResult,
  },
}

/// Receives transitions as they are committed.
///
/// Called inline, after the store write succeeded. Implementations must not
/// block.
pub trait TransitionNotifier: Send + Sync {
  fn notify(&self, transition: Transition);
}

/// Discards all transitions.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl TransitionNotifier for NoopNotifier {
  fn notify(&self, _transition: Transition) {}
}

/// Sends transitions to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls the dispatcher. Volume is a
  // handful of transitions per event.
  sender: mpsc::UnboundedSender<Transition>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<Transition>) -> Self {
    Self { sender }
  }
}

impl TransitionNotifier for ChannelNotifier {
  fn notify(&self, transition: Transition) {
    // The receiver may have been dropped.
    let _ = self.sender.send(transition);
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_channel_notifier() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier = ChannelNotifier::new(tx);
    let stage_id = Uuid::new_v4();
    let execution_id = Uuid::new_v4();

    notifier.notify(Transition::ExecutionCreated {
      stage_id,
      execution_id,
    });

    assert_eq!(
      rx.try_recv().unwrap(),
      Transition::ExecutionCreated {
        stage_id,
        execution_id
      }
    );
  }

  #[test]
  fn test_dropped_receiver() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    ChannelNotifier::new(tx).notify(Transition::StageCreated {
      canvas_id: Uuid::nil(),
      stage_id: Uuid::nil(),
    });
  }

  #[test]
  fn test_wire_format() {
    let value = serde_json::to_value(Transition::ExecutionFinished {
      stage_id: Uuid::nil(),
      execution_id: Uuid::nil(),
      result: ExecutionResult::Passed,
    })
    .unwrap();
    assert_eq!(value["type"], json!("execution_finished"));
    assert_eq!(value["result"], json!("passed"));
  }
}
