//! Inbound events and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionSource;
use crate::lifecycle::{StateMachine, labelled};

/// Processing state of an [`Event`].
///
/// `pending -> processed` once every outgoing connection was evaluated, or
/// `pending -> discarded` when nothing is connected to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
  Pending,
  Processed,
  Discarded,
}

labelled!(EventState, "event state", {
  Pending => "pending",
  Processed => "processed",
  Discarded => "discarded",
});

impl StateMachine for EventState {
  const ENTITY: &'static str = "event";

  fn label(self) -> &'static str {
    self.as_str()
  }

  fn allows(self, next: Self) -> bool {
    matches!(
      (self, next),
      (Self::Pending, Self::Processed) | (Self::Pending, Self::Discarded)
    )
  }
}

/// A payload received from an event source or emitted by a finished stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub id: Uuid,
  pub source: ConnectionSource,
  pub source_name: String,
  pub state: EventState,
  pub received_at: DateTime<Utc>,
  /// The payload as received. Never modified after storage.
  pub raw: serde_json::Value,
}

impl Event {
  /// The payload as a JSON object, if it is one.
  pub fn data(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
    self.raw.as_object()
  }
}
