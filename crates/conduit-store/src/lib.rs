//! Conduit Store
//!
//! This crate provides the storage trait and a SQLite implementation for
//! canvases, stages, events and executions.
//!
//! The [`Store`] trait defines operations for:
//! - Creating and describing canvases, event sources and stages
//! - Recording inbound events and routing them to stages
//! - The admission primitives the dispatcher builds on
//!
//! Operations that change more than one row are atomic. Uniqueness
//! violations are translated here, once, into typed errors.

mod rows;
mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_model::{
  Canvas, ConnectionSource, Event, EventSource, EventState, ExecutionResult, ExecutionState,
  ParseLabelError, Stage, StageConnection, StageEvent, StageEventState, StageEventTag,
  StageExecution, TransitionError,
};
use uuid::Uuid;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("{kind} not found: {id}")]
  NotFound { kind: &'static str, id: String },

  /// A uniqueness constraint on a name was violated.
  #[error("{kind} name already used: {name}")]
  NameAlreadyUsed { kind: &'static str, name: String },

  #[error("stage {stage_id} is already connected to {source_name}")]
  DuplicateConnection { stage_id: Uuid, source_name: String },

  #[error("stage {0} already has an execution in flight")]
  ExecutionInFlight(Uuid),

  #[error(transparent)]
  InvalidTransition(#[from] TransitionError),

  /// A stored value could not be mapped back onto the model.
  #[error("corrupt record: {0}")]
  Decode(#[from] ParseLabelError),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
  pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
    Self::NotFound {
      kind,
      id: id.to_string(),
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }
}

/// Storage trait for the canvas graph and its runtime records.
#[async_trait]
pub trait Store: Send + Sync {
  // Canvases

  async fn create_canvas(&self, canvas: &Canvas) -> Result<(), Error>;

  async fn get_canvas(&self, organization_id: Uuid, canvas_id: Uuid) -> Result<Canvas, Error>;

  async fn find_canvas_by_name(&self, organization_id: Uuid, name: &str) -> Result<Canvas, Error>;

  async fn list_canvases(&self, organization_id: Uuid) -> Result<Vec<Canvas>, Error>;

  // Event sources

  async fn create_event_source(&self, source: &EventSource) -> Result<(), Error>;

  async fn get_event_source(&self, source_id: Uuid) -> Result<EventSource, Error>;

  async fn find_event_source_by_name(&self, canvas_id: Uuid, name: &str)
  -> Result<EventSource, Error>;

  async fn list_event_sources(&self, canvas_id: Uuid) -> Result<Vec<EventSource>, Error>;

  // Stages and connections

  /// Insert a stage together with its connections. Nothing is written if
  /// any insert fails.
  async fn create_stage(&self, stage: &Stage, connections: &[StageConnection])
  -> Result<(), Error>;

  async fn get_stage(&self, stage_id: Uuid) -> Result<Stage, Error>;

  async fn find_stage_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Stage, Error>;

  async fn list_stages(&self, canvas_id: Uuid) -> Result<Vec<Stage>, Error>;

  /// Replace every connection of a stage.
  async fn update_stage_connections(
    &self,
    stage_id: Uuid,
    connections: &[StageConnection],
    updated_at: DateTime<Utc>,
  ) -> Result<(), Error>;

  /// Inbound connections of a stage.
  async fn list_connections(&self, stage_id: Uuid) -> Result<Vec<StageConnection>, Error>;

  /// Connections fed by `source`, in insertion order.
  async fn list_connections_for_source(
    &self,
    source: ConnectionSource,
  ) -> Result<Vec<StageConnection>, Error>;

  /// Every connection of every stage on a canvas.
  async fn list_canvas_connections(&self, canvas_id: Uuid) -> Result<Vec<StageConnection>, Error>;

  // Events

  async fn create_event(&self, event: &Event) -> Result<(), Error>;

  async fn get_event(&self, event_id: Uuid) -> Result<Event, Error>;

  /// Events in `state`, oldest first.
  async fn list_events_in_state(&self, state: EventState, limit: u32) -> Result<Vec<Event>, Error>;

  /// Insert `stage_events` and mark the event processed, atomically.
  async fn route_event(&self, event_id: Uuid, stage_events: &[StageEvent]) -> Result<(), Error>;

  /// Mark an event that nothing is connected to as discarded.
  async fn discard_event(&self, event_id: Uuid) -> Result<(), Error>;

  // Stage events

  async fn create_stage_event(&self, stage_event: &StageEvent) -> Result<(), Error>;

  async fn get_stage_event(&self, stage_id: Uuid, stage_event_id: Uuid) -> Result<StageEvent, Error>;

  /// Stage events of a stage in any of `states`, oldest first. An empty
  /// slice matches every state.
  async fn list_stage_events(
    &self,
    stage_id: Uuid,
    states: &[StageEventState],
  ) -> Result<Vec<StageEvent>, Error>;

  /// Distinct ids of stages with at least one pending stage event.
  async fn find_stages_with_pending_events(&self) -> Result<Vec<Uuid>, Error>;

  /// The pending stage event created first. Ties resolve by insertion order.
  async fn find_oldest_pending_stage_event(&self, stage_id: Uuid)
  -> Result<Option<StageEvent>, Error>;

  async fn approve_stage_event(
    &self,
    stage_id: Uuid,
    stage_event_id: Uuid,
    approved_by: Uuid,
    approved_at: DateTime<Utc>,
  ) -> Result<StageEvent, Error>;

  async fn update_stage_event_state(
    &self,
    stage_event_id: Uuid,
    state: StageEventState,
  ) -> Result<StageEvent, Error>;

  // Tags

  /// Insert a tag, or overwrite the value and health of an existing one.
  async fn upsert_stage_event_tag(&self, tag: &StageEventTag) -> Result<(), Error>;

  /// Set the health of every tag with this name and value. Returns the
  /// number of tags changed.
  async fn update_tag_health(&self, name: &str, value: &str, healthy: bool) -> Result<u64, Error>;

  async fn list_stage_event_tags(&self, stage_event_id: Uuid) -> Result<Vec<StageEventTag>, Error>;

  // Executions

  /// Insert an execution and mark its stage event processed, atomically.
  /// Fails with [`Error::ExecutionInFlight`] when the stage already has one.
  async fn create_stage_execution(&self, execution: &StageExecution) -> Result<(), Error>;

  async fn get_execution(&self, execution_id: Uuid) -> Result<StageExecution, Error>;

  /// Oldest execution of a stage in any of `states`. An empty slice matches
  /// every state.
  async fn find_execution_in_state(
    &self,
    stage_id: Uuid,
    states: &[ExecutionState],
  ) -> Result<Option<StageExecution>, Error>;

  /// Executions in `state` across all stages, oldest first.
  async fn list_executions_in_state(
    &self,
    state: ExecutionState,
    limit: u32,
  ) -> Result<Vec<StageExecution>, Error>;

  async fn start_execution(
    &self,
    execution_id: Uuid,
    reference_id: &str,
    started_at: DateTime<Utc>,
  ) -> Result<StageExecution, Error>;

  /// Finish an execution and record `completion`, atomically.
  async fn finish_execution(
    &self,
    execution_id: Uuid,
    result: ExecutionResult,
    finished_at: DateTime<Utc>,
    completion: &Event,
  ) -> Result<StageExecution, Error>;
}
