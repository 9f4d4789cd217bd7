//! Row types as read from SQLite, and their mapping onto the model.
//!
//! Enum columns are stored as their labels and parsed back here. A label
//! that no longer parses surfaces as [`Error::Decode`].

use chrono::{DateTime, Utc};
use conduit_model::{
  Canvas, ConnectionSource, Event, EventSource, ExecutionResult, FilterOperator, RunTemplate, Stage,
  StageConnection, StageConnectionFilter, StageEvent, StageEventTag, StageExecution,
};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use crate::Error;

fn source(source_type: &str, source_id: Uuid) -> Result<ConnectionSource, Error> {
  Ok(ConnectionSource::from_parts(source_type.parse()?, source_id))
}

#[derive(Debug, FromRow)]
pub(crate) struct CanvasRow {
  id: Uuid,
  organization_id: Uuid,
  name: String,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<CanvasRow> for Canvas {
  fn from(row: CanvasRow) -> Self {
    Canvas {
      id: row.id,
      organization_id: row.organization_id,
      name: row.name,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct EventSourceRow {
  id: Uuid,
  organization_id: Uuid,
  canvas_id: Uuid,
  name: String,
  key: Vec<u8>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<EventSourceRow> for EventSource {
  fn from(row: EventSourceRow) -> Self {
    EventSource {
      id: row.id,
      organization_id: row.organization_id,
      canvas_id: row.canvas_id,
      name: row.name,
      key: row.key,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct StageRow {
  id: Uuid,
  organization_id: Uuid,
  canvas_id: Uuid,
  name: String,
  approval_required: bool,
  run_template: Json<RunTemplate>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<StageRow> for Stage {
  fn from(row: StageRow) -> Self {
    Stage {
      id: row.id,
      organization_id: row.organization_id,
      canvas_id: row.canvas_id,
      name: row.name,
      approval_required: row.approval_required,
      run_template: row.run_template.0,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct ConnectionRow {
  id: Uuid,
  stage_id: Uuid,
  source_type: String,
  source_id: Uuid,
  source_name: String,
  filter_operator: String,
  filters: Json<Vec<StageConnectionFilter>>,
}

impl TryFrom<ConnectionRow> for StageConnection {
  type Error = Error;

  fn try_from(row: ConnectionRow) -> Result<Self, Error> {
    Ok(StageConnection {
      id: row.id,
      stage_id: row.stage_id,
      source: source(&row.source_type, row.source_id)?,
      source_name: row.source_name,
      filter_operator: row.filter_operator.parse::<FilterOperator>()?,
      filters: row.filters.0,
    })
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct EventRow {
  id: Uuid,
  source_type: String,
  source_id: Uuid,
  source_name: String,
  state: String,
  received_at: DateTime<Utc>,
  raw: Json<serde_json::Value>,
}

impl TryFrom<EventRow> for Event {
  type Error = Error;

  fn try_from(row: EventRow) -> Result<Self, Error> {
    Ok(Event {
      id: row.id,
      source: source(&row.source_type, row.source_id)?,
      source_name: row.source_name,
      state: row.state.parse()?,
      received_at: row.received_at,
      raw: row.raw.0,
    })
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct StageEventRow {
  id: Uuid,
  stage_id: Uuid,
  event_id: Uuid,
  source_type: String,
  source_id: Uuid,
  source_name: String,
  state: String,
  created_at: DateTime<Utc>,
  approved_at: Option<DateTime<Utc>>,
  approved_by: Option<Uuid>,
}

impl TryFrom<StageEventRow> for StageEvent {
  type Error = Error;

  fn try_from(row: StageEventRow) -> Result<Self, Error> {
    Ok(StageEvent {
      id: row.id,
      stage_id: row.stage_id,
      event_id: row.event_id,
      source: source(&row.source_type, row.source_id)?,
      source_name: row.source_name,
      state: row.state.parse()?,
      created_at: row.created_at,
      approved_at: row.approved_at,
      approved_by: row.approved_by,
    })
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct TagRow {
  stage_event_id: Uuid,
  name: String,
  value: String,
  healthy: bool,
}

impl From<TagRow> for StageEventTag {
  fn from(row: TagRow) -> Self {
    StageEventTag {
      stage_event_id: row.stage_event_id,
      name: row.name,
      value: row.value,
      healthy: row.healthy,
    }
  }
}

#[derive(Debug, FromRow)]
pub(crate) struct ExecutionRow {
  id: Uuid,
  stage_id: Uuid,
  stage_event_id: Uuid,
  state: String,
  result: Option<String>,
  reference_id: Option<String>,
  created_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for StageExecution {
  type Error = Error;

  fn try_from(row: ExecutionRow) -> Result<Self, Error> {
    Ok(StageExecution {
      id: row.id,
      stage_id: row.stage_id,
      stage_event_id: row.stage_event_id,
      state: row.state.parse()?,
      result: row.result.as_deref().map(str::parse::<ExecutionResult>).transpose()?,
      reference_id: row.reference_id,
      created_at: row.created_at,
      started_at: row.started_at,
      finished_at: row.finished_at,
    })
  }
}

/// Convert every row, stopping at the first that fails.
pub(crate) fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, Error>
where
  T: TryFrom<R, Error = Error>,
{
  rows.into_iter().map(T::try_from).collect()
}
