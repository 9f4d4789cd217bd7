use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_model::{
  Canvas, ConnectionSource, Event, EventSource, EventState, ExecutionResult, ExecutionState, Stage,
  StageConnection, StageEvent, StageEventState, StageEventTag, StageExecution, StateMachine,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::rows::{
  CanvasRow, ConnectionRow, EventRow, EventSourceRow, ExecutionRow, StageEventRow, StageRow, TagRow,
  collect,
};
use crate::{Error, Store};

const CONNECTION_COLUMNS: &str =
  "id, stage_id, source_type, source_id, source_name, filter_operator, filters";

const STAGE_EVENT_COLUMNS: &str = "id, stage_id, event_id, source_type, source_id, source_name, state, created_at, approved_at, approved_by";

const EXECUTION_COLUMNS: &str = "id, stage_id, stage_event_id, state, result, reference_id, created_at, started_at, finished_at";

/// SQLite-based store implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// A migrated, private in-memory database.
  ///
  /// The pool holds a single connection that never expires, since every
  /// connection to `:memory:` opens a new empty database.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(&self.pool).await
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

/// Map a unique violation onto `on_unique`; pass anything else through.
fn unique_violation(err: sqlx::Error, on_unique: impl FnOnce() -> Error) -> Error {
  let is_unique = matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation());
  if is_unique { on_unique() } else { Error::Database(err) }
}

async fn insert_connections(
  conn: &mut SqliteConnection,
  connections: &[StageConnection],
) -> Result<(), Error> {
  for connection in connections {
    sqlx::query(
      r#"
      INSERT INTO stage_connections (id, stage_id, source_type, source_id, source_name, filter_operator, filters)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(connection.id)
    .bind(connection.stage_id)
    .bind(connection.source.source_type().as_str())
    .bind(connection.source.id())
    .bind(&connection.source_name)
    .bind(connection.filter_operator.as_str())
    .bind(Json(&connection.filters))
    .execute(&mut *conn)
    .await
    .map_err(|err| {
      unique_violation(err, || Error::DuplicateConnection {
        stage_id: connection.stage_id,
        source_name: connection.source_name.clone(),
      })
    })?;
  }

  Ok(())
}

async fn insert_event(conn: &mut SqliteConnection, event: &Event) -> Result<(), Error> {
  sqlx::query(
    r#"
    INSERT INTO events (id, source_type, source_id, source_name, state, received_at, raw)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    "#,
  )
  .bind(event.id)
  .bind(event.source.source_type().as_str())
  .bind(event.source.id())
  .bind(&event.source_name)
  .bind(event.state.as_str())
  .bind(event.received_at)
  .bind(Json(&event.raw))
  .execute(&mut *conn)
  .await?;

  Ok(())
}

async fn insert_stage_event(conn: &mut SqliteConnection, stage_event: &StageEvent) -> Result<(), Error> {
  sqlx::query(
    r#"
    INSERT INTO stage_events (id, stage_id, event_id, source_type, source_id, source_name, state, created_at, approved_at, approved_by)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
  )
  .bind(stage_event.id)
  .bind(stage_event.stage_id)
  .bind(stage_event.event_id)
  .bind(stage_event.source.source_type().as_str())
  .bind(stage_event.source.id())
  .bind(&stage_event.source_name)
  .bind(stage_event.state.as_str())
  .bind(stage_event.created_at)
  .bind(stage_event.approved_at)
  .bind(stage_event.approved_by)
  .execute(&mut *conn)
  .await?;

  Ok(())
}

/// Move an event from its stored state to `next`, if the lifecycle allows it.
async fn transition_event(
  conn: &mut SqliteConnection,
  event_id: Uuid,
  next: EventState,
) -> Result<(), Error> {
  let state: Option<String> = sqlx::query_scalar("SELECT state FROM events WHERE id = ?")
    .bind(event_id)
    .fetch_optional(&mut *conn)
    .await?;
  let state: EventState = state.ok_or_else(|| Error::not_found("event", event_id))?.parse()?;
  let next = state.transition(next)?;

  sqlx::query("UPDATE events SET state = ? WHERE id = ?")
    .bind(next.as_str())
    .bind(event_id)
    .execute(&mut *conn)
    .await?;

  Ok(())
}

async fn fetch_stage_event(
  conn: &mut SqliteConnection,
  stage_event_id: Uuid,
) -> Result<StageEvent, Error> {
  let row: Option<StageEventRow> = sqlx::query_as(&format!(
    "SELECT {STAGE_EVENT_COLUMNS} FROM stage_events WHERE id = ?"
  ))
  .bind(stage_event_id)
  .fetch_optional(&mut *conn)
  .await?;

  row
    .ok_or_else(|| Error::not_found("stage event", stage_event_id))?
    .try_into()
}

async fn write_stage_event_state(
  conn: &mut SqliteConnection,
  stage_event: &StageEvent,
) -> Result<(), Error> {
  sqlx::query("UPDATE stage_events SET state = ?, approved_at = ?, approved_by = ? WHERE id = ?")
    .bind(stage_event.state.as_str())
    .bind(stage_event.approved_at)
    .bind(stage_event.approved_by)
    .bind(stage_event.id)
    .execute(&mut *conn)
    .await?;

  Ok(())
}

async fn fetch_execution(
  conn: &mut SqliteConnection,
  execution_id: Uuid,
) -> Result<StageExecution, Error> {
  let row: Option<ExecutionRow> = sqlx::query_as(&format!(
    "SELECT {EXECUTION_COLUMNS} FROM stage_executions WHERE id = ?"
  ))
  .bind(execution_id)
  .fetch_optional(&mut *conn)
  .await?;

  row
    .ok_or_else(|| Error::not_found("stage execution", execution_id))?
    .try_into()
}

async fn write_execution(conn: &mut SqliteConnection, execution: &StageExecution) -> Result<(), Error> {
  sqlx::query(
    r#"
    UPDATE stage_executions
    SET state = ?, result = ?, reference_id = ?, started_at = ?, finished_at = ?
    WHERE id = ?
    "#,
  )
  .bind(execution.state.as_str())
  .bind(execution.result.map(ExecutionResult::as_str))
  .bind(&execution.reference_id)
  .bind(execution.started_at)
  .bind(execution.finished_at)
  .bind(execution.id)
  .execute(&mut *conn)
  .await?;

  Ok(())
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_canvas(&self, canvas: &Canvas) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO canvases (id, organization_id, name, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?)
      "#,
    )
    .bind(canvas.id)
    .bind(canvas.organization_id)
    .bind(&canvas.name)
    .bind(canvas.created_at)
    .bind(canvas.updated_at)
    .execute(&self.pool)
    .await
    .map_err(|err| {
      unique_violation(err, || Error::NameAlreadyUsed {
        kind: "canvas",
        name: canvas.name.clone(),
      })
    })?;

    debug!(canvas_id = %canvas.id, name = %canvas.name, "canvas_created");
    Ok(())
  }

  async fn get_canvas(&self, organization_id: Uuid, canvas_id: Uuid) -> Result<Canvas, Error> {
    let row: Option<CanvasRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, name, created_at, updated_at
      FROM canvases
      WHERE organization_id = ? AND id = ?
      "#,
    )
    .bind(organization_id)
    .bind(canvas_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(Canvas::from)
      .ok_or_else(|| Error::not_found("canvas", canvas_id))
  }

  async fn find_canvas_by_name(&self, organization_id: Uuid, name: &str) -> Result<Canvas, Error> {
    let row: Option<CanvasRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, name, created_at, updated_at
      FROM canvases
      WHERE organization_id = ? AND name = ?
      "#,
    )
    .bind(organization_id)
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(Canvas::from)
      .ok_or_else(|| Error::not_found("canvas", name))
  }

  async fn list_canvases(&self, organization_id: Uuid) -> Result<Vec<Canvas>, Error> {
    let rows: Vec<CanvasRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, name, created_at, updated_at
      FROM canvases
      WHERE organization_id = ?
      ORDER BY name
      "#,
    )
    .bind(organization_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(Canvas::from).collect())
  }

  async fn create_event_source(&self, source: &EventSource) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO event_sources (id, organization_id, canvas_id, name, key, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(source.id)
    .bind(source.organization_id)
    .bind(source.canvas_id)
    .bind(&source.name)
    .bind(&source.key)
    .bind(source.created_at)
    .bind(source.updated_at)
    .execute(&self.pool)
    .await
    .map_err(|err| {
      unique_violation(err, || Error::NameAlreadyUsed {
        kind: "event source",
        name: source.name.clone(),
      })
    })?;

    debug!(event_source_id = %source.id, name = %source.name, "event_source_created");
    Ok(())
  }

  async fn get_event_source(&self, source_id: Uuid) -> Result<EventSource, Error> {
    let row: Option<EventSourceRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, canvas_id, name, key, created_at, updated_at
      FROM event_sources
      WHERE id = ?
      "#,
    )
    .bind(source_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(EventSource::from)
      .ok_or_else(|| Error::not_found("event source", source_id))
  }

  async fn find_event_source_by_name(
    &self,
    canvas_id: Uuid,
    name: &str,
  ) -> Result<EventSource, Error> {
    let row: Option<EventSourceRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, canvas_id, name, key, created_at, updated_at
      FROM event_sources
      WHERE canvas_id = ? AND name = ?
      "#,
    )
    .bind(canvas_id)
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(EventSource::from)
      .ok_or_else(|| Error::not_found("event source", name))
  }

  async fn list_event_sources(&self, canvas_id: Uuid) -> Result<Vec<EventSource>, Error> {
    let rows: Vec<EventSourceRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, canvas_id, name, key, created_at, updated_at
      FROM event_sources
      WHERE canvas_id = ?
      ORDER BY name
      "#,
    )
    .bind(canvas_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(EventSource::from).collect())
  }

  async fn create_stage(&self, stage: &Stage, connections: &[StageConnection]) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
      INSERT INTO stages (id, organization_id, canvas_id, name, approval_required, run_template, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(stage.id)
    .bind(stage.organization_id)
    .bind(stage.canvas_id)
    .bind(&stage.name)
    .bind(stage.approval_required)
    .bind(Json(&stage.run_template))
    .bind(stage.created_at)
    .bind(stage.updated_at)
    .execute(&mut *tx)
    .await
    .map_err(|err| {
      unique_violation(err, || Error::NameAlreadyUsed {
        kind: "stage",
        name: stage.name.clone(),
      })
    })?;

    insert_connections(&mut tx, connections).await?;
    tx.commit().await?;

    debug!(stage_id = %stage.id, connections = connections.len(), "stage_created");
    Ok(())
  }

  async fn get_stage(&self, stage_id: Uuid) -> Result<Stage, Error> {
    let row: Option<StageRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, canvas_id, name, approval_required, run_template, created_at, updated_at
      FROM stages
      WHERE id = ?
      "#,
    )
    .bind(stage_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(Stage::from)
      .ok_or_else(|| Error::not_found("stage", stage_id))
  }

  async fn find_stage_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Stage, Error> {
    let row: Option<StageRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, canvas_id, name, approval_required, run_template, created_at, updated_at
      FROM stages
      WHERE canvas_id = ? AND name = ?
      "#,
    )
    .bind(canvas_id)
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(Stage::from)
      .ok_or_else(|| Error::not_found("stage", name))
  }

  async fn list_stages(&self, canvas_id: Uuid) -> Result<Vec<Stage>, Error> {
    let rows: Vec<StageRow> = sqlx::query_as(
      r#"
      SELECT id, organization_id, canvas_id, name, approval_required, run_template, created_at, updated_at
      FROM stages
      WHERE canvas_id = ?
      ORDER BY created_at, rowid
      "#,
    )
    .bind(canvas_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(Stage::from).collect())
  }

  async fn update_stage_connections(
    &self,
    stage_id: Uuid,
    connections: &[StageConnection],
    updated_at: DateTime<Utc>,
  ) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    let updated = sqlx::query("UPDATE stages SET updated_at = ? WHERE id = ?")
      .bind(updated_at)
      .bind(stage_id)
      .execute(&mut *tx)
      .await?;
    if updated.rows_affected() == 0 {
      return Err(Error::not_found("stage", stage_id));
    }

    sqlx::query("DELETE FROM stage_connections WHERE stage_id = ?")
      .bind(stage_id)
      .execute(&mut *tx)
      .await?;
    insert_connections(&mut tx, connections).await?;
    tx.commit().await?;

    debug!(stage_id = %stage_id, connections = connections.len(), "stage_connections_replaced");
    Ok(())
  }

  async fn list_connections(&self, stage_id: Uuid) -> Result<Vec<StageConnection>, Error> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM stage_connections WHERE stage_id = ? ORDER BY rowid"
    ))
    .bind(stage_id)
    .fetch_all(&self.pool)
    .await?;

    collect(rows)
  }

  async fn list_connections_for_source(
    &self,
    source: ConnectionSource,
  ) -> Result<Vec<StageConnection>, Error> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM stage_connections WHERE source_type = ? AND source_id = ? ORDER BY rowid"
    ))
    .bind(source.source_type().as_str())
    .bind(source.id())
    .fetch_all(&self.pool)
    .await?;

    collect(rows)
  }

  async fn list_canvas_connections(&self, canvas_id: Uuid) -> Result<Vec<StageConnection>, Error> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(
      r#"
      SELECT c.id, c.stage_id, c.source_type, c.source_id, c.source_name, c.filter_operator, c.filters
      FROM stage_connections c
      JOIN stages s ON s.id = c.stage_id
      WHERE s.canvas_id = ?
      ORDER BY c.rowid
      "#,
    )
    .bind(canvas_id)
    .fetch_all(&self.pool)
    .await?;

    collect(rows)
  }

  async fn create_event(&self, event: &Event) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    insert_event(&mut conn, event).await?;

    debug!(event_id = %event.id, source = %event.source_name, "event_created");
    Ok(())
  }

  async fn get_event(&self, event_id: Uuid) -> Result<Event, Error> {
    let row: Option<EventRow> = sqlx::query_as(
      r#"
      SELECT id, source_type, source_id, source_name, state, received_at, raw
      FROM events
      WHERE id = ?
      "#,
    )
    .bind(event_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .ok_or_else(|| Error::not_found("event", event_id))?
      .try_into()
  }

  async fn list_events_in_state(&self, state: EventState, limit: u32) -> Result<Vec<Event>, Error> {
    let rows: Vec<EventRow> = sqlx::query_as(
      r#"
      SELECT id, source_type, source_id, source_name, state, received_at, raw
      FROM events
      WHERE state = ?
      ORDER BY received_at, rowid
      LIMIT ?
      "#,
    )
    .bind(state.as_str())
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    collect(rows)
  }

  async fn route_event(&self, event_id: Uuid, stage_events: &[StageEvent]) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    transition_event(&mut tx, event_id, EventState::Processed).await?;
    for stage_event in stage_events {
      insert_stage_event(&mut tx, stage_event).await?;
    }
    tx.commit().await?;

    Ok(())
  }

  async fn discard_event(&self, event_id: Uuid) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    transition_event(&mut tx, event_id, EventState::Discarded).await?;
    tx.commit().await?;
    Ok(())
  }

  async fn create_stage_event(&self, stage_event: &StageEvent) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    insert_stage_event(&mut conn, stage_event).await
  }

  async fn get_stage_event(&self, stage_id: Uuid, stage_event_id: Uuid) -> Result<StageEvent, Error> {
    let mut conn = self.pool.acquire().await?;
    let stage_event = fetch_stage_event(&mut conn, stage_event_id).await?;
    if stage_event.stage_id != stage_id {
      return Err(Error::not_found("stage event", stage_event_id));
    }
    Ok(stage_event)
  }

  async fn list_stage_events(
    &self,
    stage_id: Uuid,
    states: &[StageEventState],
  ) -> Result<Vec<StageEvent>, Error> {
    let mut query = QueryBuilder::<Sqlite>::new(format!(
      "SELECT {STAGE_EVENT_COLUMNS} FROM stage_events WHERE stage_id = "
    ));
    query.push_bind(stage_id);
    if !states.is_empty() {
      query.push(" AND state IN (");
      let mut separated = query.separated(", ");
      for state in states {
        separated.push_bind(state.as_str());
      }
      separated.push_unseparated(")");
    }
    query.push(" ORDER BY created_at, rowid");

    let rows: Vec<StageEventRow> = query.build_query_as().fetch_all(&self.pool).await?;
    collect(rows)
  }

  async fn find_stages_with_pending_events(&self) -> Result<Vec<Uuid>, Error> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
      r#"
      SELECT stage_id
      FROM stage_events
      WHERE state = ?
      GROUP BY stage_id
      ORDER BY MIN(rowid)
      "#,
    )
    .bind(StageEventState::Pending.as_str())
    .fetch_all(&self.pool)
    .await?;

    Ok(ids)
  }

  async fn find_oldest_pending_stage_event(
    &self,
    stage_id: Uuid,
  ) -> Result<Option<StageEvent>, Error> {
    let row: Option<StageEventRow> = sqlx::query_as(&format!(
      r#"
      SELECT {STAGE_EVENT_COLUMNS}
      FROM stage_events
      WHERE stage_id = ? AND state = ?
      ORDER BY created_at, rowid
      LIMIT 1
      "#
    ))
    .bind(stage_id)
    .bind(StageEventState::Pending.as_str())
    .fetch_optional(&self.pool)
    .await?;

    row.map(StageEvent::try_from).transpose()
  }

  async fn approve_stage_event(
    &self,
    stage_id: Uuid,
    stage_event_id: Uuid,
    approved_by: Uuid,
    approved_at: DateTime<Utc>,
  ) -> Result<StageEvent, Error> {
    let mut tx = self.pool.begin().await?;

    let mut stage_event = fetch_stage_event(&mut tx, stage_event_id).await?;
    if stage_event.stage_id != stage_id {
      return Err(Error::not_found("stage event", stage_event_id));
    }
    stage_event.approve(approved_by, approved_at)?;
    write_stage_event_state(&mut tx, &stage_event).await?;
    tx.commit().await?;

    Ok(stage_event)
  }

  async fn update_stage_event_state(
    &self,
    stage_event_id: Uuid,
    state: StageEventState,
  ) -> Result<StageEvent, Error> {
    let mut tx = self.pool.begin().await?;

    let mut stage_event = fetch_stage_event(&mut tx, stage_event_id).await?;
    stage_event.state = stage_event.state.transition(state)?;
    write_stage_event_state(&mut tx, &stage_event).await?;
    tx.commit().await?;

    Ok(stage_event)
  }

  async fn upsert_stage_event_tag(&self, tag: &StageEventTag) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO stage_event_tags (stage_event_id, name, value, healthy)
      VALUES (?, ?, ?, ?)
      ON CONFLICT (stage_event_id, name) DO UPDATE
      SET value = excluded.value, healthy = excluded.healthy
      "#,
    )
    .bind(tag.stage_event_id)
    .bind(&tag.name)
    .bind(&tag.value)
    .bind(tag.healthy)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn update_tag_health(&self, name: &str, value: &str, healthy: bool) -> Result<u64, Error> {
    let result = sqlx::query("UPDATE stage_event_tags SET healthy = ? WHERE name = ? AND value = ?")
      .bind(healthy)
      .bind(name)
      .bind(value)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected())
  }

  async fn list_stage_event_tags(&self, stage_event_id: Uuid) -> Result<Vec<StageEventTag>, Error> {
    let rows: Vec<TagRow> = sqlx::query_as(
      r#"
      SELECT stage_event_id, name, value, healthy
      FROM stage_event_tags
      WHERE stage_event_id = ?
      ORDER BY name
      "#,
    )
    .bind(stage_event_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(StageEventTag::from).collect())
  }

  async fn create_stage_execution(&self, execution: &StageExecution) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    let in_flight: Option<Uuid> = sqlx::query_scalar(
      "SELECT id FROM stage_executions WHERE stage_id = ? AND state IN (?, ?) LIMIT 1",
    )
    .bind(execution.stage_id)
    .bind(ExecutionState::Pending.as_str())
    .bind(ExecutionState::Started.as_str())
    .fetch_optional(&mut *tx)
    .await?;
    if in_flight.is_some() {
      return Err(Error::ExecutionInFlight(execution.stage_id));
    }

    let mut stage_event = fetch_stage_event(&mut tx, execution.stage_event_id).await?;
    if stage_event.stage_id != execution.stage_id {
      return Err(Error::not_found("stage event", execution.stage_event_id));
    }
    stage_event.state = stage_event.state.transition(StageEventState::Processed)?;

    sqlx::query(&format!(
      "INSERT INTO stage_executions ({EXECUTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(execution.id)
    .bind(execution.stage_id)
    .bind(execution.stage_event_id)
    .bind(execution.state.as_str())
    .bind(execution.result.map(ExecutionResult::as_str))
    .bind(&execution.reference_id)
    .bind(execution.created_at)
    .bind(execution.started_at)
    .bind(execution.finished_at)
    .execute(&mut *tx)
    .await
    .map_err(|err| unique_violation(err, || Error::ExecutionInFlight(execution.stage_id)))?;

    write_stage_event_state(&mut tx, &stage_event).await?;
    tx.commit().await?;

    debug!(execution_id = %execution.id, stage_id = %execution.stage_id, "stage_execution_created");
    Ok(())
  }

  async fn get_execution(&self, execution_id: Uuid) -> Result<StageExecution, Error> {
    let mut conn = self.pool.acquire().await?;
    fetch_execution(&mut conn, execution_id).await
  }

  async fn find_execution_in_state(
    &self,
    stage_id: Uuid,
    states: &[ExecutionState],
  ) -> Result<Option<StageExecution>, Error> {
    let mut query = QueryBuilder::<Sqlite>::new(format!(
      "SELECT {EXECUTION_COLUMNS} FROM stage_executions WHERE stage_id = "
    ));
    query.push_bind(stage_id);
    if !states.is_empty() {
      query.push(" AND state IN (");
      let mut separated = query.separated(", ");
      for state in states {
        separated.push_bind(state.as_str());
      }
      separated.push_unseparated(")");
    }
    query.push(" ORDER BY created_at, rowid LIMIT 1");

    let row: Option<ExecutionRow> = query.build_query_as().fetch_optional(&self.pool).await?;
    row.map(StageExecution::try_from).transpose()
  }

  async fn list_executions_in_state(
    &self,
    state: ExecutionState,
    limit: u32,
  ) -> Result<Vec<StageExecution>, Error> {
    let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
      "SELECT {EXECUTION_COLUMNS} FROM stage_executions WHERE state = ? ORDER BY created_at, rowid LIMIT ?"
    ))
    .bind(state.as_str())
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    collect(rows)
  }

  async fn start_execution(
    &self,
    execution_id: Uuid,
    reference_id: &str,
    started_at: DateTime<Utc>,
  ) -> Result<StageExecution, Error> {
    let mut tx = self.pool.begin().await?;

    let mut execution = fetch_execution(&mut tx, execution_id).await?;
    execution.state = execution.state.transition(ExecutionState::Started)?;
    execution.reference_id = Some(reference_id.to_string());
    execution.started_at = Some(started_at);
    write_execution(&mut tx, &execution).await?;
    tx.commit().await?;

    Ok(execution)
  }

  async fn finish_execution(
    &self,
    execution_id: Uuid,
    result: ExecutionResult,
    finished_at: DateTime<Utc>,
    completion: &Event,
  ) -> Result<StageExecution, Error> {
    let mut tx = self.pool.begin().await?;

    let mut execution = fetch_execution(&mut tx, execution_id).await?;
    execution.state = execution.state.transition(ExecutionState::Finished)?;
    execution.result = Some(result);
    execution.finished_at = Some(finished_at);
    write_execution(&mut tx, &execution).await?;
    insert_event(&mut tx, completion).await?;
    tx.commit().await?;

    Ok(execution)
  }
}
