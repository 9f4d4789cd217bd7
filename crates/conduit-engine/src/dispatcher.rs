//! Moves events through the canvas.
//!
//! Each [`Dispatcher::tick`] runs three phases against the store:
//!
//! 1. route pending events along the connections of their source;
//! 2. admit the oldest pending stage event of every stage with nothing in
//!    flight;
//! 3. resolve and launch pending executions.
//!
//! Finishing an execution emits a new event whose source is the stage, which
//! the next tick routes downstream. A failure on one item is logged and the
//! item is retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conduit_expr::{DEFAULT_TIMEOUT, Deadline, ExpressionEvaluator};
use conduit_model::{
  ConnectionSource, Event, EventState, ExecutionResult, ExecutionState, RunTemplate, StageEvent,
  StageEventState, StageExecution,
};
use conduit_store::Store;
use serde_json::json;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::filter::{ConnectionFilterEngine, FilterError};
use crate::notify::{NoopNotifier, Transition, TransitionNotifier};
use crate::resolver::{ExecutionContext, ResolveError, RunTemplateResolver};

/// Errors raised while dispatching a single item.
#[derive(Debug, Error)]
pub enum DispatchError {
  #[error(transparent)]
  Store(#[from] conduit_store::Error),

  #[error(transparent)]
  Filter(#[from] FilterError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Launch(#[from] LaunchError),
}

/// Failure reported by a [`Launcher`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("launch failed: {0}")]
pub struct LaunchError(pub String);

/// Hands a resolved run template to the system that runs it.
#[async_trait]
pub trait Launcher: Send + Sync {
  /// Start `template` for `execution`, returning the external reference id.
  async fn launch(
    &self,
    execution: &StageExecution,
    template: &RunTemplate,
  ) -> Result<String, LaunchError>;
}

/// Logs resolved templates instead of running them.
#[derive(Debug, Clone, Default)]
pub struct DryRunLauncher;

#[async_trait]
impl Launcher for DryRunLauncher {
  async fn launch(
    &self,
    execution: &StageExecution,
    template: &RunTemplate,
  ) -> Result<String, LaunchError> {
    let rendered = serde_json::to_string(template).map_err(|e| LaunchError(e.to_string()))?;
    info!(
      execution_id = %execution.id,
      stage_id = %execution.stage_id,
      template = %rendered,
      "dry_run_launch"
    );
    Ok(format!("dry-run-{}", execution.id))
  }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
  /// Delay between ticks of [`Dispatcher::start`].
  pub poll_interval: Duration,
  /// Maximum events and executions handled per phase and tick.
  pub batch_size: u32,
  /// Wall-clock budget of each filter or placeholder expression.
  pub expression_timeout: Duration,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(1),
      batch_size: 100,
      expression_timeout: DEFAULT_TIMEOUT,
    }
  }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
  pub events_processed: usize,
  pub stage_events_created: usize,
  pub executions_created: usize,
  pub executions_started: usize,
  pub failures: usize,
}

/// Drives events, stage events and executions through their lifecycles.
pub struct Dispatcher<S, E> {
  store: Arc<S>,
  filter: ConnectionFilterEngine<E>,
  resolver: RunTemplateResolver<E>,
  launcher: Arc<dyn Launcher>,
  notifier: Arc<dyn TransitionNotifier>,
  config: DispatcherConfig,
}

impl<S: Store, E: ExpressionEvaluator> Dispatcher<S, E> {
  pub fn new(
    store: Arc<S>,
    evaluator: Arc<E>,
    launcher: Arc<dyn Launcher>,
    config: DispatcherConfig,
  ) -> Self {
    let deadline = Deadline::after(config.expression_timeout);
    Self {
      store,
      filter: ConnectionFilterEngine::with_deadline(evaluator.clone(), deadline),
      resolver: RunTemplateResolver::with_timeout(evaluator, config.expression_timeout),
      launcher,
      notifier: Arc::new(NoopNotifier),
      config,
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn TransitionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Record a payload received from an event source as a pending event.
  #[instrument(skip(self, raw))]
  pub async fn ingest(&self, source_id: Uuid, raw: serde_json::Value) -> Result<Event, DispatchError> {
    let source = self.store.get_event_source(source_id).await?;
    let event = Event {
      id: Uuid::new_v4(),
      source: ConnectionSource::EventSource(source.id),
      source_name: source.name,
      state: EventState::Pending,
      received_at: Utc::now(),
      raw,
    };
    self.store.create_event(&event).await?;

    info!(event_id = %event.id, "event_ingested");
    Ok(event)
  }

  /// Route one pending event along the connections of its source.
  ///
  /// Events nothing is connected to are discarded. Otherwise one stage event
  /// is created per accepting connection and the event is marked processed,
  /// atomically. A filter error leaves the event pending.
  #[instrument(skip(self, event), fields(event_id = %event.id))]
  pub async fn process_event(&self, event: &Event) -> Result<Vec<StageEvent>, DispatchError> {
    let connections = self.store.list_connections_for_source(event.source).await?;
    if connections.is_empty() {
      self.store.discard_event(event.id).await?;
      info!("event_discarded");
      return Ok(Vec::new());
    }

    let mut stage_events = Vec::new();
    for connection in &connections {
      if !self.filter.accept(connection, event).await? {
        debug!(stage_id = %connection.stage_id, "event_filtered_out");
        continue;
      }

      let stage = self.store.get_stage(connection.stage_id).await?;
      stage_events.push(StageEvent {
        id: Uuid::new_v4(),
        stage_id: stage.id,
        event_id: event.id,
        source: event.source,
        source_name: connection.source_name.clone(),
        state: StageEventState::initial(stage.approval_required),
        created_at: Utc::now(),
        approved_at: None,
        approved_by: None,
      });
    }

    self.store.route_event(event.id, &stage_events).await?;

    for stage_event in &stage_events {
      info!(
        stage_id = %stage_event.stage_id,
        stage_event_id = %stage_event.id,
        state = %stage_event.state,
        "stage_event_created"
      );
      self.notifier.notify(Transition::StageEventCreated {
        stage_id: stage_event.stage_id,
        stage_event_id: stage_event.id,
      });
    }
    Ok(stage_events)
  }

  /// Admit the oldest pending stage event of a stage, if nothing is in flight.
  #[instrument(skip(self))]
  pub async fn process_stage(&self, stage_id: Uuid) -> Result<Option<StageExecution>, DispatchError> {
    let Some(stage_event) = self.store.find_oldest_pending_stage_event(stage_id).await? else {
      return Ok(None);
    };

    if let Some(active) = self
      .store
      .find_execution_in_state(stage_id, &ExecutionState::ACTIVE)
      .await?
    {
      debug!(execution_id = %active.id, "stage_busy");
      return Ok(None);
    }

    let execution = StageExecution {
      id: Uuid::new_v4(),
      stage_id,
      stage_event_id: stage_event.id,
      state: ExecutionState::Pending,
      result: None,
      reference_id: None,
      created_at: Utc::now(),
      started_at: None,
      finished_at: None,
    };

    match self.store.create_stage_execution(&execution).await {
      Ok(()) => {}
      // Another dispatcher admitted first.
      Err(conduit_store::Error::ExecutionInFlight(_)) => return Ok(None),
      Err(e) => return Err(e.into()),
    }

    info!(execution_id = %execution.id, stage_event_id = %stage_event.id, "execution_created");
    self.notifier.notify(Transition::ExecutionCreated {
      stage_id,
      execution_id: execution.id,
    });
    Ok(Some(execution))
  }

  /// Resolve the run template of a pending execution and launch it.
  #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
  pub async fn process_execution(
    &self,
    execution: &StageExecution,
  ) -> Result<StageExecution, DispatchError> {
    let stage = self.store.get_stage(execution.stage_id).await?;
    let stage_event = self
      .store
      .get_stage_event(execution.stage_id, execution.stage_event_id)
      .await?;
    let event = self.store.get_event(stage_event.event_id).await?;

    let context = ExecutionContext::new(execution.id, stage_event.source_name, event.raw);
    let template = self.resolver.resolve(&context, &stage.run_template).await?;
    let reference_id = self.launcher.launch(execution, &template).await?;

    let started = self
      .store
      .start_execution(execution.id, &reference_id, Utc::now())
      .await?;

    info!(reference_id = %reference_id, "execution_started");
    self.notifier.notify(Transition::ExecutionStarted {
      stage_id: started.stage_id,
      execution_id: started.id,
      reference_id,
    });
    Ok(started)
  }

  /// Finish a started execution and emit its completion event.
  #[instrument(skip(self))]
  pub async fn finish_execution(
    &self,
    execution_id: Uuid,
    result: ExecutionResult,
  ) -> Result<StageExecution, DispatchError> {
    let execution = self.store.get_execution(execution_id).await?;
    let stage = self.store.get_stage(execution.stage_id).await?;

    let completion = Event {
      id: Uuid::new_v4(),
      source: ConnectionSource::Stage(stage.id),
      source_name: stage.name.clone(),
      state: EventState::Pending,
      received_at: Utc::now(),
      raw: json!({
        "type": "execution_finished",
        "stage": { "id": stage.id, "name": stage.name },
        "execution": {
          "id": execution.id,
          "result": result,
          "reference_id": execution.reference_id,
        },
      }),
    };

    let finished = self
      .store
      .finish_execution(execution_id, result, Utc::now(), &completion)
      .await?;

    info!(result = %result, completion_event_id = %completion.id, "execution_finished");
    self.notifier.notify(Transition::ExecutionFinished {
      stage_id: finished.stage_id,
      execution_id,
      result,
    });
    Ok(finished)
  }

  /// Approve a stage event waiting for approval.
  #[instrument(skip(self))]
  pub async fn approve(
    &self,
    stage_id: Uuid,
    stage_event_id: Uuid,
    approved_by: Uuid,
  ) -> Result<StageEvent, DispatchError> {
    let stage_event = self
      .store
      .approve_stage_event(stage_id, stage_event_id, approved_by, Utc::now())
      .await?;

    info!("stage_event_approved");
    self.notifier.notify(Transition::StageEventApproved {
      stage_id,
      stage_event_id,
      approved_by,
    });
    Ok(stage_event)
  }

  /// Run every phase once.
  pub async fn tick(&self) -> Result<TickReport, DispatchError> {
    let mut report = TickReport::default();

    let events = self
      .store
      .list_events_in_state(EventState::Pending, self.config.batch_size)
      .await?;
    for event in &events {
      match self.process_event(event).await {
        Ok(created) => {
          report.events_processed += 1;
          report.stage_events_created += created.len();
        }
        Err(e) => {
          warn!(event_id = %event.id, error = %e, "event_processing_failed");
          report.failures += 1;
        }
      }
    }

    for stage_id in self.store.find_stages_with_pending_events().await? {
      match self.process_stage(stage_id).await {
        Ok(Some(_)) => report.executions_created += 1,
        Ok(None) => {}
        Err(e) => {
          warn!(stage_id = %stage_id, error = %e, "stage_processing_failed");
          report.failures += 1;
        }
      }
    }

    let executions = self
      .store
      .list_executions_in_state(ExecutionState::Pending, self.config.batch_size)
      .await?;
    for execution in &executions {
      match self.process_execution(execution).await {
        Ok(_) => report.executions_started += 1,
        Err(e) => {
          warn!(execution_id = %execution.id, error = %e, "execution_processing_failed");
          report.failures += 1;
        }
      }
    }

    Ok(report)
  }

  /// Tick at the configured interval until `cancel` fires.
  pub async fn start(&self, cancel: CancellationToken) {
    info!(poll_interval = ?self.config.poll_interval, "dispatcher_started");

    let mut interval = tokio::time::interval(self.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("dispatcher_cancelled");
          break;
        }
        _ = interval.tick() => {
          match self.tick().await {
            Ok(report) if report != TickReport::default() => debug!(?report, "tick_completed"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "tick_failed"),
          }
        }
      }
    }
  }
}
