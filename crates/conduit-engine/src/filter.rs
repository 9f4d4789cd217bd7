//! Decides whether an event travels along a stage connection.

use std::sync::Arc;

use conduit_expr::{
  Bindings, Deadline, ExpressionError, ExpressionEvaluator, PathError, kind_name, path,
};
use conduit_model::{Event, ExpressionFilter, FilterOperator, StageConnection, StageConnectionFilter};
use thiserror::Error;
use tracing::debug;

/// Errors that abort a filter evaluation. The event is neither accepted nor
/// rejected when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
  #[error(transparent)]
  Path(#[from] PathError),

  #[error(transparent)]
  Expression(#[from] ExpressionError),

  /// Variables can only be bound from an object payload.
  #[error("event payload is {0}, expected object")]
  PayloadNotAnObject(&'static str),
}

/// Evaluates the filters of a [`StageConnection`] against an [`Event`].
#[derive(Debug, Clone)]
pub struct ConnectionFilterEngine<E> {
  evaluator: Arc<E>,
  deadline: Deadline,
}

impl<E: ExpressionEvaluator> ConnectionFilterEngine<E> {
  pub fn new(evaluator: Arc<E>) -> Self {
    Self::with_deadline(evaluator, Deadline::default())
  }

  pub fn with_deadline(evaluator: Arc<E>, deadline: Deadline) -> Self {
    Self {
      evaluator,
      deadline,
    }
  }

  /// Whether `event` passes `connection`.
  ///
  /// A connection without filters accepts everything. Otherwise filters run
  /// in declared order and the first error is returned at once. A decided
  /// outcome never skips the remaining filters, so a broken filter is always
  /// reported.
  pub async fn accept(&self, connection: &StageConnection, event: &Event) -> Result<bool, FilterError> {
    if connection.filters.is_empty() {
      return Ok(true);
    }

    let mut results = Vec::with_capacity(connection.filters.len());
    for filter in &connection.filters {
      let result = match filter {
        StageConnectionFilter::Expression(filter) => self.evaluate(filter, event).await,
      };
      match result {
        Ok(passed) => results.push(passed),
        Err(e) => {
          debug!(connection_id = %connection.id, event_id = %event.id, error = %e, "filter_failed");
          return Err(e);
        }
      }
    }

    let accepted = match connection.filter_operator {
      FilterOperator::And => results.iter().all(|passed| *passed),
      FilterOperator::Or => results.iter().any(|passed| *passed),
    };

    debug!(
      connection_id = %connection.id,
      event_id = %event.id,
      operator = %connection.filter_operator,
      accepted,
      "connection_evaluated"
    );
    Ok(accepted)
  }

  async fn evaluate(&self, filter: &ExpressionFilter, event: &Event) -> Result<bool, FilterError> {
    let data = event
      .data()
      .ok_or_else(|| FilterError::PayloadNotAnObject(kind_name(&event.raw)))?;

    let mut bindings = Bindings::new();
    for variable in &filter.variables {
      let value = path::resolve_dotted(data, &variable.path)?;
      bindings.insert_value(variable.name.clone(), value.clone());
    }

    let value = self
      .evaluator
      .evaluate(&filter.expression, bindings, &self.deadline)
      .await?;

    value.as_bool().ok_or_else(|| {
      FilterError::Expression(ExpressionError::UnexpectedType {
        expected: "boolean",
        found: kind_name(&value),
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use async_trait::async_trait;
  use conduit_expr::{MiniJinjaEvaluator, Program};
  use conduit_model::{ConnectionSource, EventState, ExpressionVariable, NewConnection, SourceType};
  use serde_json::json;
  use uuid::Uuid;

  use super::*;

  /// Counts evaluator runs.
  #[derive(Debug, Default)]
  struct Counting {
    inner: MiniJinjaEvaluator,
    runs: AtomicUsize,
  }

  #[async_trait]
  impl ExpressionEvaluator for Counting {
    fn compile(&self, source: &str) -> Result<Program, ExpressionError> {
      self.inner.compile(source)
    }

    async fn run(
      &self,
      program: &Program,
      bindings: Bindings,
      deadline: &Deadline,
    ) -> Result<serde_json::Value, ExpressionError> {
      self.runs.fetch_add(1, Ordering::SeqCst);
      self.inner.run(program, bindings, deadline).await
    }
  }

  fn connection(operator: FilterOperator, filters: Vec<StageConnectionFilter>) -> StageConnection {
    NewConnection::new(SourceType::EventSource, "gh")
      .with_filters(operator, filters)
      .into_connection(Uuid::new_v4(), Uuid::nil())
  }

  fn event(raw: serde_json::Value) -> Event {
    Event {
      id: Uuid::new_v4(),
      source: ConnectionSource::EventSource(Uuid::nil()),
      source_name: "gh".to_string(),
      state: EventState::Pending,
      received_at: chrono::Utc::now(),
      raw,
    }
  }

  fn engine() -> ConnectionFilterEngine<MiniJinjaEvaluator> {
    ConnectionFilterEngine::new(Arc::new(MiniJinjaEvaluator::new()))
  }

  #[tokio::test]
  async fn test_non_object_payload() {
    let connection = connection(
      FilterOperator::And,
      vec![StageConnectionFilter::expression(
        "a == 1",
        vec![ExpressionVariable::new("a", "a")],
      )],
    );

    let err = engine().accept(&connection, &event(json!([1]))).await.unwrap_err();
    assert_eq!(err, FilterError::PayloadNotAnObject("array"));
  }

  #[tokio::test]
  async fn test_non_object_payload_without_filters() {
    let connection = connection(FilterOperator::Or, Vec::new());
    assert!(engine().accept(&connection, &event(json!("x"))).await.unwrap());
  }

  #[tokio::test]
  async fn test_stops_at_first_error() {
    let evaluator = Arc::new(Counting::default());
    let engine = ConnectionFilterEngine::new(evaluator.clone());
    let connection = connection(
      FilterOperator::And,
      vec![
        StageConnectionFilter::expression("x == 1", vec![ExpressionVariable::new("x", "missing")]),
        StageConnectionFilter::expression("a == 1", vec![ExpressionVariable::new("a", "a")]),
      ],
    );

    let err = engine
      .accept(&connection, &event(json!({ "a": 1 })))
      .await
      .unwrap_err();

    assert_eq!(err, FilterError::Path(PathError::KeyNotFound("missing".to_string())));
    assert_eq!(evaluator.runs.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_decided_outcome_still_runs_later_filters() {
    let evaluator = Arc::new(Counting::default());
    let engine = ConnectionFilterEngine::new(evaluator.clone());
    let connection = connection(
      FilterOperator::Or,
      vec![
        StageConnectionFilter::expression("a == 1", vec![ExpressionVariable::new("a", "a")]),
        StageConnectionFilter::expression("a == 2", vec![ExpressionVariable::new("a", "a")]),
      ],
    );

    assert!(engine.accept(&connection, &event(json!({ "a": 1 }))).await.unwrap());
    assert_eq!(evaluator.runs.load(Ordering::SeqCst), 2);
  }
}
