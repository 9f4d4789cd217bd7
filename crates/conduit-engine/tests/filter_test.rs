//! Connection filter behavior against real expressions.

use std::sync::Arc;

use chrono::Utc;
use conduit_engine::{ConnectionFilterEngine, FilterError};
use conduit_expr::{ExpressionError, MiniJinjaEvaluator, PathError};
use conduit_model::{
  ConnectionSource, Event, EventState, ExpressionVariable, FilterOperator, NewConnection,
  SourceType, StageConnection, StageConnectionFilter,
};
use serde_json::json;
use uuid::Uuid;

fn engine() -> ConnectionFilterEngine<MiniJinjaEvaluator> {
  ConnectionFilterEngine::new(Arc::new(MiniJinjaEvaluator::new()))
}

fn event(raw: serde_json::Value) -> Event {
  Event {
    id: Uuid::new_v4(),
    source: ConnectionSource::EventSource(Uuid::nil()),
    source_name: "gh".to_string(),
    state: EventState::Pending,
    received_at: Utc::now(),
    raw,
  }
}

fn filter(expression: &str, variables: &[(&str, &str)]) -> StageConnectionFilter {
  StageConnectionFilter::expression(
    expression,
    variables
      .iter()
      .map(|(name, path)| ExpressionVariable::new(*name, *path))
      .collect(),
  )
}

fn connection(operator: FilterOperator, filters: Vec<StageConnectionFilter>) -> StageConnection {
  NewConnection::new(SourceType::EventSource, "gh")
    .with_filters(operator, filters)
    .into_connection(Uuid::new_v4(), Uuid::nil())
}

#[tokio::test]
async fn test_and_single_filter() {
  let connection = connection(
    FilterOperator::And,
    vec![filter("a == 1 && b == 2", &[("a", "a"), ("b", "b")])],
  );

  let accepted = engine()
    .accept(&connection, &event(json!({ "a": 1, "b": 2 })))
    .await
    .unwrap();
  assert!(accepted);

  let accepted = engine()
    .accept(&connection, &event(json!({ "a": 1, "b": 3 })))
    .await
    .unwrap();
  assert!(!accepted);
}

#[tokio::test]
async fn test_path_through_scalar_fails() {
  let connection = connection(
    FilterOperator::And,
    vec![filter("a == 1 && b == 2", &[("a", "a"), ("b", "a.b")])],
  );

  let err = engine()
    .accept(&connection, &event(json!({ "a": 1, "b": 2 })))
    .await
    .unwrap_err();

  assert_eq!(err, FilterError::Path(PathError::NotAMap("a".to_string())));
  assert!(err.to_string().contains("key 'a' is not a map"));
}

#[tokio::test]
async fn test_missing_key_fails_closed() {
  let connection = connection(
    FilterOperator::Or,
    vec![filter("ref == 'main'", &[("ref", "pull_request.head.ref")])],
  );

  let err = engine()
    .accept(&connection, &event(json!({ "pull_request": { "base": {} } })))
    .await
    .unwrap_err();

  assert_eq!(err, FilterError::Path(PathError::KeyNotFound("head".to_string())));
}

#[tokio::test]
async fn test_undeclared_variable() {
  let connection = connection(
    FilterOperator::And,
    vec![filter("a == 1 && b == 2", &[("a", "a")])],
  );

  let err = engine()
    .accept(&connection, &event(json!({ "a": 1, "b": 2 })))
    .await
    .unwrap_err();

  assert!(err.to_string().contains("unknown name"), "{err}");
  assert_eq!(
    err,
    FilterError::Expression(ExpressionError::UnboundName("b".to_string()))
  );
}

#[tokio::test]
async fn test_or_and_operators() {
  let filters = vec![filter("a == 1", &[("a", "a")]), filter("b == 3", &[("b", "b")])];
  let payload = json!({ "a": 1, "b": 2 });

  let or = connection(FilterOperator::Or, filters.clone());
  assert!(engine().accept(&or, &event(payload.clone())).await.unwrap());

  let and = connection(FilterOperator::And, filters);
  assert!(!engine().accept(&and, &event(payload)).await.unwrap());
}

#[tokio::test]
async fn test_membership() {
  let connection = connection(FilterOperator::And, vec![filter("1 in a", &[("a", "a")])]);

  let accepted = engine()
    .accept(&connection, &event(json!({ "a": [1, 2, 3] })))
    .await
    .unwrap();
  assert!(accepted);
}

#[tokio::test]
async fn test_empty_filters_accept() {
  for operator in [FilterOperator::And, FilterOperator::Or] {
    let connection = connection(operator, Vec::new());
    assert!(engine().accept(&connection, &event(json!({}))).await.unwrap());
  }
}

#[tokio::test]
async fn test_later_error_wins_over_decided_or() {
  let connection = connection(
    FilterOperator::Or,
    vec![
      filter("a == 1", &[("a", "a")]),
      filter("c == 1", &[("c", "missing")]),
    ],
  );

  let err = engine()
    .accept(&connection, &event(json!({ "a": 1 })))
    .await
    .unwrap_err();
  assert_eq!(err, FilterError::Path(PathError::KeyNotFound("missing".to_string())));
}

#[tokio::test]
async fn test_first_error_in_declared_order() {
  let connection = connection(
    FilterOperator::And,
    vec![
      filter("x == 1", &[("x", "first")]),
      filter("y == 1", &[("y", "second")]),
    ],
  );

  let err = engine().accept(&connection, &event(json!({}))).await.unwrap_err();
  assert_eq!(err, FilterError::Path(PathError::KeyNotFound("first".to_string())));
}

#[tokio::test]
async fn test_non_boolean_result() {
  let connection = connection(FilterOperator::And, vec![filter("a + 1", &[("a", "a")])]);

  let err = engine()
    .accept(&connection, &event(json!({ "a": 1 })))
    .await
    .unwrap_err();
  assert_eq!(
    err,
    FilterError::Expression(ExpressionError::UnexpectedType {
      expected: "boolean",
      found: "number",
    })
  );
}

#[tokio::test]
async fn test_nested_path_and_negation() {
  let connection = connection(
    FilterOperator::And,
    vec![filter(
      "branch == 'main' && !draft",
      &[("branch", "pull_request.head.ref"), ("draft", "pull_request.draft")],
    )],
  );

  let accepted = engine()
    .accept(
      &connection,
      &event(json!({ "pull_request": { "head": { "ref": "main" }, "draft": false } })),
    )
    .await
    .unwrap();
  assert!(accepted);
}
