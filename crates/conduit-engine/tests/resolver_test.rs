//! Run-template resolution against a triggering connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use conduit_engine::{ExecutionContext, ResolveError, RunTemplateResolver};
use conduit_expr::{ExpressionError, MiniJinjaEvaluator};
use conduit_model::{RunTemplate, SemaphoreRunTemplate};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn resolver() -> RunTemplateResolver<MiniJinjaEvaluator> {
  RunTemplateResolver::new(Arc::new(MiniJinjaEvaluator::new()))
}

fn context() -> ExecutionContext {
  ExecutionContext::new(
    Uuid::new_v4(),
    "gh",
    json!({
      "action": "created",
      "ref": "refs/heads/main",
      "pull_request": { "number": 42, "head": { "sha": "abc123" } }
    }),
  )
}

fn template(project_id: &str, parameters: &[(&str, &str)]) -> RunTemplate {
  RunTemplate::Semaphore(SemaphoreRunTemplate {
    project_id: project_id.to_string(),
    branch: "main".to_string(),
    pipeline_file: ".semaphore/deploy.yml".to_string(),
    task_id: String::new(),
    parameters: parameters
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
  })
}

fn semaphore(template: RunTemplate) -> SemaphoreRunTemplate {
  match template {
    RunTemplate::Semaphore(t) => t,
    other => panic!("expected semaphore template, got {other:?}"),
  }
}

#[tokio::test]
async fn test_resolves_triggering_connection() {
  let template = template(r#"${{ self.GetConnection("gh").action }}"#, &[]);

  let resolved = semaphore(resolver().resolve(&context(), &template).await.unwrap());

  assert_eq!(resolved.project_id, "created");
  assert_eq!(resolved.branch, "main");
}

#[tokio::test]
async fn test_other_connection_is_unsupported() {
  let template = template(r#"${{ self.GetConnection("other").action }}"#, &[]);

  let err = resolver().resolve(&context(), &template).await.unwrap_err();

  assert!(
    matches!(err, ResolveError::Expression(ExpressionError::Unsupported(_))),
    "got {err:?}"
  );
  assert!(err.to_string().contains("unsupported"));
}

#[tokio::test]
async fn test_literal_template_is_unchanged() {
  let template = template("p1", &[("ENV", "prod"), ("REGION", "eu-west-1")]);

  let resolved = resolver().resolve(&context(), &template).await.unwrap();

  assert_eq!(resolved, template);
}

#[tokio::test]
async fn test_parameters_resolve() {
  let template = template(
    "p1",
    &[
      ("SHA", r#"${{ self.GetConnection("gh").pull_request.head.sha }}"#),
      ("ENV", "prod"),
    ],
  );

  let resolved = semaphore(resolver().resolve(&context(), &template).await.unwrap());

  let expected: BTreeMap<String, String> = [("ENV", "prod"), ("SHA", "abc123")]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
  assert_eq!(resolved.parameters, expected);
}

#[tokio::test]
async fn test_embedded_placeholder_is_literal() {
  let template = template(r#"project-${{ self.GetConnection("gh").action }}"#, &[]);

  let resolved = semaphore(resolver().resolve(&context(), &template).await.unwrap());

  assert_eq!(resolved.project_id, r#"project-${{ self.GetConnection("gh").action }}"#);
}

#[tokio::test]
async fn test_non_string_result() {
  let template = template(r#"${{ self.GetConnection("gh").pull_request.number }}"#, &[]);

  let err = resolver().resolve(&context(), &template).await.unwrap_err();

  assert_eq!(
    err,
    ResolveError::Expression(ExpressionError::UnexpectedType {
      expected: "string",
      found: "number",
    })
  );
}

#[tokio::test]
async fn test_one_failing_parameter_fails_all() {
  let template = template(
    r#"${{ self.GetConnection("gh").action }}"#,
    &[
      ("A", r#"${{ self.GetConnection("gh").ref }}"#),
      ("B", r#"${{ self.GetConnection("upstream").ref }}"#),
    ],
  );

  assert!(resolver().resolve(&context(), &template).await.is_err());
}

#[tokio::test]
async fn test_unsupported_template_type() {
  let err = resolver()
    .resolve(&context(), &RunTemplate::Unsupported)
    .await
    .unwrap_err();

  assert_eq!(err, ResolveError::UnsupportedTemplate("unsupported"));
  assert_eq!(err.to_string(), "unsupported run template type: unsupported");
}

#[tokio::test]
async fn test_cancelled_context() {
  let cancel = CancellationToken::new();
  cancel.cancel();
  let context = context().with_cancel(cancel);
  let template = template(r#"${{ self.GetConnection("gh").action }}"#, &[]);

  let err = resolver().resolve(&context, &template).await.unwrap_err();

  assert_eq!(err, ResolveError::Expression(ExpressionError::Cancelled));
}
