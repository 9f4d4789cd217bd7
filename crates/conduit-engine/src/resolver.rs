//! Resolves `${{ expression }}` placeholders in run templates.
//!
//! Resolution happens once per execution, right before it is launched.
//! Expressions see a single `self` object:
//!
//! ```text
//! ${{ self.GetConnection("gh").ref }}
//! ```
//!
//! `GetConnection` only knows the connection that triggered the execution.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use conduit_expr::{
  Bindings, DEFAULT_TIMEOUT, Deadline, ExpressionError, ExpressionEvaluator, HostError, HostObject,
  kind_name,
};
use conduit_model::{RunTemplate, SemaphoreRunTemplate};
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

static PLACEHOLDER: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^\$\{\{(.*)\}\}$").expect("placeholder pattern compiles"));

/// Errors raised while resolving a run template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error("unsupported run template type: {0}")]
  UnsupportedTemplate(&'static str),

  #[error(transparent)]
  Expression(#[from] ExpressionError),
}

/// What a run template is resolved against.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
  pub execution_id: Uuid,
  /// Name of the connection the triggering event arrived over.
  pub connection_name: String,
  /// Payload of the triggering event.
  pub payload: serde_json::Value,
  pub cancel: CancellationToken,
}

impl ExecutionContext {
  pub fn new(
    execution_id: Uuid,
    connection_name: impl Into<String>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      execution_id,
      connection_name: connection_name.into(),
      payload,
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }
}

/// The `self` object exposed to run-template expressions.
#[derive(Debug)]
struct SelfHandle {
  connection_name: String,
  payload: serde_json::Value,
}

impl HostObject for SelfHandle {
  fn call_method(
    &self,
    method: &str,
    args: &[serde_json::Value],
  ) -> Result<serde_json::Value, HostError> {
    match method {
      "GetConnection" => {
        let [serde_json::Value::String(name)] = args else {
          return Err(HostError::InvalidArguments(
            "GetConnection takes a single connection name".to_string(),
          ));
        };
        if *name != self.connection_name {
          return Err(HostError::Unsupported(format!(
            "connection '{}' did not trigger this execution, only '{}' is available",
            name, self.connection_name
          )));
        }
        Ok(self.payload.clone())
      }
      other => Err(HostError::UnknownMethod(other.to_string())),
    }
  }
}

/// Resolves every placeholder of a [`RunTemplate`], or none of them.
#[derive(Debug, Clone)]
pub struct RunTemplateResolver<E> {
  evaluator: Arc<E>,
  timeout: Duration,
}

impl<E: ExpressionEvaluator> RunTemplateResolver<E> {
  pub fn new(evaluator: Arc<E>) -> Self {
    Self::with_timeout(evaluator, DEFAULT_TIMEOUT)
  }

  /// Use `timeout` as the wall-clock budget of each placeholder.
  pub fn with_timeout(evaluator: Arc<E>, timeout: Duration) -> Self {
    Self { evaluator, timeout }
  }

  /// Resolve `template` against `context`.
  ///
  /// Literal fields are copied unchanged. The first field that fails aborts
  /// the whole resolution. Parameters resolve in key order.
  pub async fn resolve(
    &self,
    context: &ExecutionContext,
    template: &RunTemplate,
  ) -> Result<RunTemplate, ResolveError> {
    let template = match template {
      RunTemplate::Semaphore(template) => template,
      other => return Err(ResolveError::UnsupportedTemplate(other.type_name())),
    };

    let handle: Arc<dyn HostObject> = Arc::new(SelfHandle {
      connection_name: context.connection_name.clone(),
      payload: context.payload.clone(),
    });
    let deadline = Deadline::with_cancel(self.timeout, context.cancel.clone());

    let mut resolved = SemaphoreRunTemplate {
      project_id: self
        .field(context, &handle, &deadline, "project_id", &template.project_id)
        .await?,
      branch: self
        .field(context, &handle, &deadline, "branch", &template.branch)
        .await?,
      pipeline_file: self
        .field(context, &handle, &deadline, "pipeline_file", &template.pipeline_file)
        .await?,
      task_id: self
        .field(context, &handle, &deadline, "task_id", &template.task_id)
        .await?,
      parameters: BTreeMap::new(),
    };
    for (name, value) in &template.parameters {
      let value = self.field(context, &handle, &deadline, name, value).await?;
      resolved.parameters.insert(name.clone(), value);
    }

    Ok(RunTemplate::Semaphore(resolved))
  }

  async fn field(
    &self,
    context: &ExecutionContext,
    handle: &Arc<dyn HostObject>,
    deadline: &Deadline,
    name: &str,
    value: &str,
  ) -> Result<String, ResolveError> {
    let Some(captures) = PLACEHOLDER.captures(value) else {
      return Ok(value.to_string());
    };
    let expression = captures.get(1).map_or("", |m| m.as_str());

    let mut bindings = Bindings::new();
    bindings.insert_host("self", handle.clone());

    let result = self
      .evaluator
      .evaluate(expression, bindings, deadline)
      .await
      .inspect_err(|e| {
        warn!(execution_id = %context.execution_id, field = name, error = %e, "placeholder_failed");
      })?;

    match result {
      serde_json::Value::String(resolved) => {
        debug!(execution_id = %context.execution_id, field = name, "placeholder_resolved");
        Ok(resolved)
      }
      other => Err(
        ExpressionError::UnexpectedType {
          expected: "string",
          found: kind_name(&other),
        }
        .into(),
      ),
    }
  }
}
