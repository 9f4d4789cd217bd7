//! Sandboxed expression evaluation.
//!
//! [`ExpressionEvaluator`] is the seam filters and run-template resolution
//! depend on. [`MiniJinjaEvaluator`] implements it with minijinja
//! expressions: comparisons, `and`/`or`/`not`, arithmetic, `x in seq`,
//! attribute access and filters such as `lower`.
//!
//! Every run is bounded twice. The caller's [`Deadline`] stops waiting for the
//! result (timeout or cancellation), and the evaluator's fuel budget aborts
//! the evaluation itself once it executes too many instructions. Fuel is not
//! charged inside a single builtin call such as `join`, so a timed-out
//! evaluation can hold its blocking thread until that call returns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use minijinja::value::{Object, Value};
use minijinja::{Environment, ErrorKind, State, UndefinedBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dialect::{self, SELF_ALIAS};
use crate::error::{ExpressionError, HostError};

/// Default wall-clock budget for a single evaluation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default instruction budget for a single evaluation.
pub const DEFAULT_FUEL: u64 = 50_000;

/// Globals minijinja registers on its own. They are callable from
/// expressions and are never reported as unbound.
const BUILTIN_GLOBALS: &[&str] = &["range", "dict", "namespace", "debug"];

/// Evaluator configuration.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
  /// Instruction budget per evaluation. `None` disables the budget.
  pub fuel: Option<u64>,
}

impl Default for EvaluatorConfig {
  fn default() -> Self {
    Self {
      fuel: Some(DEFAULT_FUEL),
    }
  }
}

/// Timeout and cancellation for one evaluation.
#[derive(Debug, Clone)]
pub struct Deadline {
  pub timeout: Duration,
  pub cancel: CancellationToken,
}

impl Deadline {
  /// A deadline that only expires after `timeout`.
  pub fn after(timeout: Duration) -> Self {
    Self {
      timeout,
      cancel: CancellationToken::new(),
    }
  }

  /// A deadline that also expires when `cancel` fires.
  pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
    Self { timeout, cancel }
  }
}

impl Default for Deadline {
  fn default() -> Self {
    Self::after(DEFAULT_TIMEOUT)
  }
}

/// A capability object callable from expressions, e.g. `self.GetConnection("gh")`.
pub trait HostObject: fmt::Debug + Send + Sync + 'static {
  /// Invoke `method` with JSON arguments.
  fn call_method(
    &self,
    method: &str,
    args: &[serde_json::Value],
  ) -> Result<serde_json::Value, HostError>;
}

/// A single named value visible to an expression.
#[derive(Debug, Clone)]
pub enum Binding {
  Value(serde_json::Value),
  Host(Arc<dyn HostObject>),
}

/// The variable environment an expression is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Bindings(BTreeMap<String, Binding>);

impl Bindings {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bind `name` to a JSON value, replacing any previous binding.
  pub fn insert_value(&mut self, name: impl Into<String>, value: serde_json::Value) {
    self.0.insert(name.into(), Binding::Value(value));
  }

  /// Bind `name` to a host capability object.
  pub fn insert_host(&mut self, name: impl Into<String>, host: Arc<dyn HostObject>) {
    self.0.insert(name.into(), Binding::Host(host));
  }

  pub fn contains(&self, name: &str) -> bool {
    self.0.contains_key(name)
  }

  fn into_context(self) -> Value {
    let context: BTreeMap<String, Value> = self
      .0
      .into_iter()
      .map(|(name, binding)| {
        let value = match binding {
          Binding::Value(json) => Value::from_serialize(&json),
          Binding::Host(host) => Value::from_object(HostAdapter(host)),
        };
        let name = if name == "self" { SELF_ALIAS.to_string() } else { name };
        (name, value)
      })
      .collect();
    Value::from(context)
  }
}

/// A compiled, syntax-checked expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
  source: String,
  names: Vec<String>,
}

impl Program {
  /// The expression source after operator normalization.
  pub fn source(&self) -> &str {
    &self.source
  }

  /// Top-level names the expression reads, sorted.
  pub fn names(&self) -> &[String] {
    &self.names
  }
}

/// Compile and run expressions against a set of bindings.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
  /// Parse `source`, reporting syntax errors.
  fn compile(&self, source: &str) -> Result<Program, ExpressionError>;

  /// Evaluate a compiled program.
  ///
  /// Fails with [`ExpressionError::UnboundName`] before evaluating anything if
  /// the program reads a name missing from `bindings`.
  async fn run(
    &self,
    program: &Program,
    bindings: Bindings,
    deadline: &Deadline,
  ) -> Result<serde_json::Value, ExpressionError>;

  /// Compile and run in one step.
  async fn evaluate(
    &self,
    source: &str,
    bindings: Bindings,
    deadline: &Deadline,
  ) -> Result<serde_json::Value, ExpressionError> {
    let program = self.compile(source)?;
    self.run(&program, bindings, deadline).await
  }
}

/// [`ExpressionEvaluator`] backed by minijinja.
///
/// Built once per process and shared by reference.
#[derive(Clone)]
pub struct MiniJinjaEvaluator {
  env: Arc<Environment<'static>>,
}

impl MiniJinjaEvaluator {
  pub fn new() -> Self {
    Self::with_config(EvaluatorConfig::default())
  }

  pub fn with_config(config: EvaluatorConfig) -> Self {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_fuel(config.fuel);
    Self { env: Arc::new(env) }
  }
}

impl Default for MiniJinjaEvaluator {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for MiniJinjaEvaluator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MiniJinjaEvaluator").finish_non_exhaustive()
  }
}

#[async_trait]
impl ExpressionEvaluator for MiniJinjaEvaluator {
  fn compile(&self, source: &str) -> Result<Program, ExpressionError> {
    let source = dialect::normalize(source).into_owned();
    let expression = self
      .env
      .compile_expression(&source)
      .map_err(|e| ExpressionError::Syntax(e.to_string()))?;

    let mut names: Vec<String> = expression
      .undeclared_variables(false)
      .into_iter()
      .filter(|name| !BUILTIN_GLOBALS.contains(&name.as_str()))
      .map(|name| if name == SELF_ALIAS { "self".to_string() } else { name })
      .collect();
    names.sort();

    Ok(Program { source, names })
  }

  async fn run(
    &self,
    program: &Program,
    bindings: Bindings,
    deadline: &Deadline,
  ) -> Result<serde_json::Value, ExpressionError> {
    if let Some(name) = program.names.iter().find(|name| !bindings.contains(name)) {
      return Err(ExpressionError::UnboundName(name.clone()));
    }

    let env = self.env.clone();
    let source = program.source.clone();
    let context = bindings.into_context();
    let handle = tokio::task::spawn_blocking(move || eval_blocking(&env, &source, context));

    tokio::select! {
      biased;
      _ = deadline.cancel.cancelled() => {
        debug!(expression = %program.source, "expression_cancelled");
        Err(ExpressionError::Cancelled)
      }
      _ = tokio::time::sleep(deadline.timeout) => {
        debug!(expression = %program.source, timeout = ?deadline.timeout, "expression_timed_out");
        Err(ExpressionError::Timeout(deadline.timeout))
      }
      joined = handle => joined
        .map_err(|e| ExpressionError::Runtime(format!("evaluation task failed: {}", e)))?,
    }
  }
}

fn eval_blocking(
  env: &Environment<'static>,
  source: &str,
  context: Value,
) -> Result<serde_json::Value, ExpressionError> {
  let expression = env
    .compile_expression(source)
    .map_err(|e| ExpressionError::Syntax(e.to_string()))?;
  let value = expression.eval(context).map_err(classify)?;
  serde_json::to_value(&value)
    .map_err(|e| ExpressionError::Runtime(format!("result is not representable as JSON: {}", e)))
}

fn classify(err: minijinja::Error) -> ExpressionError {
  let host = std::error::Error::source(&err).and_then(|s| s.downcast_ref::<HostError>());
  match host {
    Some(HostError::Unsupported(message)) => ExpressionError::Unsupported(message.clone()),
    Some(other) => ExpressionError::Host(other.to_string()),
    None if err.kind() == ErrorKind::OutOfFuel => ExpressionError::Exhausted,
    None => ExpressionError::Runtime(err.to_string()),
  }
}

/// Exposes a [`HostObject`] to minijinja.
#[derive(Debug)]
struct HostAdapter(Arc<dyn HostObject>);

impl Object for HostAdapter {
  fn call_method(
    self: &Arc<Self>,
    _state: &State<'_, '_>,
    method: &str,
    args: &[Value],
  ) -> Result<Value, minijinja::Error> {
    let args = args
      .iter()
      .map(serde_json::to_value)
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| {
        minijinja::Error::new(
          ErrorKind::InvalidOperation,
          format!("cannot pass arguments to {}: {}", method, e),
        )
      })?;

    let result = self
      .0
      .call_method(method, &args)
      .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()).with_source(e))?;

    Ok(Value::from_serialize(&result))
  }
}

/// Name of a JSON value's type, for error messages.
pub fn kind_name(value: &serde_json::Value) -> &'static str {
  match value {
    serde_json::Value::Null => "null",
    serde_json::Value::Bool(_) => "boolean",
    serde_json::Value::Number(_) => "number",
    serde_json::Value::String(_) => "string",
    serde_json::Value::Array(_) => "array",
    serde_json::Value::Object(_) => "object",
  }
}
