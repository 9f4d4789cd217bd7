//! Stages and the run templates they execute.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::NewConnection;

/// A node of the canvas: one runnable unit with inbound connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
  pub id: Uuid,
  pub organization_id: Uuid,
  pub canvas_id: Uuid,
  pub name: String,
  pub approval_required: bool,
  pub run_template: RunTemplate,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A stage to be created, together with its connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStage {
  pub name: String,
  #[serde(default)]
  pub approval_required: bool,
  pub run_template: RunTemplate,
  #[serde(default)]
  pub connections: Vec<NewConnection>,
}

/// What a stage execution runs, keyed by target type.
///
/// Every string field may be a literal or a `${{ expression }}` placeholder
/// resolved when the execution starts. Types written by newer producers
/// deserialize as [`RunTemplate::Unsupported`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTemplate {
  Semaphore(SemaphoreRunTemplate),
  #[serde(other)]
  Unsupported,
}

impl RunTemplate {
  pub fn type_name(&self) -> &'static str {
    match self {
      Self::Semaphore(_) => "semaphore",
      Self::Unsupported => "unsupported",
    }
  }
}

/// Runs a pipeline (or a task) of an existing Semaphore project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreRunTemplate {
  pub project_id: String,
  pub branch: String,
  pub pipeline_file: String,
  #[serde(default)]
  pub task_id: String,
  #[serde(default)]
  pub parameters: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_template_wire_format() {
    let template: RunTemplate = serde_json::from_value(json!({
      "type": "semaphore",
      "project_id": "p1",
      "branch": "main",
      "pipeline_file": ".semaphore/deploy.yml",
      "parameters": { "ENV": "prod" }
    }))
    .unwrap();

    let RunTemplate::Semaphore(t) = &template else {
      panic!("expected semaphore template, got {template:?}");
    };
    assert_eq!(t.project_id, "p1");
    assert_eq!(t.task_id, "");
    assert_eq!(t.parameters["ENV"], "prod");
  }

  #[test]
  fn test_unknown_template_type() {
    let template: RunTemplate = serde_json::from_value(json!({ "type": "github_action" })).unwrap();
    assert_eq!(template, RunTemplate::Unsupported);
    assert_eq!(template.type_name(), "unsupported");
  }
}
