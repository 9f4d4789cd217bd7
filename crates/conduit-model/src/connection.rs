//! Stage connections: the inbound edges of a canvas.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::labelled;

/// What a connection (or event) originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ConnectionSource {
  EventSource(Uuid),
  Stage(Uuid),
}

impl ConnectionSource {
  pub fn from_parts(source_type: SourceType, id: Uuid) -> Self {
    match source_type {
      SourceType::EventSource => Self::EventSource(id),
      SourceType::Stage => Self::Stage(id),
    }
  }

  pub fn id(&self) -> Uuid {
    match self {
      Self::EventSource(id) | Self::Stage(id) => *id,
    }
  }

  pub fn source_type(&self) -> SourceType {
    match self {
      Self::EventSource(_) => SourceType::EventSource,
      Self::Stage(_) => SourceType::Stage,
    }
  }
}

/// Discriminator of [`ConnectionSource`], as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
  EventSource,
  Stage,
}

labelled!(SourceType, "source type", {
  EventSource => "event_source",
  Stage => "stage",
});

/// How the results of a connection's filters are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
  #[default]
  And,
  Or,
}

labelled!(FilterOperator, "filter operator", {
  And => "and",
  Or => "or",
});

/// A variable bound from the event payload before an expression runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionVariable {
  /// Identifier visible inside the expression.
  pub name: String,
  /// Dotted path into the event payload.
  pub path: String,
}

impl ExpressionVariable {
  pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      path: path.into(),
    }
  }
}

/// A boolean expression over bound payload variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionFilter {
  pub expression: String,
  #[serde(default)]
  pub variables: Vec<ExpressionVariable>,
}

/// A single filter on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageConnectionFilter {
  Expression(ExpressionFilter),
}

impl StageConnectionFilter {
  /// Shorthand for an expression filter.
  pub fn expression(expression: impl Into<String>, variables: Vec<ExpressionVariable>) -> Self {
    Self::Expression(ExpressionFilter {
      expression: expression.into(),
      variables,
    })
  }
}

/// A stored inbound edge of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConnection {
  pub id: Uuid,
  /// The stage this connection feeds.
  pub stage_id: Uuid,
  pub source: ConnectionSource,
  /// Name of the source, which is also the connection's name in run templates.
  pub source_name: String,
  pub filter_operator: FilterOperator,
  pub filters: Vec<StageConnectionFilter>,
}

/// A connection as requested when a stage is created or updated. The source
/// is named, and resolved to an id within the canvas before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConnection {
  pub source_type: SourceType,
  pub source_name: String,
  #[serde(default)]
  pub filter_operator: FilterOperator,
  #[serde(default)]
  pub filters: Vec<StageConnectionFilter>,
}

impl NewConnection {
  /// An unfiltered connection from the source named `source_name`.
  pub fn new(source_type: SourceType, source_name: impl Into<String>) -> Self {
    Self {
      source_type,
      source_name: source_name.into(),
      filter_operator: FilterOperator::And,
      filters: Vec::new(),
    }
  }

  pub fn with_filters(mut self, operator: FilterOperator, filters: Vec<StageConnectionFilter>) -> Self {
    self.filter_operator = operator;
    self.filters = filters;
    self
  }

  /// Materialize as a stored connection of `stage_id`, fed by `source_id`.
  pub fn into_connection(self, stage_id: Uuid, source_id: Uuid) -> StageConnection {
    StageConnection {
      id: Uuid::new_v4(),
      stage_id,
      source: ConnectionSource::from_parts(self.source_type, source_id),
      source_name: self.source_name,
      filter_operator: self.filter_operator,
      filters: self.filters,
    }
  }
}
