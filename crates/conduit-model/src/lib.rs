//! Conduit Model
//!
//! The entities of a delivery canvas and their lifecycles:
//! - [`Canvas`] and [`EventSource`]: the workspace and its external triggers
//! - [`Stage`] with its inbound [`StageConnection`]s and [`RunTemplate`]
//! - [`Event`], [`StageEvent`] and [`StageExecution`], each with a
//!   [`StateMachine`] that rejects illegal transitions
//! - [`CanvasGraph`]: connection topology used for validation

mod canvas;
mod connection;
mod error;
mod event;
mod execution;
mod graph;
mod lifecycle;
mod stage;
mod stage_event;

pub use canvas::{Canvas, EventSource};
pub use connection::{
  ConnectionSource, ExpressionFilter, ExpressionVariable, FilterOperator, NewConnection, SourceType,
  StageConnection, StageConnectionFilter,
};
pub use error::{ParseLabelError, TransitionError};
pub use event::{Event, EventState};
pub use execution::{ExecutionResult, ExecutionState, StageExecution};
pub use graph::CanvasGraph;
pub use lifecycle::StateMachine;
pub use stage::{NewStage, RunTemplate, SemaphoreRunTemplate, Stage};
pub use stage_event::{StageEvent, StageEventState, StageEventTag};
