//! Conduit Engine
//!
//! The moving parts of a delivery canvas:
//! - [`ConnectionFilterEngine`]: decides whether an event crosses a connection
//! - [`RunTemplateResolver`]: fills `${{ }}` placeholders before launch
//! - [`CanvasService`]: canvas, event source and stage management
//! - [`Dispatcher`]: routes events, admits stage events and launches
//!   executions, one tick at a time
//!
//! Every committed state change is reported to a [`TransitionNotifier`].

mod canvas;
mod dispatcher;
mod filter;
mod notify;
mod resolver;

pub use canvas::{
  CanvasDescription, CanvasError, CanvasService, EncryptionError, Encryptor, NoopEncryptor,
  StageDescription,
};
pub use dispatcher::{
  DispatchError, Dispatcher, DispatcherConfig, DryRunLauncher, LaunchError, Launcher, TickReport,
};
pub use filter::{ConnectionFilterEngine, FilterError};
pub use notify::{ChannelNotifier, NoopNotifier, Transition, TransitionNotifier};
pub use resolver::{ExecutionContext, ResolveError, RunTemplateResolver};
