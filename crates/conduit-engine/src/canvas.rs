//! Canvas, event source and stage management.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use conduit_model::{
  Canvas, CanvasGraph, ConnectionSource, EventSource, NewConnection, NewStage, SourceType, Stage,
  StageConnection,
};
use conduit_store::Store;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::notify::{NoopNotifier, Transition, TransitionNotifier};

/// Size of a generated event source key, in bytes.
const KEY_BYTES: usize = 32;

/// Errors raised while managing a canvas.
#[derive(Debug, Error)]
pub enum CanvasError {
  #[error(transparent)]
  Store(#[from] conduit_store::Error),

  #[error("{source_type} '{name}' not found in canvas")]
  SourceNotFound { source_type: SourceType, name: String },

  #[error("stage '{0}' cannot be connected to itself")]
  SelfConnection(String),

  #[error("stage '{stage}' is connected to '{source_name}' more than once")]
  DuplicateSource { stage: String, source_name: String },

  #[error("connections would form a cycle: {0}")]
  Cycle(String),

  #[error(transparent)]
  Encryption(#[from] EncryptionError),
}

/// Failure reported by an [`Encryptor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("encryption failed: {0}")]
pub struct EncryptionError(pub String);

/// Encrypts event source keys at rest.
#[async_trait]
pub trait Encryptor: Send + Sync {
  async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;

  async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

/// Stores keys as given. For development and tests only.
#[derive(Debug, Clone, Default)]
pub struct NoopEncryptor;

#[async_trait]
impl Encryptor for NoopEncryptor {
  async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    Ok(plaintext.to_vec())
  }

  async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    Ok(ciphertext.to_vec())
  }
}

/// A stage together with its inbound connections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageDescription {
  pub stage: Stage,
  pub connections: Vec<StageConnection>,
}

/// Everything on a canvas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanvasDescription {
  pub canvas: Canvas,
  pub event_sources: Vec<EventSource>,
  pub stages: Vec<StageDescription>,
}

/// Creates and describes canvases and what is on them.
pub struct CanvasService<S> {
  store: Arc<S>,
  encryptor: Arc<dyn Encryptor>,
  notifier: Arc<dyn TransitionNotifier>,
}

impl<S: Store> CanvasService<S> {
  pub fn new(store: Arc<S>, encryptor: Arc<dyn Encryptor>) -> Self {
    Self {
      store,
      encryptor,
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn TransitionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  #[instrument(skip(self))]
  pub async fn create_canvas(&self, organization_id: Uuid, name: &str) -> Result<Canvas, CanvasError> {
    let now = Utc::now();
    let canvas = Canvas {
      id: Uuid::new_v4(),
      organization_id,
      name: name.to_string(),
      created_at: now,
      updated_at: now,
    };
    self.store.create_canvas(&canvas).await?;

    info!(canvas_id = %canvas.id, "canvas_created");
    Ok(canvas)
  }

  pub async fn list_canvases(&self, organization_id: Uuid) -> Result<Vec<Canvas>, CanvasError> {
    Ok(self.store.list_canvases(organization_id).await?)
  }

  pub async fn describe_canvas(
    &self,
    organization_id: Uuid,
    canvas_id: Uuid,
  ) -> Result<CanvasDescription, CanvasError> {
    let canvas = self.store.get_canvas(organization_id, canvas_id).await?;
    let event_sources = self.store.list_event_sources(canvas_id).await?;
    let stages = self.store.list_stages(canvas_id).await?;

    let mut connections: BTreeMap<Uuid, Vec<StageConnection>> = BTreeMap::new();
    for connection in self.store.list_canvas_connections(canvas_id).await? {
      connections
        .entry(connection.stage_id)
        .or_default()
        .push(connection);
    }

    let stages = stages
      .into_iter()
      .map(|stage| StageDescription {
        connections: connections.remove(&stage.id).unwrap_or_default(),
        stage,
      })
      .collect();

    Ok(CanvasDescription {
      canvas,
      event_sources,
      stages,
    })
  }

  /// Create an event source with a fresh signing key.
  ///
  /// Only the encrypted key is stored. The plaintext is returned here and
  /// never again.
  #[instrument(skip(self))]
  pub async fn create_event_source(
    &self,
    organization_id: Uuid,
    canvas_id: Uuid,
    name: &str,
  ) -> Result<(EventSource, String), CanvasError> {
    self.store.get_canvas(organization_id, canvas_id).await?;

    let key = generate_key();
    let encrypted = self.encryptor.encrypt(key.as_bytes()).await?;

    let now = Utc::now();
    let source = EventSource {
      id: Uuid::new_v4(),
      organization_id,
      canvas_id,
      name: name.to_string(),
      key: encrypted,
      created_at: now,
      updated_at: now,
    };
    self.store.create_event_source(&source).await?;

    info!(event_source_id = %source.id, "event_source_created");
    Ok((source, key))
  }

  /// Decrypt the signing key of `source`.
  pub async fn event_source_key(&self, source: &EventSource) -> Result<Vec<u8>, CanvasError> {
    Ok(self.encryptor.decrypt(&source.key).await?)
  }

  /// Create a stage and its connections in one step.
  ///
  /// Connection sources are looked up by name within the canvas.
  #[instrument(skip(self, new_stage), fields(stage = %new_stage.name))]
  pub async fn create_stage(
    &self,
    organization_id: Uuid,
    canvas_id: Uuid,
    new_stage: NewStage,
  ) -> Result<Stage, CanvasError> {
    self.store.get_canvas(organization_id, canvas_id).await?;

    let now = Utc::now();
    let stage = Stage {
      id: Uuid::new_v4(),
      organization_id,
      canvas_id,
      name: new_stage.name,
      approval_required: new_stage.approval_required,
      run_template: new_stage.run_template,
      created_at: now,
      updated_at: now,
    };
    let connections = self
      .resolve_connections(&stage, new_stage.connections)
      .await?;

    self.store.create_stage(&stage, &connections).await?;

    info!(stage_id = %stage.id, connections = connections.len(), "stage_created");
    self.notifier.notify(Transition::StageCreated {
      canvas_id,
      stage_id: stage.id,
    });
    Ok(stage)
  }

  /// Replace the connections of a stage. The canvas must stay acyclic.
  #[instrument(skip(self, connections))]
  pub async fn update_stage_connections(
    &self,
    organization_id: Uuid,
    canvas_id: Uuid,
    stage_id: Uuid,
    connections: Vec<NewConnection>,
  ) -> Result<Vec<StageConnection>, CanvasError> {
    self.store.get_canvas(organization_id, canvas_id).await?;
    let stage = self.store.get_stage(stage_id).await?;
    if stage.canvas_id != canvas_id {
      return Err(conduit_store::Error::not_found("stage", stage_id).into());
    }

    let connections = self.resolve_connections(&stage, connections).await?;

    let stages = self.store.list_stages(canvas_id).await?;
    let existing = self.store.list_canvas_connections(canvas_id).await?;
    let mut graph = CanvasGraph::new(stages.iter().map(|s| s.id), &existing);
    graph.replace_inbound(stage_id, connections.iter().map(|c| c.source));

    if let Some(cycle) = graph.find_cycle() {
      let names: BTreeMap<Uuid, &str> = stages.iter().map(|s| (s.id, s.name.as_str())).collect();
      let path = cycle
        .iter()
        .map(|id| names.get(id).copied().unwrap_or("?"))
        .collect::<Vec<_>>()
        .join(" -> ");
      return Err(CanvasError::Cycle(path));
    }

    self
      .store
      .update_stage_connections(stage_id, &connections, Utc::now())
      .await?;

    info!(stage_id = %stage_id, connections = connections.len(), "stage_updated");
    self.notifier.notify(Transition::StageUpdated {
      canvas_id,
      stage_id,
    });
    Ok(connections)
  }

  async fn resolve_connections(
    &self,
    stage: &Stage,
    requested: Vec<NewConnection>,
  ) -> Result<Vec<StageConnection>, CanvasError> {
    let mut seen = BTreeSet::new();
    let mut connections = Vec::with_capacity(requested.len());

    for connection in requested {
      let source_id = self.find_source(stage, &connection).await?;
      let source = ConnectionSource::from_parts(connection.source_type, source_id);
      if source == ConnectionSource::Stage(stage.id) {
        return Err(CanvasError::SelfConnection(stage.name.clone()));
      }
      if !seen.insert(source) {
        return Err(CanvasError::DuplicateSource {
          stage: stage.name.clone(),
          source_name: connection.source_name,
        });
      }
      connections.push(connection.into_connection(stage.id, source_id));
    }

    Ok(connections)
  }

  async fn find_source(&self, stage: &Stage, connection: &NewConnection) -> Result<Uuid, CanvasError> {
    let found = match connection.source_type {
      SourceType::EventSource => self
        .store
        .find_event_source_by_name(stage.canvas_id, &connection.source_name)
        .await
        .map(|source| source.id),
      SourceType::Stage if connection.source_name == stage.name => Ok(stage.id),
      SourceType::Stage => self
        .store
        .find_stage_by_name(stage.canvas_id, &connection.source_name)
        .await
        .map(|stage| stage.id),
    };

    found.map_err(|err| match err {
      err if err.is_not_found() => CanvasError::SourceNotFound {
        source_type: connection.source_type,
        name: connection.source_name.clone(),
      },
      err => err.into(),
    })
  }
}

/// A random URL-safe signing key.
fn generate_key() -> String {
  let mut bytes = [0u8; KEY_BYTES];
  rand::rng().fill_bytes(&mut bytes);
  URL_SAFE_NO_PAD.encode(bytes)
}
