//! Canvas management against an in-memory store.

use std::sync::Arc;

use conduit_engine::{CanvasError, CanvasService, ChannelNotifier, NoopEncryptor, Transition};
use conduit_model::{
  Canvas, ConnectionSource, FilterOperator, NewConnection, NewStage, RunTemplate,
  SemaphoreRunTemplate, SourceType, StageConnectionFilter,
};
use conduit_store::{SqliteStore, Store};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Fixture {
  service: CanvasService<SqliteStore>,
  store: Arc<SqliteStore>,
  canvas: Canvas,
  transitions: mpsc::UnboundedReceiver<Transition>,
}

async fn fixture() -> Fixture {
  let store = Arc::new(SqliteStore::in_memory().await.expect("failed to open store"));
  let (tx, transitions) = mpsc::unbounded_channel();
  let service = CanvasService::new(store.clone(), Arc::new(NoopEncryptor))
    .with_notifier(Arc::new(ChannelNotifier::new(tx)));

  let canvas = service
    .create_canvas(Uuid::new_v4(), "production")
    .await
    .expect("create canvas");
  service
    .create_event_source(canvas.organization_id, canvas.id, "gh")
    .await
    .expect("create source");

  Fixture {
    service,
    store,
    canvas,
    transitions,
  }
}

fn new_stage(name: &str, connections: Vec<NewConnection>) -> NewStage {
  NewStage {
    name: name.to_string(),
    approval_required: false,
    run_template: RunTemplate::Semaphore(SemaphoreRunTemplate {
      project_id: "p1".to_string(),
      branch: "main".to_string(),
      pipeline_file: ".semaphore/semaphore.yml".to_string(),
      ..Default::default()
    }),
    connections,
  }
}

#[tokio::test]
async fn test_event_source_key_is_returned_once() {
  let f = fixture().await;

  let (source, key) = f
    .service
    .create_event_source(f.canvas.organization_id, f.canvas.id, "gitlab")
    .await
    .unwrap();

  let stored = f.store.get_event_source(source.id).await.unwrap();
  assert_eq!(f.service.event_source_key(&stored).await.unwrap(), key.as_bytes());

  let err = f
    .service
    .create_event_source(f.canvas.organization_id, f.canvas.id, "gitlab")
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    CanvasError::Store(conduit_store::Error::NameAlreadyUsed { .. })
  ));
}

#[tokio::test]
async fn test_create_stage_resolves_source_names() {
  let mut f = fixture().await;
  let build = f
    .service
    .create_stage(
      f.canvas.organization_id,
      f.canvas.id,
      new_stage(
        "build",
        vec![
          NewConnection::new(SourceType::EventSource, "gh").with_filters(
            FilterOperator::And,
            vec![StageConnectionFilter::expression("true", Vec::new())],
          ),
        ],
      ),
    )
    .await
    .unwrap();

  let deploy = f
    .service
    .create_stage(
      f.canvas.organization_id,
      f.canvas.id,
      new_stage("deploy", vec![NewConnection::new(SourceType::Stage, "build")]),
    )
    .await
    .unwrap();

  let description = f
    .service
    .describe_canvas(f.canvas.organization_id, f.canvas.id)
    .await
    .unwrap();
  assert_eq!(description.event_sources.len(), 1);
  assert_eq!(description.stages.len(), 2);
  assert_eq!(description.stages[1].stage.id, deploy.id);
  assert_eq!(
    description.stages[1].connections[0].source,
    ConnectionSource::Stage(build.id)
  );
  assert_eq!(description.stages[0].connections[0].filters.len(), 1);

  assert!(matches!(
    f.transitions.try_recv().unwrap(),
    Transition::StageCreated { stage_id, .. } if stage_id == build.id
  ));
}

#[tokio::test]
async fn test_unknown_source() {
  let f = fixture().await;

  let err = f
    .service
    .create_stage(
      f.canvas.organization_id,
      f.canvas.id,
      new_stage("deploy", vec![NewConnection::new(SourceType::Stage, "missing")]),
    )
    .await
    .unwrap_err();

  assert_eq!(err.to_string(), "stage 'missing' not found in canvas");
  assert!(f.store.list_stages(f.canvas.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_self_and_duplicate_connections() {
  let f = fixture().await;

  let err = f
    .service
    .create_stage(
      f.canvas.organization_id,
      f.canvas.id,
      new_stage("loop", vec![NewConnection::new(SourceType::Stage, "loop")]),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, CanvasError::SelfConnection(name) if name == "loop"));

  let err = f
    .service
    .create_stage(
      f.canvas.organization_id,
      f.canvas.id,
      new_stage(
        "deploy",
        vec![
          NewConnection::new(SourceType::EventSource, "gh"),
          NewConnection::new(SourceType::EventSource, "gh"),
        ],
      ),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, CanvasError::DuplicateSource { .. }));
}

#[tokio::test]
async fn test_duplicate_stage_name() {
  let f = fixture().await;
  let org = f.canvas.organization_id;

  let first = f
    .service
    .create_stage(
      org,
      f.canvas.id,
      new_stage("deploy", vec![NewConnection::new(SourceType::EventSource, "gh")]),
    )
    .await
    .unwrap();

  let err = f
    .service
    .create_stage(
      org,
      f.canvas.id,
      new_stage("deploy", vec![NewConnection::new(SourceType::EventSource, "gh")]),
    )
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    CanvasError::Store(conduit_store::Error::NameAlreadyUsed { kind: "stage", .. })
  ));
  assert_eq!(f.store.list_connections(first.id).await.unwrap().len(), 1);
  assert_eq!(f.store.list_canvas_connections(f.canvas.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_rejects_cycles() {
  let f = fixture().await;
  let org = f.canvas.organization_id;

  let build = f
    .service
    .create_stage(org, f.canvas.id, new_stage("build", Vec::new()))
    .await
    .unwrap();
  f.service
    .create_stage(
      org,
      f.canvas.id,
      new_stage("deploy", vec![NewConnection::new(SourceType::Stage, "build")]),
    )
    .await
    .unwrap();

  let err = f
    .service
    .update_stage_connections(
      org,
      f.canvas.id,
      build.id,
      vec![NewConnection::new(SourceType::Stage, "deploy")],
    )
    .await
    .unwrap_err();
  assert!(matches!(err, CanvasError::Cycle(_)), "{err}");
  assert!(f.store.list_connections(build.id).await.unwrap().is_empty());

  let connections = f
    .service
    .update_stage_connections(
      org,
      f.canvas.id,
      build.id,
      vec![NewConnection::new(SourceType::EventSource, "gh")],
    )
    .await
    .unwrap();
  assert_eq!(f.store.list_connections(build.id).await.unwrap(), connections);
}

#[tokio::test]
async fn test_canvas_scoped_by_organization() {
  let f = fixture().await;

  let err = f
    .service
    .describe_canvas(Uuid::new_v4(), f.canvas.id)
    .await
    .unwrap_err();
  assert!(matches!(err, CanvasError::Store(e) if e.is_not_found()));

  let err = f
    .service
    .create_canvas(f.canvas.organization_id, "production")
    .await
    .unwrap_err();
  assert_eq!(err.to_string(), "canvas name already used: production");
}
