use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use conduit_engine::{CanvasService, Dispatcher, DispatcherConfig, DryRunLauncher, NoopEncryptor};
use conduit_expr::MiniJinjaEvaluator;
use conduit_model::{ExecutionResult, NewStage};
use conduit_store::SqliteStore;

/// Conduit - event-driven delivery canvases
#[derive(Parser)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.conduit)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Database URL (default: sqlite://<data-dir>/conduit.db)
  #[arg(long, global = true, env = "CONDUIT_DATABASE_URL")]
  database_url: Option<String>,

  /// Delay between dispatcher ticks
  #[arg(long, global = true, default_value_t = 1000)]
  poll_interval_ms: u64,

  /// Budget for a single filter or placeholder expression
  #[arg(long, global = true, default_value_t = 5000)]
  expression_timeout_ms: u64,

  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Apply database migrations
  Migrate,

  /// Manage canvases
  Canvas {
    #[command(subcommand)]
    action: CanvasAction,
  },

  /// Manage event sources
  Source {
    #[command(subcommand)]
    action: SourceAction,
  },

  /// Manage stages
  Stage {
    #[command(subcommand)]
    action: StageAction,
  },

  /// Store a JSON payload from stdin as a pending event
  Ingest {
    /// Event source id
    #[arg(long)]
    source: Uuid,
  },

  /// Approve a stage event waiting for approval
  Approve {
    #[arg(long)]
    stage: Uuid,

    /// Stage event id
    #[arg(long)]
    event: Uuid,

    /// Id of the approving user
    #[arg(long)]
    by: Uuid,
  },

  /// Mark a started execution as finished
  Finish {
    #[arg(long)]
    execution: Uuid,

    /// passed or failed
    #[arg(long)]
    result: ExecutionResult,
  },

  /// Run the dispatcher until interrupted
  Run,
}

#[derive(Subcommand)]
enum CanvasAction {
  /// Create a canvas
  Create {
    #[arg(long)]
    org: Uuid,

    #[arg(long)]
    name: String,
  },

  /// Print a canvas with its sources, stages and connections
  Describe {
    #[arg(long)]
    org: Uuid,

    #[arg(long)]
    canvas: Uuid,
  },
}

#[derive(Subcommand)]
enum SourceAction {
  /// Create an event source and print its key
  Create {
    #[arg(long)]
    org: Uuid,

    #[arg(long)]
    canvas: Uuid,

    #[arg(long)]
    name: String,
  },
}

#[derive(Subcommand)]
enum StageAction {
  /// Create a stage from a JSON definition
  Create {
    #[arg(long)]
    org: Uuid,

    #[arg(long)]
    canvas: Uuid,

    /// Path to the stage definition (JSON)
    stage_file: PathBuf,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let data_dir = match cli.data_dir.clone() {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".conduit"),
  };

  let Some(command) = cli.command.as_ref() else {
    println!("conduit - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_command(&cli, command, &data_dir).await })
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
    .init();
}

async fn run_command(cli: &Cli, command: &Commands, data_dir: &Path) -> Result<()> {
  let store = Arc::new(open_store(cli, data_dir).await?);

  match command {
    Commands::Migrate => {
      eprintln!("Migrations applied");
    }
    Commands::Canvas { action } => {
      let canvases = CanvasService::new(store, Arc::new(NoopEncryptor));
      match action {
        CanvasAction::Create { org, name } => {
          let canvas = canvases.create_canvas(*org, name).await?;
          print_json(&canvas)?;
        }
        CanvasAction::Describe { org, canvas } => {
          let description = canvases.describe_canvas(*org, *canvas).await?;
          print_json(&description)?;
        }
      }
    }
    Commands::Source {
      action: SourceAction::Create { org, canvas, name },
    } => {
      let canvases = CanvasService::new(store, Arc::new(NoopEncryptor));
      let (source, key) = canvases.create_event_source(*org, *canvas, name).await?;
      eprintln!("Store this key now, it will not be shown again");
      print_json(&serde_json::json!({ "id": source.id, "name": source.name, "key": key }))?;
    }
    Commands::Stage {
      action: StageAction::Create {
        org,
        canvas,
        stage_file,
      },
    } => {
      let content = tokio::fs::read_to_string(stage_file)
        .await
        .with_context(|| format!("failed to read stage file: {}", stage_file.display()))?;
      let new_stage: NewStage = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse stage file: {}", stage_file.display()))?;

      let canvases = CanvasService::new(store, Arc::new(NoopEncryptor));
      let stage = canvases.create_stage(*org, *canvas, new_stage).await?;
      print_json(&stage)?;
    }
    Commands::Ingest { source } => {
      let payload = read_payload_from_stdin()?;
      let event = dispatcher(cli, store).ingest(*source, payload).await?;
      println!("{}", event.id);
    }
    Commands::Approve { stage, event, by } => {
      let stage_event = dispatcher(cli, store).approve(*stage, *event, *by).await?;
      print_json(&stage_event)?;
    }
    Commands::Finish { execution, result } => {
      let execution = dispatcher(cli, store)
        .finish_execution(*execution, *result)
        .await?;
      print_json(&execution)?;
    }
    Commands::Run => {
      let dispatcher = dispatcher(cli, store);
      let cancel = CancellationToken::new();

      let signal = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          info!("shutdown_requested");
        }
        signal.cancel();
      });

      dispatcher.start(cancel).await;
    }
  }

  Ok(())
}

async fn open_store(cli: &Cli, data_dir: &Path) -> Result<SqliteStore> {
  let url = match &cli.database_url {
    Some(url) => url.clone(),
    None => {
      tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
      format!("sqlite://{}", data_dir.join("conduit.db").display())
    }
  };

  let store = SqliteStore::connect(&url)
    .await
    .with_context(|| format!("failed to open database: {url}"))?;
  store.migrate().await.context("failed to apply migrations")?;
  Ok(store)
}

fn dispatcher(cli: &Cli, store: Arc<SqliteStore>) -> Dispatcher<SqliteStore, MiniJinjaEvaluator> {
  let config = DispatcherConfig {
    poll_interval: Duration::from_millis(cli.poll_interval_ms),
    expression_timeout: Duration::from_millis(cli.expression_timeout_ms),
    ..Default::default()
  };
  Dispatcher::new(
    store,
    Arc::new(MiniJinjaEvaluator::new()),
    Arc::new(DryRunLauncher),
    config,
  )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}
