//! Process bootstrap: loads the source configuration file, wires a
//! publisher, spawns one [`adapter::SourceSupervisor`] per enabled source,
//! and drains them on SIGINT/SIGTERM (spec.md §6 "Process lifecycle").

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;

use adapter::{GravityConfig, SourceSupervisor};
use sink::{NatsPublisher, Publisher, StdoutPublisher};

#[derive(Debug, Parser)]
#[command(name = "pg2bus", version, about = "Postgres logical-decoding CDC adapter")]
struct Args {
  /// Path to the source configuration JSON document (spec.md §6).
  #[arg(long, short = 'c')]
  config: String,

  /// Skip connecting to the message bus and log requests to stdout
  /// instead. Useful for dry-running a configuration change.
  #[arg(long)]
  dry_run: bool,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  let document = match adapter::config::load(&args.config) {
    Ok(document) => document,
    Err(err) => {
      tracing::error!(error = %err, "failed to load configuration, exiting");
      std::process::exit(1);
    }
  };

  let store: Arc<dyn adapter::progress::ProgressStore> = if document.store.enabled {
    match adapter::progress::SledProgressStore::open(&document.store.path) {
      Ok(store) => Arc::new(store),
      Err(err) => {
        tracing::error!(error = %err, path = %document.store.path, "failed to open progress store, exiting");
        std::process::exit(1);
      }
    }
  } else {
    Arc::new(adapter::progress::NullProgressStore)
  };
  if let Err(err) = store.register_columns(&["status"]) {
    tracing::error!(error = %err, "failed to initialize progress store, exiting");
    std::process::exit(1);
  }

  let publisher: Arc<dyn Publisher> = if args.dry_run {
    Arc::new(StdoutPublisher)
  } else {
    match async_nats::connect(document.gravity.url()).await {
      Ok(client) => Arc::new(NatsPublisher::new(client)),
      Err(err) => {
        tracing::error!(error = %err, url = %document.gravity.url(), "failed to connect to message bus, exiting");
        std::process::exit(1);
      }
    }
  };

  let mut supervisors = spawn_supervisors(document.sources, &document.gravity, store, publisher);

  wait_for_shutdown_signal().await;
  tracing::info!("shutdown signal received, draining sources");

  for (name, supervisor) in supervisors.iter_mut() {
    tracing::info!(source = %name, "shutting down");
    supervisor.shutdown().await;
  }
}

fn spawn_supervisors(
  sources: HashMap<String, adapter::SourceInfo>,
  gravity: &GravityConfig,
  store: Arc<dyn adapter::progress::ProgressStore>,
  publisher: Arc<dyn Publisher>,
) -> HashMap<String, SourceSupervisor> {
  let mut supervisors = HashMap::new();

  for (name, info) in sources {
    if info.disabled {
      tracing::info!(source = %name, "source disabled, skipping");
      continue;
    }

    let tables = Arc::new(info.tables.clone());

    match SourceSupervisor::new(name.clone(), info, store.clone(), publisher.clone()) {
      Ok((mut supervisor, reader)) => {
        supervisor.start(reader, tables, gravity);
        tracing::info!(source = %name, "source running");
        supervisors.insert(name, supervisor);
      }
      Err(err) => {
        tracing::error!(source = %name, error = %err, "failed to initialize source, exiting");
        std::process::exit(1);
      }
    }
  }

  supervisors
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
  use tokio::signal::unix::{signal, SignalKind};

  let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
  let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

  tokio::select! {
    _ = sigterm.recv() => {},
    _ = sigint.recv() => {},
  }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
  let _ = tokio::signal::ctrl_c().await;
}
