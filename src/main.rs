mod cache;
mod classify;
mod config;
mod control;
mod lifecycle;
mod origin;
mod pins;
mod proxy;
mod server;
#[cfg(test)]
mod testing;
mod walker;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::cache::{PartitionStore, SqliteStorage};
use crate::classify::Classifier;
use crate::config::{Config, LogConfig};
use crate::control::Controller;
use crate::lifecycle::Lifecycle;
use crate::origin::{HttpOrigin, Origin};
use crate::pins::PinRegistry;
use crate::proxy::CachingProxy;
use crate::server::AppState;
use crate::walker::PrefetchWalker;

#[derive(Parser, Debug)]
#[command(name = "stepcache")]
#[command(about = "Offline caching proxy for step-by-step instruction content")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./stepcache.yaml or $XDG_CONFIG_HOME/stepcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the content origin
  #[arg(long)]
  origin: Option<Url>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Cache version tag
  #[arg(long)]
  version_tag: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, then apply command line overrides
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(version) = args.version_tag {
    config.version = version;
  }
  config.validate()?;

  let _log_guard = init_tracing(&config.log)?;

  let store: Arc<dyn PartitionStore> =
    Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
  let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new()?);

  let lifecycle = Arc::new(Lifecycle::new(&config, Arc::clone(&origin), store)?);
  let partitions = lifecycle.partitions();
  let pins = Arc::new(PinRegistry::new());
  let classifier = Classifier::new(&config, Arc::clone(&pins))?;
  let proxy = CachingProxy::new(&config, Arc::clone(&origin), partitions.clone(), classifier)?;
  let walker = Arc::new(PrefetchWalker::new(&config, origin, partitions.clone()));
  let control = Controller::new(
    Arc::clone(&pins),
    walker,
    Arc::clone(&lifecycle),
    &config.layout.project_root,
  )
  .spawn();

  tokio::spawn({
    let lifecycle = Arc::clone(&lifecycle);
    async move {
      if let Err(e) = lifecycle.run().await {
        error!(version = %lifecycle.version(), error = %e, "install failed");
      }
    }
  });

  let app = server::router(AppState {
    proxy,
    partitions,
    control,
    lifecycle,
    pins,
  });

  let listener = tokio::net::TcpListener::bind(config.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.listen, e))?;
  info!(
    listen = %config.listen,
    origin = %config.origin,
    version = %config.version,
    "stepcache listening"
  );

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  info!("stepcache stopped");
  Ok(())
}

/// Log to stderr, and to a daily rolling file when a log directory is set.
///
/// The returned guard flushes the file writer and must be held until exit.
fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepcache=info"));

  let (file_layer, guard) = match &config.directory {
    Some(directory) => {
      let appender = tracing_appender::rolling::daily(directory, "stepcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_ansi(false).with_writer(writer);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

  Ok(guard)
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!("shutting down");
}
