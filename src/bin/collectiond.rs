use clap::Parser;
use collectiond::server::{BackendType, Daemon, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "collectiond", about = "Collection backend-as-a-service daemon", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "COLLECTIOND_PG_URL")]
  pg_url: Option<String>,
  #[arg(long, env = "COLLECTIOND_SQLITE_PATH")]
  sqlite: Option<String>,
  #[arg(long, env = "COLLECTIOND_COLLECTIONS_ROOT")]
  collections_root: Option<String>,
  #[arg(short, long)]
  port: Option<u16>,
  #[arg(long)]
  host: Option<String>,
  #[arg(long)]
  backend: Option<BackendType>,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    ServerConfig::from_file(path)?
  } else {
    ServerConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(url) = args.pg_url {
    config.postgres.url = url;
    config.backend = BackendType::Postgres;
  }
  if let Some(path) = args.sqlite {
    config.sqlite.path = path;
    config.backend = BackendType::Sqlite;
  }
  if let Some(backend) = args.backend {
    config.backend = backend;
  }
  if let Some(root) = args.collections_root {
    config.collections.root = root;
  }
  if let Some(port) = args.port {
    config.server.port = port;
  }
  if let Some(host) = args.host {
    config.server.host = host;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let daemon = Daemon::new(config).await?;

  let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
  tokio::spawn(async move {
    shutdown_signal().await;
    let _ = shutdown_tx.send(());
  });

  daemon.run(shutdown_rx).await
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("received SIGINT"),
    _ = terminate => tracing::info!("received SIGTERM"),
  }
}
