//! Wires the storage backend, schema cache, event runtime, and pipeline
//! into one HTTP server, with graceful shutdown (spec.md §6).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{BackendType, ServerConfig};
use crate::collection::Pipeline;
use crate::db::backend::Backend;
use crate::db::postgres::PostgresBackend;
use crate::db::sqlite::SqliteBackend;
use crate::events::EventRuntime;
use crate::http::{self, AppState};
use crate::id::SystemClock;
use crate::schema::SchemaManager;
use crate::store::Store;

pub struct Daemon {
  config: ServerConfig,
  pipeline: Arc<Pipeline>,
}

impl Daemon {
  pub async fn new(config: ServerConfig) -> Result<Self, anyhow::Error> {
    let backend: Arc<dyn Backend> = match config.backend {
      BackendType::Sqlite => {
        tracing::info!("opening sqlite database at {}", config.sqlite.path);
        Arc::new(SqliteBackend::open(&config.sqlite.path).await?)
      }
      BackendType::Postgres => {
        tracing::info!("connecting to postgres at {}", config.postgres.url);
        Arc::new(PostgresBackend::connect(&config.postgres.url)?)
      }
    };

    let schema = Arc::new(SchemaManager::new(config.collections.root.clone()));
    let store = Arc::new(Store::new(backend, Arc::new(SystemClock)));
    let events = Arc::new(EventRuntime::new(Duration::from_millis(
      config.scripts.timeout_ms,
    )));

    for name in schema.list_collections()? {
      let collection_config = schema.load(&name)?;
      tracing::info!(collection = %name, "ensuring table schema");
      store.ensure_schema(&name, &collection_config).await?;
    }

    let pipeline = Arc::new(Pipeline::new(schema, store, events));

    Ok(Self { config, pipeline })
  }

  pub async fn run(self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<(), anyhow::Error> {
    let cors = if self.config.server.cors_origins.iter().any(|o| o == "*") {
      CorsLayer::permissive()
    } else {
      let origins = self
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|o| o.parse::<axum::http::HeaderValue>().ok())
        .collect::<Vec<_>>();
      CorsLayer::new().allow_origin(origins)
    };

    let app = http::router(AppState::new(self.pipeline.clone()))
      .layer(TraceLayer::new_for_http())
      .layer(cors);

    let addr = self.config.address();
    tracing::info!("listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
      .with_graceful_shutdown(async move {
        let _ = (&mut shutdown).await;
        tracing::info!("shutdown signal received, draining connections");
      })
      .await?;

    Ok(())
  }
}
