//! Operator CLI: validate collection configs on disk and run one-shot
//! schema migrations without starting the HTTP server (spec.md §6
//! component L).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use collectiond::db::backend::Backend;
use collectiond::db::postgres::PostgresBackend;
use collectiond::db::sqlite::SqliteBackend;
use collectiond::id::SystemClock;
use collectiond::schema::SchemaManager;
use collectiond::server::{BackendType, ServerConfig};
use collectiond::store::Store;

#[derive(Parser)]
#[command(name = "collectionctl", about = "Operator CLI for a collection backend", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "COLLECTIOND_COLLECTIONS_ROOT")]
  collections_root: Option<String>,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Parse every collection's config.json and report errors.
  Validate,
  /// Create/alter tables and indexes to match the collection configs on disk.
  Migrate,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();
  tracing_subscriber::fmt::init();

  let mut config = if let Some(path) = &args.config {
    ServerConfig::from_file(path)?
  } else {
    ServerConfig::find_and_load()?.unwrap_or_default()
  };
  if let Some(root) = args.collections_root {
    config.collections.root = root;
  }

  let schema = SchemaManager::new(config.collections.root.clone());

  match args.command {
    Command::Validate => validate(&schema),
    Command::Migrate => migrate(&schema, &config).await,
  }
}

fn validate(schema: &SchemaManager) -> Result<(), anyhow::Error> {
  let names = schema.list_collections()?;
  let mut failures = 0;
  for name in &names {
    match schema.load(name) {
      Ok(_) => println!("ok    {name}"),
      Err(err) => {
        failures += 1;
        println!("error {name}: {err}");
      }
    }
  }
  println!("{} collection(s) checked, {} error(s)", names.len(), failures);
  if failures > 0 {
    anyhow::bail!("{failures} collection(s) failed validation");
  }
  Ok(())
}

async fn migrate(schema: &SchemaManager, config: &ServerConfig) -> Result<(), anyhow::Error> {
  let backend: Arc<dyn Backend> = match config.backend {
    BackendType::Sqlite => Arc::new(SqliteBackend::open(&config.sqlite.path).await?),
    BackendType::Postgres => Arc::new(PostgresBackend::connect(&config.postgres.url)?),
  };
  let store = Store::new(backend, Arc::new(SystemClock));

  for name in schema.list_collections()? {
    let collection_config = schema.load(&name)?;
    println!("migrating {name}");
    store.ensure_schema(&name, &collection_config).await?;
  }

  println!("migration complete");
  Ok(())
}
