mod config;
mod daemon;

pub use config::{
  BackendType, CollectionsSection, PostgresSection, ScriptsSection, ServerConfig, SqliteSection,
};
pub use daemon::Daemon;
