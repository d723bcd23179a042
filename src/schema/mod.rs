//! Resolves a collection's `config.json` into a schema and the DDL needed
//! to keep the backing table aligned with it (spec.md §4.4).

pub(crate) mod ddl;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::query::SqlDialect;
use crate::types::CollectionConfig;

pub use ddl::{ColumnDef, MigrationStatement};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
  #[error("collection config not found: {0}")]
  NotFound(String),
  #[error("failed to read collection config {0}: {1}")]
  Io(String, #[source] std::io::Error),
  #[error("failed to parse collection config {0}: {1}")]
  Parse(String, #[source] serde_json::Error),
}

struct CachedEntry {
  config: CollectionConfig,
  source_modified: SystemTime,
}

/// Caches `config.json` reads per collection name and invalidates an
/// entry the moment the file's mtime advances past what was cached.
pub struct SchemaManager {
  root: PathBuf,
  cache: RwLock<HashMap<String, CachedEntry>>,
}

impl SchemaManager {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      cache: RwLock::new(HashMap::new()),
    }
  }

  fn config_path(&self, collection: &str) -> PathBuf {
    self.root.join(collection).join("config.json")
  }

  /// Load the resolved config for `collection`, reusing the cached copy
  /// unless the file's modification time has advanced.
  pub fn load(&self, collection: &str) -> Result<CollectionConfig, SchemaError> {
    let path = self.config_path(collection);
    let metadata = fs::metadata(&path).map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        SchemaError::NotFound(collection.to_string())
      } else {
        SchemaError::Io(collection.to_string(), e)
      }
    })?;
    let modified = metadata.modified().map_err(|e| SchemaError::Io(collection.to_string(), e))?;

    if let Some(cached) = self.cache.read().get(collection) {
      if cached.source_modified >= modified {
        return Ok(cached.config.clone());
      }
    }

    let raw = fs::read_to_string(&path).map_err(|e| SchemaError::Io(collection.to_string(), e))?;
    let config: CollectionConfig =
      serde_json::from_str(&raw).map_err(|e| SchemaError::Parse(collection.to_string(), e))?;

    self.cache.write().insert(
      collection.to_string(),
      CachedEntry {
        config: config.clone(),
        source_modified: modified,
      },
    );
    Ok(config)
  }

  /// Forget the cached entry, forcing the next `load` to hit disk
  /// regardless of mtime. Used by tests and by administrative reloads.
  pub fn invalidate(&self, collection: &str) {
    self.cache.write().remove(collection);
  }

  /// List every collection directory under the config root that carries
  /// a `config.json`.
  pub fn list_collections(&self) -> Result<Vec<String>, SchemaError> {
    let mut names = Vec::new();
    let entries = fs::read_dir(&self.root).map_err(|e| SchemaError::Io(self.root.display().to_string(), e))?;
    for entry in entries {
      let entry = entry.map_err(|e| SchemaError::Io(self.root.display().to_string(), e))?;
      if entry.path().join("config.json").is_file() {
        if let Some(name) = entry.file_name().to_str() {
          names.push(name.to_string());
        }
      }
    }
    names.sort();
    Ok(names)
  }

  pub fn create_table_sql(&self, collection: &str, config: &CollectionConfig, dialect: SqlDialect) -> Result<String, crate::db::sanitize::SqlSanitizeError> {
    ddl::create_table_sql(collection, config, dialect)
  }

  pub fn migration_statements(
    &self,
    collection: &str,
    config: &CollectionConfig,
    existing_columns: &[String],
    dialect: SqlDialect,
    supports_alter: bool,
  ) -> Result<Vec<MigrationStatement>, crate::db::sanitize::SqlSanitizeError> {
    ddl::migration_statements(collection, config, existing_columns, dialect, supports_alter)
  }

  pub fn index_statements(&self, collection: &str, config: &CollectionConfig, dialect: SqlDialect) -> Result<Vec<String>, crate::db::sanitize::SqlSanitizeError> {
    ddl::index_statements(collection, config, dialect)
  }
}
