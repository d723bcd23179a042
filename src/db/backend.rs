//! The row-level storage contract both backends implement. The `Store`
//! (src/store) builds on this with read-modify-write update semantics;
//! this trait only knows how to get rows in and out of one dialect.

use async_trait::async_trait;

use crate::query::{CompiledPredicate, SqlDialect};
use crate::types::{CollectionConfig, Document};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("sqlite connection error: {0}")]
  SqliteConn(#[from] tokio_rusqlite::Error),
  #[error("postgres error: {0}")]
  Postgres(#[from] tokio_postgres::Error),
  #[error("postgres pool error: {0}")]
  Pool(#[from] deadpool_postgres::PoolError),
  #[error("schema error: {0}")]
  Schema(#[from] crate::schema::SchemaError),
  #[error("invalid identifier: {0}")]
  Sanitize(#[from] crate::db::sanitize::SqlSanitizeError),
  #[error("malformed row data: {0}")]
  Decode(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
  fn dialect(&self) -> SqlDialect;

  /// Create the table for `collection` if it does not exist yet.
  async fn ensure_table(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError>;

  /// The table's current non-system column names, used by the schema
  /// manager to diff against the declared schema.
  async fn existing_columns(&self, collection: &str) -> Result<Vec<String>, StorageError>;

  /// Apply `ADD COLUMN`/`DROP COLUMN` statements to bring the table in
  /// line with `config`. Unsupported drops are logged, not applied.
  async fn migrate(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError>;

  async fn create_indexes(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError>;

  async fn insert_row(&self, collection: &str, config: &CollectionConfig, doc: &Document) -> Result<(), StorageError>;

  /// Overwrite the row for `doc.id` with `doc`'s current field values.
  async fn replace_row(&self, collection: &str, config: &CollectionConfig, doc: &Document) -> Result<(), StorageError>;

  async fn fetch_rows(
    &self,
    collection: &str,
    config: &CollectionConfig,
    predicate: &CompiledPredicate,
    order_by_sql: &str,
    limit: Option<usize>,
    skip: Option<usize>,
  ) -> Result<Vec<Document>, StorageError>;

  async fn delete_rows(
    &self,
    collection: &str,
    config: &CollectionConfig,
    predicate: &CompiledPredicate,
  ) -> Result<u64, StorageError>;

  async fn count_rows(
    &self,
    collection: &str,
    config: &CollectionConfig,
    predicate: &CompiledPredicate,
  ) -> Result<u64, StorageError>;
}
