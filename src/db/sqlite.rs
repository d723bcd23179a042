use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Row};
use serde_json::Value;
use tokio_rusqlite::Connection;

use super::backend::{Backend, StorageError};
use super::sanitize::validate_limit;
use crate::id::DocumentId;
use crate::query::{CompiledPredicate, SqlDialect};
use crate::schema::ddl::{self, MigrationStatement};
use crate::types::{CollectionConfig, Document, FieldType};

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

pub struct SqliteBackend {
  conn: Connection,
}

impl SqliteBackend {
  pub async fn open(path: &str) -> Result<Self, StorageError> {
    let conn = Connection::open(path).await?;
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(Into::into))
      .await?;
    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory().await?;
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(Into::into))
      .await?;
    Ok(Self { conn })
  }
}

fn value_to_sql(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(*b as i64),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        SqlValue::Integer(i)
      } else {
        SqlValue::Real(n.as_f64().unwrap_or_default())
      }
    }
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(other.to_string()),
  }
}

/// Extract one materialized field's value from a row, typed per its
/// `FieldType`.
fn materialized_value(row: &Row<'_>, index: usize, field_type: FieldType) -> rusqlite::Result<Value> {
  match field_type {
    FieldType::String => {
      let v: Option<String> = row.get(index)?;
      Ok(v.map(Value::String).unwrap_or(Value::Null))
    }
    FieldType::Number => {
      let v: Option<f64> = row.get(index)?;
      Ok(v.and_then(|n| serde_json::Number::from_f64(n)).map(Value::Number).unwrap_or(Value::Null))
    }
    FieldType::Boolean => {
      let v: Option<i64> = row.get(index)?;
      Ok(v.map(|n| Value::Bool(n != 0)).unwrap_or(Value::Null))
    }
    FieldType::Date => {
      let v: Option<String> = row.get(index)?;
      Ok(v.map(Value::String).unwrap_or(Value::Null))
    }
    FieldType::Array | FieldType::Object => Ok(Value::Null),
  }
}

fn row_to_document(row: &Row<'_>, columns: &[(&str, FieldType)]) -> rusqlite::Result<Document> {
  let id_text: String = row.get(0)?;
  let created_at_text: String = row.get(1)?;
  let updated_at_text: String = row.get(2)?;
  let data_text: String = row.get(3)?;

  let id = DocumentId::parse(&id_text).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, "bad document id".into())
  })?;
  let created_at = DateTime::parse_from_rfc3339(&created_at_text)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, "bad timestamp".into()))?;
  let updated_at = DateTime::parse_from_rfc3339(&updated_at_text)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, "bad timestamp".into()))?;
  let data_json: Value = serde_json::from_str(&data_text).unwrap_or(Value::Null);

  let mut materialized = Vec::with_capacity(columns.len());
  for (i, (name, field_type)) in columns.iter().enumerate() {
    materialized.push((name.to_string(), materialized_value(row, 4 + i, *field_type)?));
  }

  let fields = super::merge_overflow(data_json, materialized);
  Ok(Document {
    id,
    created_at,
    updated_at,
    fields,
  })
}

fn select_sql(collection: &str, columns: &[(&str, FieldType)], where_clause: &str, order_by: &str, limit: Option<usize>, skip: Option<usize>) -> String {
  let mut column_list = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string()];
  column_list.extend(columns.iter().map(|(n, _)| format!("\"{n}\"")));
  let mut sql = format!(
    "SELECT {} FROM \"{collection}\" WHERE {where_clause}",
    column_list.join(", ")
  );
  if !order_by.is_empty() {
    sql.push(' ');
    sql.push_str(order_by);
  }
  if let Some(limit) = limit {
    sql.push_str(&format!(" LIMIT {limit}"));
  }
  if let Some(skip) = skip {
    if limit.is_none() {
      sql.push_str(" LIMIT -1");
    }
    sql.push_str(&format!(" OFFSET {skip}"));
  }
  sql
}

#[async_trait]
impl Backend for SqliteBackend {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Sqlite
  }

  async fn ensure_table(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    let sql = ddl::create_table_sql(collection, config, SqlDialect::Sqlite)?;
    self.conn.call(move |conn| conn.execute_batch(&sql).map_err(Into::into)).await?;
    Ok(())
  }

  async fn existing_columns(&self, collection: &str) -> Result<Vec<String>, StorageError> {
    let collection = collection.to_string();
    let columns = self
      .conn
      .call(move |conn| -> Result<Vec<String>, tokio_rusqlite::Error> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{collection}\")"))?;
        let rows = stmt
          .query_map([], |row| row.get::<_, String>(1))?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await?;
    Ok(columns)
  }

  async fn migrate(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    let existing = self.existing_columns(collection).await?;
    let statements = ddl::migration_statements(collection, config, &existing, SqlDialect::Sqlite, false)?;
    for statement in statements {
      match statement {
        MigrationStatement::AddColumn(sql) => {
          self.conn.call(move |conn| conn.execute_batch(&sql).map_err(Into::into)).await?;
        }
        MigrationStatement::DropColumn(_) => {
          tracing::warn!(collection, "sqlite backend does not drop columns in place");
        }
        MigrationStatement::Skipped { column, reason } => {
          tracing::warn!(collection, column, reason, "column left in place");
        }
      }
    }
    Ok(())
  }

  async fn create_indexes(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    let statements = ddl::index_statements(collection, config, SqlDialect::Sqlite)?;
    for sql in statements {
      self.conn.call(move |conn| conn.execute_batch(&sql).map_err(Into::into)).await?;
    }
    Ok(())
  }

  async fn insert_row(&self, collection: &str, config: &CollectionConfig, doc: &Document) -> Result<(), StorageError> {
    let columns = ddl::materialized_columns(config);
    let column_names: Vec<String> = columns.iter().map(|(n, _)| format!("\"{n}\"")).collect();
    let mut all_columns = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string()];
    all_columns.extend(column_names);
    let placeholders: Vec<&str> = all_columns.iter().map(|_| "?").collect();

    let mut overflow = doc.fields.clone();
    let mut values = vec![
      SqlValue::Text(doc.id.as_hex()),
      SqlValue::Text(doc.created_at.to_rfc3339()),
      SqlValue::Text(doc.updated_at.to_rfc3339()),
    ];
    let mut materialized_values = Vec::with_capacity(columns.len());
    for (name, _) in &columns {
      let v = overflow.remove(*name).unwrap_or(Value::Null);
      materialized_values.push(value_to_sql(&v));
    }
    values.push(SqlValue::Text(Value::Object(overflow).to_string()));
    values.extend(materialized_values);

    let collection = collection.to_string();
    let sql = format!(
      "INSERT INTO \"{collection}\" ({}) VALUES ({})",
      all_columns.join(", "),
      placeholders.join(", ")
    );
    self
      .conn
      .call(move |conn| conn.execute(&sql, params_from_iter(values)).map_err(Into::into))
      .await?;
    Ok(())
  }

  async fn replace_row(&self, collection: &str, config: &CollectionConfig, doc: &Document) -> Result<(), StorageError> {
    let columns = ddl::materialized_columns(config);
    let mut overflow = doc.fields.clone();
    let mut assignments = vec!["updated_at = ?".to_string(), "data = ?".to_string()];
    let mut values = vec![SqlValue::Text(doc.updated_at.to_rfc3339())];
    let mut data_and_columns = Vec::new();
    for (name, _) in &columns {
      let v = overflow.remove(*name).unwrap_or(Value::Null);
      data_and_columns.push(value_to_sql(&v));
      assignments.push(format!("\"{name}\" = ?"));
    }
    values.push(SqlValue::Text(Value::Object(overflow).to_string()));
    values.extend(data_and_columns);
    values.push(SqlValue::Text(doc.id.as_hex()));

    let collection = collection.to_string();
    let sql = format!(
      "UPDATE \"{collection}\" SET {} WHERE id = ?",
      assignments.join(", ")
    );
    self
      .conn
      .call(move |conn| conn.execute(&sql, params_from_iter(values)).map_err(Into::into))
      .await?;
    Ok(())
  }

  async fn fetch_rows(
    &self,
    collection: &str,
    config: &CollectionConfig,
    predicate: &CompiledPredicate,
    order_by_sql: &str,
    limit: Option<usize>,
    skip: Option<usize>,
  ) -> Result<Vec<Document>, StorageError> {
    if let Some(limit) = limit {
      validate_limit(limit as i64)?;
    }
    let columns = ddl::materialized_columns(config);
    let owned_columns: Vec<(String, FieldType)> = columns.iter().map(|(n, t)| (n.to_string(), *t)).collect();
    let sql = select_sql(collection, &columns, &predicate.sql, order_by_sql, limit, skip);
    let params: Vec<SqlValue> = predicate.params.iter().map(value_to_sql).collect();

    let docs = self
      .conn
      .call(move |conn| -> Result<Vec<Document>, tokio_rusqlite::Error> {
        let borrowed: Vec<(&str, FieldType)> = owned_columns.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params_from_iter(params), |row| row_to_document(row, &borrowed))?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await?;
    Ok(docs)
  }

  async fn delete_rows(
    &self,
    collection: &str,
    _config: &CollectionConfig,
    predicate: &CompiledPredicate,
  ) -> Result<u64, StorageError> {
    let collection = collection.to_string();
    let sql = format!("DELETE FROM \"{collection}\" WHERE {}", predicate.sql);
    let params: Vec<SqlValue> = predicate.params.iter().map(value_to_sql).collect();
    let affected = self
      .conn
      .call(move |conn| conn.execute(&sql, params_from_iter(params)).map_err(Into::into))
      .await?;
    Ok(affected as u64)
  }

  async fn count_rows(
    &self,
    collection: &str,
    _config: &CollectionConfig,
    predicate: &CompiledPredicate,
  ) -> Result<u64, StorageError> {
    let collection = collection.to_string();
    let sql = format!("SELECT COUNT(*) FROM \"{collection}\" WHERE {}", predicate.sql);
    let params: Vec<SqlValue> = predicate.params.iter().map(value_to_sql).collect();
    let count: i64 = self
      .conn
      .call(move |conn| conn.query_row(&sql, params_from_iter(params), |row| row.get(0)).map_err(Into::into))
      .await?;
    Ok(count as u64)
  }
}
