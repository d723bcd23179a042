use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde_json::Value;
use tokio_postgres::types::{FromSql, ToSql};
use tokio_postgres::{NoTls, Row};

use super::backend::{Backend, StorageError};
use super::sanitize::validate_limit;
use crate::id::DocumentId;
use crate::query::{CompiledPredicate, SqlDialect};
use crate::schema::ddl::{self, MigrationStatement};
use crate::types::{CollectionConfig, Document, FieldType};

pub struct PostgresBackend {
  pool: Pool,
}

impl PostgresBackend {
  pub fn connect(url: &str) -> Result<Self, anyhow::Error> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    Ok(Self { pool })
  }
}

fn materialized_value(row: &Row, index: usize, field_type: FieldType) -> Result<Value, StorageError> {
  fn get<'a, T: FromSql<'a>>(row: &'a Row, index: usize) -> Result<Option<T>, StorageError> {
    row.try_get(index).map_err(StorageError::from)
  }
  Ok(match field_type {
    FieldType::String => get::<String>(row, index)?.map(Value::String).unwrap_or(Value::Null),
    FieldType::Number => get::<f64>(row, index)?
      .and_then(serde_json::Number::from_f64)
      .map(Value::Number)
      .unwrap_or(Value::Null),
    FieldType::Boolean => get::<bool>(row, index)?.map(Value::Bool).unwrap_or(Value::Null),
    FieldType::Date => get::<DateTime<Utc>>(row, index)?
      .map(|dt| Value::String(dt.to_rfc3339()))
      .unwrap_or(Value::Null),
    FieldType::Array | FieldType::Object => Value::Null,
  })
}

fn row_to_document(row: &Row, columns: &[(&str, FieldType)]) -> Result<Document, StorageError> {
  let id_text: String = row.try_get(0)?;
  let created_at: DateTime<Utc> = row.try_get(1)?;
  let updated_at: DateTime<Utc> = row.try_get(2)?;
  let data_json: Value = row.try_get(3)?;

  let id = DocumentId::parse(&id_text).ok_or_else(|| StorageError::Decode(format!("bad document id: {id_text}")))?;

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

fn value_to_sql_param(value: Value) -> Box<dyn ToSql + Sync + Send> {
  match value {
    Value::Null => Box::new(Option::<String>::None),
    Value::Bool(b) => Box::new(b),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        Box::new(i as f64)
      } else {
        Box::new(n.as_f64().unwrap_or_default())
      }
    }
    Value::String(s) => Box::new(s),
    other => Box::new(other),
  }
}

#[async_trait]
impl Backend for PostgresBackend {
  fn dialect(&self) -> SqlDialect {
    SqlDialect::Postgres
  }

  async fn ensure_table(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    let sql = ddl::create_table_sql(collection, config, SqlDialect::Postgres)?;
    self.pool.get().await?.batch_execute(&sql).await?;
    Ok(())
  }

  async fn existing_columns(&self, collection: &str) -> Result<Vec<String>, StorageError> {
    let rows = self
      .pool
      .get()
      .await?
      .query(
        "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
        &[&collection],
      )
      .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
  }

  async fn migrate(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    let existing = self.existing_columns(collection).await?;
    let statements = ddl::migration_statements(collection, config, &existing, SqlDialect::Postgres, true)?;
    let conn = self.pool.get().await?;
    for statement in statements {
      match statement {
        MigrationStatement::AddColumn(sql) => {
          conn.batch_execute(&sql).await?;
        }
        MigrationStatement::DropColumn(sql) => {
          conn.batch_execute(&sql).await?;
        }
        MigrationStatement::Skipped { column, reason } => {
          tracing::warn!(collection, column, reason, "column left in place");
        }
      }
    }
    Ok(())
  }

  async fn create_indexes(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    let statements = ddl::index_statements(collection, config, SqlDialect::Postgres)?;
    let conn = self.pool.get().await?;
    for sql in statements {
      conn.batch_execute(&sql).await?;
    }
    Ok(())
  }

  async fn insert_row(&self, collection: &str, config: &CollectionConfig, doc: &Document) -> Result<(), StorageError> {
    let columns = ddl::materialized_columns(config);
    let mut overflow = doc.fields.clone();
    let mut column_names = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string()];
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![
      Box::new(doc.id.as_hex()),
      Box::new(doc.created_at),
      Box::new(doc.updated_at),
    ];
    for (name, field_type) in &columns {
      column_names.push(format!("\"{name}\""));
      let v = overflow.remove(*name).unwrap_or(Value::Null);
      params.push(cast_for(v, *field_type));
    }
    params.insert(3, Box::new(Value::Object(overflow)));

    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
      "INSERT INTO \"{collection}\" ({}) VALUES ({})",
      column_names.join(", "),
      placeholders.join(", ")
    );
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| -> &(dyn ToSql + Sync) { p.as_ref() }).collect();
    self.pool.get().await?.execute(&sql, &refs).await?;
    Ok(())
  }

  async fn replace_row(&self, collection: &str, config: &CollectionConfig, doc: &Document) -> Result<(), StorageError> {
    let columns = ddl::materialized_columns(config);
    let mut overflow = doc.fields.clone();
    let mut assignments = vec!["updated_at = $1".to_string(), "data = $2".to_string()];
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(doc.updated_at), Box::new(Value::Null)];
    let mut next = 3;
    for (name, field_type) in &columns {
      let v = overflow.remove(*name).unwrap_or(Value::Null);
      assignments.push(format!("\"{name}\" = ${next}"));
      params.push(cast_for(v, *field_type));
      next += 1;
    }
    params[1] = Box::new(Value::Object(overflow));
    params.push(Box::new(doc.id.as_hex()));
    let id_param = next;

    let sql = format!(
      "UPDATE \"{collection}\" SET {} WHERE id = ${id_param}",
      assignments.join(", ")
    );
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| -> &(dyn ToSql + Sync) { p.as_ref() }).collect();
    self.pool.get().await?.execute(&sql, &refs).await?;
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
    let mut column_list = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string()];
    column_list.extend(columns.iter().map(|(n, _)| format!("\"{n}\"")));

    let mut sql = format!("SELECT {} FROM \"{collection}\" WHERE {}", column_list.join(", "), predicate.sql);
    if !order_by_sql.is_empty() {
      sql.push(' ');
      sql.push_str(order_by_sql);
    }
    if let Some(limit) = limit {
      sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(skip) = skip {
      sql.push_str(&format!(" OFFSET {skip}"));
    }

    let params: Vec<Box<dyn ToSql + Sync + Send>> = predicate.params.iter().cloned().map(|v| value_to_sql_param(v)).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| -> &(dyn ToSql + Sync) { p.as_ref() }).collect();

    let rows = self.pool.get().await?.query(&sql, &refs).await?;
    rows.iter().map(|r| row_to_document(r, &columns)).collect()
  }

  async fn delete_rows(
    &self,
    collection: &str,
    _config: &CollectionConfig,
    predicate: &CompiledPredicate,
  ) -> Result<u64, StorageError> {
    let sql = format!("DELETE FROM \"{collection}\" WHERE {}", predicate.sql);
    let params: Vec<Box<dyn ToSql + Sync + Send>> = predicate.params.iter().cloned().map(value_to_sql_param).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| -> &(dyn ToSql + Sync) { p.as_ref() }).collect();
    let affected = self.pool.get().await?.execute(&sql, &refs).await?;
    Ok(affected)
  }

  async fn count_rows(
    &self,
    collection: &str,
    _config: &CollectionConfig,
    predicate: &CompiledPredicate,
  ) -> Result<u64, StorageError> {
    let sql = format!("SELECT COUNT(*) FROM \"{collection}\" WHERE {}", predicate.sql);
    let params: Vec<Box<dyn ToSql + Sync + Send>> = predicate.params.iter().cloned().map(value_to_sql_param).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| -> &(dyn ToSql + Sync) { p.as_ref() }).collect();
    let row = self.pool.get().await?.query_one(&sql, &refs).await?;
    let count: i64 = row.get(0);
    Ok(count as u64)
  }
}

fn cast_for(value: Value, field_type: FieldType) -> Box<dyn ToSql + Sync + Send> {
  match field_type {
    FieldType::Number => match value {
      Value::Number(n) => Box::new(n.as_f64().unwrap_or_default()),
      _ => Box::new(Option::<f64>::None),
    },
    FieldType::Boolean => match value {
      Value::Bool(b) => Box::new(b),
      _ => Box::new(Option::<bool>::None),
    },
    FieldType::Date => match value {
      Value::String(s) => Box::new(
        DateTime::parse_from_rfc3339(&s)
          .map(|dt| dt.with_timezone(&Utc))
          .ok(),
      ),
      _ => Box::new(Option::<DateTime<Utc>>::None),
    },
    _ => value_to_sql_param(value),
  }
}
