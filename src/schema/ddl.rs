//! Dialect-aware DDL generation: table creation, column migration and
//! index statements (spec.md §4.4).

use crate::db::sanitize::{self, SqlSanitizeError};
use crate::query::SqlDialect;
use crate::types::{CollectionConfig, FieldType};

/// System columns every documents table carries regardless of schema.
/// Migration never drops these.
pub const SYSTEM_COLUMNS: [&str; 4] = ["id", "created_at", "updated_at", "data"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
  pub name: String,
  pub sql_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatement {
  AddColumn(String),
  DropColumn(String),
  Skipped { column: String, reason: String },
}

fn sql_type(field_type: FieldType, dialect: SqlDialect) -> &'static str {
  match (field_type, dialect) {
    (FieldType::String, SqlDialect::Postgres) => "VARCHAR",
    (FieldType::String, SqlDialect::Sqlite) => "TEXT",
    (FieldType::Number, SqlDialect::Postgres) => "DOUBLE PRECISION",
    (FieldType::Number, SqlDialect::Sqlite) => "REAL",
    (FieldType::Boolean, SqlDialect::Postgres) => "BOOLEAN",
    (FieldType::Boolean, SqlDialect::Sqlite) => "TINYINT(1)",
    (FieldType::Date, _) => "DATETIME",
    (FieldType::Array, _) => "JSON",
    (FieldType::Object, _) => "JSON",
  }
}

fn quote_identifier(name: &str) -> String {
  format!("\"{name}\"")
}

/// Columns promoted to real SQL columns: declared properties when the
/// collection runs `columnar` mode, none when it runs `json-blob`.
pub(crate) fn materialized_columns(config: &CollectionConfig) -> Vec<(&str, FieldType)> {
  if !config.options.use_columns {
    return Vec::new();
  }
  config
    .properties
    .iter()
    .filter(|(_, prop)| !prop.system && is_scalar(prop.field_type))
    .map(|(name, prop)| (name.as_str(), prop.field_type))
    .collect()
}

/// Arrays and objects always fall back to the `data` JSON overflow
/// column, even in `columnar` mode (spec.md §3).
fn is_scalar(field_type: FieldType) -> bool {
  matches!(
    field_type,
    FieldType::String | FieldType::Number | FieldType::Boolean | FieldType::Date
  )
}

pub fn create_table_sql(collection: &str, config: &CollectionConfig, dialect: SqlDialect) -> Result<String, SqlSanitizeError> {
  sanitize::validate_collection_name(collection)?;

  let (timestamp_type, json_type) = match dialect {
    SqlDialect::Postgres => ("TIMESTAMPTZ", "JSONB"),
    SqlDialect::Sqlite => ("DATETIME", "JSON"),
  };
  let mut columns = vec![
    format!("{} TEXT PRIMARY KEY", quote_identifier("id")),
    format!("{} {timestamp_type} NOT NULL", quote_identifier("created_at")),
    format!("{} {timestamp_type} NOT NULL", quote_identifier("updated_at")),
    format!("{} {json_type} NOT NULL", quote_identifier("data")),
  ];

  for (field, field_type) in materialized_columns(config) {
    sanitize::validate_identifier(field)?;
    columns.push(format!("{} {}", quote_identifier(field), sql_type(field_type, dialect)));
  }

  Ok(format!(
    "CREATE TABLE IF NOT EXISTS {} ({})",
    quote_identifier(collection),
    columns.join(", ")
  ))
}

/// Diff the schema's declared fields against the table's existing
/// columns. `ADD COLUMN` is always attempted; `DROP COLUMN` only when
/// the backend supports in-place alter (Postgres does, SQLite's ALTER
/// support for drops is version-gated so it is treated as unsupported
/// here and merely logged).
pub fn migration_statements(
  collection: &str,
  config: &CollectionConfig,
  existing_columns: &[String],
  dialect: SqlDialect,
  supports_alter: bool,
) -> Result<Vec<MigrationStatement>, SqlSanitizeError> {
  sanitize::validate_collection_name(collection)?;
  let mut statements = Vec::new();

  let declared = materialized_columns(config);
  for (field, field_type) in &declared {
    if !existing_columns.iter().any(|c| c == field) {
      sanitize::validate_identifier(field)?;
      statements.push(MigrationStatement::AddColumn(format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(collection),
        quote_identifier(field),
        sql_type(*field_type, dialect)
      )));
    }
  }

  for existing in existing_columns {
    if SYSTEM_COLUMNS.contains(&existing.as_str()) {
      continue;
    }
    if declared.iter().any(|(f, _)| f == existing) {
      continue;
    }
    if supports_alter {
      statements.push(MigrationStatement::DropColumn(format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_identifier(collection),
        quote_identifier(existing)
      )));
    } else {
      statements.push(MigrationStatement::Skipped {
        column: existing.clone(),
        reason: "backend does not support dropping columns in place".to_string(),
      });
    }
  }

  Ok(statements)
}

pub fn index_statements(collection: &str, config: &CollectionConfig, _dialect: SqlDialect) -> Result<Vec<String>, SqlSanitizeError> {
  sanitize::validate_collection_name(collection)?;
  let mut statements = Vec::new();
  for (field, prop) in &config.properties {
    if !prop.index {
      continue;
    }
    sanitize::validate_identifier(field)?;
    let index_name = format!("idx_{collection}_{field}");
    sanitize::validate_identifier(&index_name)?;
    let target = if config.options.use_columns {
      quote_identifier(field)
    } else {
      format!("(json_extract(data, '$.{field}'))")
    };
    statements.push(format!(
      "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
      quote_identifier(&index_name),
      quote_identifier(collection),
      target
    ));
  }
  Ok(statements)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::PropertyConfig;
  use std::collections::BTreeMap;

  fn config_with(use_columns: bool) -> CollectionConfig {
    let mut properties = BTreeMap::new();
    properties.insert(
      "title".to_string(),
      PropertyConfig {
        field_type: FieldType::String,
        required: true,
        default: None,
        index: true,
        order: 0,
        system: false,
        readonly: false,
      },
    );
    CollectionConfig {
      properties,
      options: crate::types::CollectionOptions {
        use_columns,
        ..Default::default()
      },
      events: BTreeMap::new(),
    }
  }

  #[test]
  fn create_table_includes_system_columns() {
    let sql = create_table_sql("todos", &config_with(false), SqlDialect::Sqlite).unwrap();
    assert!(sql.contains("\"id\" TEXT PRIMARY KEY"));
    assert!(sql.contains("\"data\" JSON NOT NULL"));
    assert!(!sql.contains("\"title\""));
  }

  #[test]
  fn create_table_adds_materialized_columns_when_columnar() {
    let sql = create_table_sql("todos", &config_with(true), SqlDialect::Postgres).unwrap();
    assert!(sql.contains("\"title\" VARCHAR"));
  }

  #[test]
  fn migration_adds_missing_declared_column() {
    let existing = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string()];
    let stmts = migration_statements("todos", &config_with(true), &existing, SqlDialect::Sqlite, false).unwrap();
    assert!(stmts.iter().any(|s| matches!(s, MigrationStatement::AddColumn(sql) if sql.contains("ADD COLUMN \"title\""))));
  }

  #[test]
  fn migration_skips_drop_when_unsupported() {
    let existing = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string(), "legacy".to_string()];
    let stmts = migration_statements("todos", &config_with(true), &existing, SqlDialect::Sqlite, false).unwrap();
    assert!(stmts.iter().any(|s| matches!(s, MigrationStatement::Skipped { column, .. } if column == "legacy")));
  }

  #[test]
  fn migration_drops_when_supported() {
    let existing = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string(), "data".to_string(), "legacy".to_string()];
    let stmts = migration_statements("todos", &config_with(true), &existing, SqlDialect::Postgres, true).unwrap();
    assert!(stmts.iter().any(|s| matches!(s, MigrationStatement::DropColumn(_))));
  }

  #[test]
  fn index_statements_only_for_indexed_fields() {
    let stmts = index_statements("todos", &config_with(false), SqlDialect::Sqlite).unwrap();
    assert_eq!(stmts.len(), 1);
    assert!(stmts[0].contains("idx_todos_title"));
  }

  #[test]
  fn rejects_malicious_collection_name() {
    let err = create_table_sql("todos; DROP TABLE x;--", &config_with(false), SqlDialect::Sqlite);
    assert!(err.is_err());
  }
}
