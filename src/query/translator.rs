//! Compiles a `Query`/`Update` AST into a dialect-specific SQL fragment
//! plus a parameter list, dispatching each field through a materialized
//! column when the collection's schema promotes it there (`useColumns`)
//! and through the JSON overflow column otherwise (spec.md §4.3/§4.5).

use serde_json::Value;

use crate::db::sanitize::{self, SqlSanitizeError};
use crate::query::model::{FieldPredicate, Op, Query, SortDirection};
use crate::types::FieldType;

/// SQL dialect for query compilation, and the JSON-path access patterns
/// that differ between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
  Postgres,
  Sqlite,
}

impl SqlDialect {
  fn json_text(&self, path: &str) -> String {
    match self {
      Self::Postgres => format!("data#>>'{{{}}}'", path.replace('.', ",")),
      Self::Sqlite => format!("json_extract(data, '$.{path}')"),
    }
  }

  fn json_numeric(&self, path: &str) -> String {
    match self {
      Self::Postgres => format!("(data#>>'{{{}}}')::numeric", path.replace('.', ",")),
      Self::Sqlite => format!("CAST(json_extract(data, '$.{path}') AS REAL)"),
    }
  }

  fn placeholder(&self, index: usize) -> String {
    match self {
      Self::Postgres => format!("${index}"),
      Self::Sqlite => "?".to_string(),
    }
  }
}

/// Resolves a field name to either a materialized column or a JSON
/// overflow path, per the owning collection's `useColumns` schema.
pub trait ColumnResolver {
  /// `Some(column_name)` if `field` was promoted to a real SQL column.
  fn column_for(&self, field: &str) -> Option<&str>;
}

/// Always treats every field as JSON-blob overflow; used by collections
/// with `useColumns: false`.
pub struct NoColumns;

impl ColumnResolver for NoColumns {
  fn column_for(&self, _field: &str) -> Option<&str> {
    None
  }
}

pub struct Translator<'a> {
  pub dialect: SqlDialect,
  pub columns: &'a dyn ColumnResolver,
}

pub struct CompiledPredicate {
  pub sql: String,
  pub params: Vec<Value>,
}

impl<'a> Translator<'a> {
  pub fn new(dialect: SqlDialect, columns: &'a dyn ColumnResolver) -> Self {
    Self { dialect, columns }
  }

  pub fn compile_query(&self, query: &Query, next_param: usize) -> Result<CompiledPredicate, SqlSanitizeError> {
    let mut params = Vec::new();
    let sql = self.compile_node(query, &mut params, next_param)?;
    Ok(CompiledPredicate { sql, params })
  }

  fn compile_node(
    &self,
    query: &Query,
    params: &mut Vec<Value>,
    next_param: usize,
  ) -> Result<String, SqlSanitizeError> {
    match query {
      Query::And(parts) => {
        if parts.is_empty() {
          return Ok("1=1".to_string());
        }
        let mut clauses = Vec::with_capacity(parts.len());
        for part in parts {
          clauses.push(self.compile_node(part, params, next_param)?);
        }
        Ok(format!("({})", clauses.join(" AND ")))
      }
      Query::Or(parts) => {
        if parts.is_empty() {
          return Ok("1=0".to_string());
        }
        let mut clauses = Vec::with_capacity(parts.len());
        for part in parts {
          clauses.push(self.compile_node(part, params, next_param)?);
        }
        Ok(format!("({})", clauses.join(" OR ")))
      }
      Query::Not(inner) => {
        let clause = self.compile_node(inner, params, next_param)?;
        Ok(format!("(NOT {clause})"))
      }
      Query::Predicate(pred) => self.compile_predicate(pred, params, next_param),
    }
  }

  fn compile_predicate(
    &self,
    pred: &FieldPredicate,
    params: &mut Vec<Value>,
    next_param: usize,
  ) -> Result<String, SqlSanitizeError> {
    sanitize::validate_field_path(&pred.field)?;
    let column = self.columns.column_for(&pred.field);

    let mut bind = |value: Value, params: &mut Vec<Value>| -> String {
      params.push(value);
      self.dialect.placeholder(next_param + params.len())
    };

    let text_expr = || match column {
      Some(col) => col.to_string(),
      None => self.dialect.json_text(&pred.field),
    };
    let numeric_expr = || match column {
      Some(col) => format!("CAST({col} AS REAL)"),
      None => self.dialect.json_numeric(&pred.field),
    };

    let sql = match &pred.op {
      Op::Eq(v) => format!("{} = {}", expr_for(v, column, &text_expr, &numeric_expr), bind(v.clone(), params)),
      Op::Ne(v) => format!(
        "{} IS DISTINCT FROM {}",
        expr_for(v, column, &text_expr, &numeric_expr),
        bind(v.clone(), params)
      ),
      Op::Gt(v) => format!("{} > {}", numeric_or_text(v, &numeric_expr, &text_expr), bind(v.clone(), params)),
      Op::Gte(v) => format!("{} >= {}", numeric_or_text(v, &numeric_expr, &text_expr), bind(v.clone(), params)),
      Op::Lt(v) => format!("{} < {}", numeric_or_text(v, &numeric_expr, &text_expr), bind(v.clone(), params)),
      Op::Lte(v) => format!("{} <= {}", numeric_or_text(v, &numeric_expr, &text_expr), bind(v.clone(), params)),
      Op::In(values) => {
        if values.is_empty() {
          "1=0".to_string()
        } else {
          let placeholders: Vec<String> = values
            .iter()
            .cloned()
            .map(|v| bind(v, params))
            .collect();
          format!("{} IN ({})", text_expr(), placeholders.join(", "))
        }
      }
      Op::Nin(values) => {
        if values.is_empty() {
          "1=1".to_string()
        } else {
          let placeholders: Vec<String> = values
            .iter()
            .cloned()
            .map(|v| bind(v, params))
            .collect();
          format!("{} NOT IN ({})", text_expr(), placeholders.join(", "))
        }
      }
      Op::Regex(pattern) => match self.dialect {
        SqlDialect::Postgres => format!("{} ~ {}", text_expr(), bind(Value::String(pattern.clone()), params)),
        SqlDialect::Sqlite => format!(
          "{} LIKE {} ESCAPE '\\'",
          text_expr(),
          bind(Value::String(regex_to_like(pattern)), params)
        ),
      },
      Op::Exists(want) => {
        let expr = text_expr();
        if *want {
          format!("{expr} IS NOT NULL")
        } else {
          format!("{expr} IS NULL")
        }
      }
      Op::Size(n) => {
        let len_expr = match column {
          Some(col) => format!("jsonb_array_length({col})"),
          None => match self.dialect {
            SqlDialect::Postgres => format!("jsonb_array_length(({})::jsonb)", self.dialect.json_text(&pred.field)),
            SqlDialect::Sqlite => format!("json_array_length(data, '$.{}')", pred.field),
          },
        };
        format!("{len_expr} = {}", bind(Value::from(*n), params))
      }
    };
    Ok(sql)
  }

  pub fn compile_sort(&self, sort: &[(String, SortDirection)]) -> Result<String, SqlSanitizeError> {
    if sort.is_empty() {
      return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(sort.len());
    for (field, dir) in sort {
      sanitize::validate_field_path(field)?;
      let expr = match self.columns.column_for(field) {
        Some(col) => col.to_string(),
        None => self.dialect.json_text(field),
      };
      let direction = match dir {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
      };
      parts.push(format!("{expr} {direction}"));
    }
    Ok(format!("ORDER BY {}", parts.join(", ")))
  }
}

/// Best-effort translation of a small regex subset to a `LIKE` pattern,
/// for dialects with no native regex operator. Anchors (`^`, `$`)
/// control whether the wildcard applies at that end; `.*`/`.+`/`.`
/// become `%`/`_%`/`_`; literal `%`/`_` are escaped.
fn regex_to_like(pattern: &str) -> String {
  let anchored_start = pattern.starts_with('^');
  let anchored_end = pattern.ends_with('$') && !pattern.ends_with("\\$");
  let mut body = pattern;
  if anchored_start {
    body = &body[1..];
  }
  if anchored_end {
    body = &body[..body.len() - 1];
  }

  let mut out = String::new();
  let mut chars = body.chars().peekable();
  while let Some(c) = chars.next() {
    match c {
      '%' | '_' => {
        out.push('\\');
        out.push(c);
      }
      '.' => {
        if chars.peek() == Some(&'*') {
          chars.next();
          out.push('%');
        } else if chars.peek() == Some(&'+') {
          chars.next();
          out.push_str("_%");
        } else {
          out.push('_');
        }
      }
      other => out.push(other),
    }
  }

  if !anchored_start {
    out.insert(0, '%');
  }
  if !anchored_end {
    out.push('%');
  }
  out
}

fn numeric_or_text(value: &Value, numeric_expr: &dyn Fn() -> String, text_expr: &dyn Fn() -> String) -> String {
  if value.is_number() {
    numeric_expr()
  } else {
    text_expr()
  }
}

fn expr_for(
  value: &Value,
  _column: Option<&str>,
  text_expr: &dyn Fn() -> String,
  numeric_expr: &dyn Fn() -> String,
) -> String {
  if value.is_number() {
    numeric_expr()
  } else {
    text_expr()
  }
}

/// Resolves field names against a collection's declared schema, so
/// numeric operators know to cast JSON overflow text to numeric even
/// when the stored value is a JSON number, not a materialized column.
pub struct SchemaColumnResolver<'a> {
  columns: std::collections::BTreeMap<&'a str, (&'a str, FieldType)>,
}

impl<'a> SchemaColumnResolver<'a> {
  pub fn new(columns: std::collections::BTreeMap<&'a str, (&'a str, FieldType)>) -> Self {
    Self { columns }
  }
}

impl<'a> ColumnResolver for SchemaColumnResolver<'a> {
  fn column_for(&self, field: &str) -> Option<&str> {
    self.columns.get(field).map(|(name, _)| *name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::model::Query;
  use serde_json::json;

  #[test]
  fn compiles_eq_against_json_blob_sqlite() {
    let t = Translator::new(SqlDialect::Sqlite, &NoColumns);
    let q = Query::from_json(&json!({"status": "open"})).unwrap();
    let compiled = t.compile_query(&q, 0).unwrap();
    assert!(compiled.sql.contains("json_extract(data, '$.status')"));
    assert_eq!(compiled.params, vec![json!("open")]);
  }

  #[test]
  fn compiles_gt_as_numeric_postgres() {
    let t = Translator::new(SqlDialect::Postgres, &NoColumns);
    let q = Query::from_json(&json!({"age": {"$gt": 21}})).unwrap();
    let compiled = t.compile_query(&q, 0).unwrap();
    assert!(compiled.sql.contains("::numeric"));
    assert_eq!(compiled.params, vec![json!(21)]);
  }

  #[test]
  fn in_with_empty_list_is_always_false() {
    let t = Translator::new(SqlDialect::Sqlite, &NoColumns);
    let q = Query::from_json(&json!({"role": {"$in": []}})).unwrap();
    let compiled = t.compile_query(&q, 0).unwrap();
    assert_eq!(compiled.sql, "(1=0)");
  }

  #[test]
  fn rejects_malicious_field_name() {
    let t = Translator::new(SqlDialect::Sqlite, &NoColumns);
    let q = Query::Predicate(FieldPredicate {
      field: "a; DROP TABLE documents;--".to_string(),
      op: Op::Eq(json!(1)),
    });
    assert!(t.compile_query(&q, 0).is_err());
  }

  #[test]
  fn regex_falls_back_to_like_on_sqlite() {
    let t = Translator::new(SqlDialect::Sqlite, &NoColumns);
    let q = Query::from_json(&json!({"name": {"$regex": "^Jan.*$"}})).unwrap();
    let compiled = t.compile_query(&q, 0).unwrap();
    assert!(compiled.sql.contains("LIKE"));
    assert_eq!(compiled.params, vec![json!("Jan%")]);
  }

  #[test]
  fn or_group_parenthesizes() {
    let t = Translator::new(SqlDialect::Sqlite, &NoColumns);
    let q = Query::from_json(&json!({"$or": [{"a": 1}, {"b": 2}]})).unwrap();
    let compiled = t.compile_query(&q, 0).unwrap();
    assert!(compiled.sql.contains(" OR "));
    assert_eq!(compiled.params.len(), 2);
  }
}
