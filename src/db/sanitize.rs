//! Identifier and literal validation for SQL fragments built by string
//! concatenation in the query translator. Every field name, collection
//! name and numeric literal that reaches raw SQL must pass through here
//! first; bound parameters carry everything else.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlSanitizeError {
  EmptyIdentifier,
  InvalidIdentifier(String),
  IdentifierTooLong(String),
  InvalidNumeric(String),
  LimitOutOfRange(i64),
}

impl fmt::Display for SqlSanitizeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::EmptyIdentifier => write!(f, "identifier must not be empty"),
      Self::InvalidIdentifier(s) => write!(f, "invalid identifier: {s}"),
      Self::IdentifierTooLong(s) => write!(f, "identifier too long: {s}"),
      Self::InvalidNumeric(s) => write!(f, "invalid numeric literal: {s}"),
      Self::LimitOutOfRange(n) => write!(f, "limit out of range: {n}"),
    }
  }
}

const MAX_IDENTIFIER_LEN: usize = 64;
const MAX_LIMIT: i64 = 10_000;

/// A bare SQL identifier: ASCII letters, digits, underscore, not starting
/// with a digit. Used for collection/table names and materialized column
/// names, never for values.
pub fn validate_identifier(name: &str) -> Result<(), SqlSanitizeError> {
  if name.is_empty() {
    return Err(SqlSanitizeError::EmptyIdentifier);
  }
  if name.len() > MAX_IDENTIFIER_LEN {
    return Err(SqlSanitizeError::IdentifierTooLong(name.to_string()));
  }
  let mut chars = name.chars();
  let first = chars.next().unwrap();
  if !(first.is_ascii_alphabetic() || first == '_') {
    return Err(SqlSanitizeError::InvalidIdentifier(name.to_string()));
  }
  if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(SqlSanitizeError::InvalidIdentifier(name.to_string()));
  }
  Ok(())
}

pub fn validate_collection_name(name: &str) -> Result<(), SqlSanitizeError> {
  validate_identifier(name)
}

/// A dotted JSON field path: one or more identifier segments joined by
/// `.`. Used for fields addressed through `json_extract`/`->>` rather
/// than materialized columns.
pub fn validate_field_path(path: &str) -> Result<(), SqlSanitizeError> {
  if path.is_empty() {
    return Err(SqlSanitizeError::EmptyIdentifier);
  }
  for segment in path.split('.') {
    validate_identifier(segment).map_err(|_| SqlSanitizeError::InvalidIdentifier(path.to_string()))?;
  }
  Ok(())
}

/// Escape a string literal for inline use (reserved for contexts that
/// cannot take a bound parameter, such as `json_extract` path strings).
/// Prefer bound parameters wherever the SQL driver allows one.
pub fn escape_string(value: &str) -> String {
  value.replace('\'', "''")
}

pub fn validate_numeric(value: &str) -> Result<(), SqlSanitizeError> {
  if value.parse::<f64>().is_err() {
    return Err(SqlSanitizeError::InvalidNumeric(value.to_string()));
  }
  Ok(())
}

pub fn validate_limit(limit: i64) -> Result<i64, SqlSanitizeError> {
  if limit < 0 || limit > MAX_LIMIT {
    return Err(SqlSanitizeError::LimitOutOfRange(limit));
  }
  Ok(limit)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_normal_identifiers() {
    assert!(validate_identifier("title").is_ok());
    assert!(validate_identifier("_private").is_ok());
    assert!(validate_identifier("field_2").is_ok());
  }

  #[test]
  fn rejects_leading_digit() {
    assert!(validate_identifier("2fast").is_err());
  }

  #[test]
  fn rejects_sql_injection_attempts() {
    let attempts = [
      "title; DROP TABLE documents;--",
      "title' OR '1'='1",
      "title--",
      "title/*comment*/",
      "title)",
      "title,extra",
    ];
    for attempt in attempts {
      assert!(
        validate_identifier(attempt).is_err(),
        "expected rejection for {attempt}"
      );
    }
  }

  #[test]
  fn field_path_allows_dots() {
    assert!(validate_field_path("address.city").is_ok());
    assert!(validate_field_path("address.").is_err());
    assert!(validate_field_path("address.; DROP TABLE x").is_err());
  }

  #[test]
  fn escape_string_doubles_single_quotes() {
    assert_eq!(escape_string("O'Brien"), "O''Brien");
  }

  #[test]
  fn limit_bounds_enforced() {
    assert!(validate_limit(-1).is_err());
    assert!(validate_limit(MAX_LIMIT + 1).is_err());
    assert!(validate_limit(100).is_ok());
  }
}
