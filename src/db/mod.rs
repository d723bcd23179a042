//! Storage backends: a row-level CRUD contract (`backend::Backend`)
//! implemented against SQLite and PostgreSQL (spec.md §4.5).

pub mod backend;
pub mod postgres;
pub mod sanitize;
pub mod sqlite;

pub use backend::{Backend, StorageError};

use serde_json::{Map, Value};

/// Merge a row's materialized scalar columns back onto its JSON
/// overflow, producing the document's full field map. Materialized
/// values win over any same-named overflow key (the overflow is never
/// supposed to carry a declared field, but a stale row from before a
/// schema change might).
pub(crate) fn merge_overflow(data_json: Value, materialized: Vec<(String, Value)>) -> Map<String, Value> {
  let mut fields = match data_json {
    Value::Object(map) => map,
    Value::Null => Map::new(),
    other => {
      let mut map = Map::new();
      map.insert("_overflow".to_string(), other);
      map
    }
  };
  for (field, value) in materialized {
    if !value.is_null() {
      fields.insert(field, value);
    }
  }
  fields
}
