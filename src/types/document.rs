use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::DocumentId;

/// A collection record: the declared/undeclared fields plus the three
/// fields every document carries regardless of schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
  pub id: DocumentId,
  #[serde(rename = "createdAt")]
  pub created_at: DateTime<Utc>,
  #[serde(rename = "updatedAt")]
  pub updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Document {
  pub fn new(id: DocumentId, created_at: DateTime<Utc>, fields: Map<String, Value>) -> Self {
    Self {
      id,
      created_at,
      updated_at: created_at,
      fields,
    }
  }

  /// Render as the wire-shape JSON object (id/createdAt/updatedAt merged
  /// with the declared/undeclared fields), the shape clients actually see.
  pub fn to_json(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    match field {
      "id" => None, // id is typed, not a Value; callers compare via .id directly
      _ => self.fields.get(field),
    }
  }
}
