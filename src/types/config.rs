use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The declared schema and event-script bundle for one collection, as read
/// from `<collections-root>/<name>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
  #[serde(default)]
  pub properties: BTreeMap<String, PropertyConfig>,
  #[serde(default)]
  pub options: CollectionOptions,
  #[serde(default)]
  pub events: BTreeMap<String, EventConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionOptions {
  #[serde(default, rename = "useColumns")]
  pub use_columns: bool,
}

impl CollectionConfig {
  pub fn storage_mode(&self) -> StorageMode {
    if self.options.use_columns {
      StorageMode::Columnar
    } else {
      StorageMode::JsonBlob
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
  JsonBlob,
  Columnar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
  #[serde(rename = "type")]
  pub field_type: FieldType,
  #[serde(default)]
  pub required: bool,
  #[serde(default)]
  pub default: Option<DefaultValue>,
  #[serde(default)]
  pub index: bool,
  #[serde(default)]
  pub order: i32,
  #[serde(default)]
  pub system: bool,
  #[serde(default)]
  pub readonly: bool,
}

/// `default` accepts either a literal JSON value or the sentinel `"now"`
/// (timestamp-at-insert), matching spec.md's `default:any|"now"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
  Now(NowSentinel),
  Literal(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NowSentinel {
  #[serde(rename = "now")]
  Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
  String,
  Number,
  Boolean,
  Date,
  Array,
  Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
  pub language: ScriptLanguage,
  pub source: String,
  #[serde(rename = "compiledHandle", default)]
  pub compiled_handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
  Interpreted,
  Native,
}

/// The seven lifecycle events a collection config may bind, in pipeline
/// order (spec.md §4.8).
pub const EVENT_NAMES: [&str; 7] = [
  "beforerequest",
  "get",
  "validate",
  "post",
  "put",
  "delete",
  "aftercommit",
];

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_config() {
    let json = r#"{
      "properties": {
        "title": {"type": "string", "required": true},
        "done": {"type": "boolean", "default": false}
      },
      "options": {"useColumns": false},
      "events": {
        "validate": {"language": "interpreted", "source": "if (!this.title) error('title', 'Title is required');"}
      }
    }"#;
    let cfg: CollectionConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.properties.len(), 2);
    assert!(cfg.properties["title"].required);
    assert_eq!(cfg.storage_mode(), StorageMode::JsonBlob);
    assert!(cfg.events.contains_key("validate"));
  }

  #[test]
  fn default_now_sentinel_round_trips() {
    let json = r#"{"type": "date", "default": "now"}"#;
    let prop: PropertyConfig = serde_json::from_str(json).unwrap();
    assert!(matches!(prop.default, Some(DefaultValue::Now(_))));
  }
}
