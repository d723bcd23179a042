//! The update AST: a map of operator -> field -> value (spec.md §4.2).

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
  pub set: BTreeMap<String, Value>,
  pub unset: BTreeMap<String, Value>,
  pub inc: BTreeMap<String, Value>,
  pub push: BTreeMap<String, Value>,
  pub pull: BTreeMap<String, Value>,
  pub add_to_set: BTreeMap<String, Value>,
}

impl Update {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.set.insert(field.into(), value.into());
    self
  }

  pub fn inc(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.inc.insert(field.into(), value.into());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
      && self.unset.is_empty()
      && self.inc.is_empty()
      && self.push.is_empty()
      && self.pull.is_empty()
      && self.add_to_set.is_empty()
  }

  /// True if the wire body used at least one `$`-operator key. A PUT body
  /// with none of these is a full-document replacement instead, and the
  /// two forms must not be mixed (spec.md §4.2 edge case).
  pub fn has_operator_keys(value: &Value) -> bool {
    value
      .as_object()
      .map(|obj| obj.keys().any(|k| k.starts_with('$')))
      .unwrap_or(false)
  }

  /// Parse the operator-map wire shape:
  /// `{"$set": {...}, "$inc": {...}, ...}`.
  pub fn from_json(value: &Value) -> Result<Self, UpdateParseError> {
    let obj = value.as_object().ok_or(UpdateParseError::ExpectedObject)?;
    let mut update = Update::new();
    for (key, val) in obj {
      let field_map = val
        .as_object()
        .ok_or_else(|| UpdateParseError::ExpectedObject)?;
      let target = match key.as_str() {
        "$set" => &mut update.set,
        "$unset" => &mut update.unset,
        "$inc" => &mut update.inc,
        "$push" => &mut update.push,
        "$pull" => &mut update.pull,
        "$addToSet" => &mut update.add_to_set,
        other => return Err(UpdateParseError::UnknownOperator(other.to_string())),
      };
      for (field, v) in field_map {
        target.insert(field.clone(), v.clone());
      }
    }
    Ok(update)
  }

  /// Build a `$set` update directly from a plain field map, the shape a
  /// full-document replacement PUT collapses to once merged onto the
  /// previous document.
  pub fn from_replacement_fields(fields: serde_json::Map<String, Value>) -> Self {
    let mut update = Update::new();
    update.set = fields.into_iter().collect();
    update
  }

  pub fn to_json(&self) -> Value {
    let mut map = serde_json::Map::new();
    let sections: [(&str, &BTreeMap<String, Value>); 6] = [
      ("$set", &self.set),
      ("$unset", &self.unset),
      ("$inc", &self.inc),
      ("$push", &self.push),
      ("$pull", &self.pull),
      ("$addToSet", &self.add_to_set),
    ];
    for (op, fields) in sections {
      if !fields.is_empty() {
        map.insert(
          op.to_string(),
          Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
      }
    }
    Value::Object(map)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateParseError {
  #[error("update body must be a JSON object of operator -> field -> value")]
  ExpectedObject,
  #[error("unknown update operator: {0}")]
  UnknownOperator(String),
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn parses_operator_map() {
    let u = Update::from_json(&json!({
      "$set": {"title": "new"},
      "$inc": {"views": 1}
    }))
    .unwrap();
    assert_eq!(u.set.get("title"), Some(&json!("new")));
    assert_eq!(u.inc.get("views"), Some(&json!(1)));
  }

  #[test]
  fn round_trips_through_json() {
    let original = Update::new().set("a", 1).inc("b", 2);
    let json = original.to_json();
    let reparsed = Update::from_json(&json).unwrap();
    assert_eq!(original, reparsed);
  }

  #[test]
  fn detects_operator_keys() {
    assert!(Update::has_operator_keys(&json!({"$set": {"a": 1}})));
    assert!(!Update::has_operator_keys(&json!({"a": 1})));
  }

  #[test]
  fn rejects_unknown_operator() {
    let err = Update::from_json(&json!({"$bogus": {"a": 1}}));
    assert!(err.is_err());
  }

  #[test]
  fn replacement_fields_become_set() {
    let mut fields = serde_json::Map::new();
    fields.insert("title".into(), json!("hi"));
    let u = Update::from_replacement_fields(fields);
    assert_eq!(u.set.get("title"), Some(&json!("hi")));
    assert!(u.unset.is_empty());
  }
}
