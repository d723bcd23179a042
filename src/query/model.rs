//! The Mongo-dialect query/update AST (spec.md §4.2).
//!
//! A `Query` is a tree of conjunctions, disjunctions, negations and leaf
//! field predicates. It clones cheaply, serializes to/from the same
//! JSON shape clients send over the wire (`{"age": {"$gt": 21}}`,
//! `{"$or": [...]}`), and offers a small fluent builder for call sites
//! that construct queries directly in Rust (the Store's own upsert and
//! array-op wrappers, and tests).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
  And(Vec<Query>),
  Or(Vec<Query>),
  Not(Box<Query>),
  Predicate(FieldPredicate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldPredicate {
  pub field: String,
  pub op: Op,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
  Eq(Value),
  Ne(Value),
  Gt(Value),
  Gte(Value),
  Lt(Value),
  Lte(Value),
  In(Vec<Value>),
  Nin(Vec<Value>),
  Regex(String),
  Exists(bool),
  Size(i64),
}

impl Query {
  /// The query that matches every document.
  pub fn all() -> Self {
    Query::And(Vec::new())
  }

  pub fn field(name: impl Into<String>, op: Op) -> Self {
    Query::Predicate(FieldPredicate {
      field: name.into(),
      op,
    })
  }

  pub fn eq(name: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::field(name, Op::Eq(value.into()))
  }

  pub fn and(self, other: Query) -> Query {
    match self {
      Query::And(mut parts) => {
        parts.push(other);
        Query::And(parts)
      }
      other_self => Query::And(vec![other_self, other]),
    }
  }

  /// Flat top-level field=value equalities, used by `Upsert` to compose a
  /// new document from the query when zero documents matched an update.
  pub fn top_level_equalities(&self) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Query::And(parts) = self {
      for part in parts {
        if let Query::Predicate(FieldPredicate {
          field,
          op: Op::Eq(v),
        }) = part
        {
          out.insert(field.clone(), v.clone());
        }
      }
    } else if let Query::Predicate(FieldPredicate {
      field,
      op: Op::Eq(v),
    }) = self
    {
      out.insert(field.clone(), v.clone());
    }
    out
  }

  /// Parse the wire JSON shape into the AST. A bare value under a field
  /// key is sugar for `$eq`; `$or`/`$and`/`$not` are top-level combinators.
  pub fn from_json(value: &Value) -> Result<Self, QueryParseError> {
    let obj = value
      .as_object()
      .ok_or(QueryParseError::ExpectedObject)?;

    let mut parts = Vec::new();
    for (key, val) in obj {
      match key.as_str() {
        "$or" => {
          let arr = val.as_array().ok_or(QueryParseError::ExpectedArray("$or"))?;
          let sub: Result<Vec<Query>, _> = arr.iter().map(Query::from_json).collect();
          parts.push(Query::Or(sub?));
        }
        "$and" => {
          let arr = val
            .as_array()
            .ok_or(QueryParseError::ExpectedArray("$and"))?;
          let sub: Result<Vec<Query>, _> = arr.iter().map(Query::from_json).collect();
          parts.push(Query::And(sub?));
        }
        "$not" => {
          parts.push(Query::Not(Box::new(Query::from_json(val)?)));
        }
        field => {
          parts.push(Query::Predicate(FieldPredicate {
            field: field.to_string(),
            op: Op::from_json(val)?,
          }));
        }
      }
    }
    Ok(Query::And(parts))
  }

  pub fn to_json(&self) -> Value {
    match self {
      Query::And(parts) if parts.len() == 1 => parts[0].to_json(),
      Query::And(parts) => {
        let mut map = serde_json::Map::new();
        for part in parts {
          merge_predicate_json(&mut map, part.to_json());
        }
        Value::Object(map)
      }
      Query::Or(parts) => {
        let arr = parts.iter().map(Query::to_json).collect();
        let mut map = serde_json::Map::new();
        map.insert("$or".into(), Value::Array(arr));
        Value::Object(map)
      }
      Query::Not(inner) => {
        let mut map = serde_json::Map::new();
        map.insert("$not".into(), inner.to_json());
        Value::Object(map)
      }
      Query::Predicate(FieldPredicate { field, op }) => {
        let mut map = serde_json::Map::new();
        map.insert(field.clone(), op.to_json());
        Value::Object(map)
      }
    }
  }
}

fn merge_predicate_json(into: &mut serde_json::Map<String, Value>, from: Value) {
  if let Value::Object(obj) = from {
    for (k, v) in obj {
      into.insert(k, v);
    }
  }
}

impl Op {
  fn from_json(value: &Value) -> Result<Self, QueryParseError> {
    match value {
      Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => {
        let (op, arg) = obj
          .iter()
          .next()
          .ok_or(QueryParseError::EmptyOperatorObject)?;
        match op.as_str() {
          "$eq" => Ok(Op::Eq(arg.clone())),
          "$ne" => Ok(Op::Ne(arg.clone())),
          "$gt" => Ok(Op::Gt(arg.clone())),
          "$gte" => Ok(Op::Gte(arg.clone())),
          "$lt" => Ok(Op::Lt(arg.clone())),
          "$lte" => Ok(Op::Lte(arg.clone())),
          "$in" => Ok(Op::In(as_array(arg)?)),
          "$nin" => Ok(Op::Nin(as_array(arg)?)),
          "$regex" => Ok(Op::Regex(
            arg.as_str().ok_or(QueryParseError::ExpectedString("$regex"))?.to_string(),
          )),
          "$exists" => Ok(Op::Exists(
            arg.as_bool().ok_or(QueryParseError::ExpectedBool("$exists"))?,
          )),
          "$size" => Ok(Op::Size(
            arg.as_i64().ok_or(QueryParseError::ExpectedNumber("$size"))?,
          )),
          other => Err(QueryParseError::UnknownOperator(other.to_string())),
        }
      }
      bare => Ok(Op::Eq(bare.clone())),
    }
  }

  fn to_json(&self) -> Value {
    match self {
      Op::Eq(v) => v.clone(),
      Op::Ne(v) => single("$ne", v.clone()),
      Op::Gt(v) => single("$gt", v.clone()),
      Op::Gte(v) => single("$gte", v.clone()),
      Op::Lt(v) => single("$lt", v.clone()),
      Op::Lte(v) => single("$lte", v.clone()),
      Op::In(v) => single("$in", Value::Array(v.clone())),
      Op::Nin(v) => single("$nin", Value::Array(v.clone())),
      Op::Regex(v) => single("$regex", Value::String(v.clone())),
      Op::Exists(v) => single("$exists", Value::Bool(*v)),
      Op::Size(v) => single("$size", Value::Number((*v).into())),
    }
  }
}

fn single(key: &str, value: Value) -> Value {
  let mut map = serde_json::Map::new();
  map.insert(key.to_string(), value);
  Value::Object(map)
}

fn as_array(value: &Value) -> Result<Vec<Value>, QueryParseError> {
  value
    .as_array()
    .cloned()
    .ok_or(QueryParseError::ExpectedArray("$in/$nin"))
}

#[derive(Debug, thiserror::Error)]
pub enum QueryParseError {
  #[error("query must be a JSON object")]
  ExpectedObject,
  #[error("{0} requires an array value")]
  ExpectedArray(&'static str),
  #[error("{0} requires a string value")]
  ExpectedString(&'static str),
  #[error("{0} requires a boolean value")]
  ExpectedBool(&'static str),
  #[error("{0} requires a numeric value")]
  ExpectedNumber(&'static str),
  #[error("operator object must not be empty")]
  EmptyOperatorObject,
  #[error("unknown query operator: {0}")]
  UnknownOperator(String),
}

/// Sort specification: `{field: 1 | -1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
  Asc,
  Desc,
}

impl From<i64> for SortDirection {
  fn from(n: i64) -> Self {
    if n < 0 {
      SortDirection::Desc
    } else {
      SortDirection::Asc
    }
  }
}

#[derive(Debug, Clone)]
pub struct FindOptions {
  pub sort: Vec<(String, SortDirection)>,
  pub limit: Option<usize>,
  pub skip: Option<usize>,
  pub fields: Option<Projection>,
}

impl Default for FindOptions {
  fn default() -> Self {
    Self {
      sort: Vec::new(),
      limit: None,
      skip: None,
      fields: None,
    }
  }
}

/// `$fields`: either an inclusion list or an exclusion list, never both
/// (spec.md §6 reserved keys).
#[derive(Debug, Clone)]
pub enum Projection {
  Include(Vec<String>),
  Exclude(Vec<String>),
}

impl Projection {
  pub fn from_json(value: &Value) -> Result<Self, QueryParseError> {
    let obj = value.as_object().ok_or(QueryParseError::ExpectedObject)?;
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for (field, v) in obj {
      if v.as_i64() == Some(0) {
        exclude.push(field.clone());
      } else {
        include.push(field.clone());
      }
    }
    if !include.is_empty() && !exclude.is_empty() {
      return Err(QueryParseError::UnknownOperator(
        "$fields mixes inclusion and exclusion".into(),
      ));
    }
    if exclude.is_empty() {
      Ok(Projection::Include(include))
    } else {
      Ok(Projection::Exclude(exclude))
    }
  }

  pub fn apply(&self, doc: &mut serde_json::Map<String, Value>) {
    match self {
      Projection::Include(fields) => {
        doc.retain(|k, _| fields.iter().any(|f| f == k));
      }
      Projection::Exclude(fields) => {
        doc.retain(|k, _| !fields.iter().any(|f| f == k));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn bare_value_is_eq_sugar() {
    let q = Query::from_json(&json!({"status": "open"})).unwrap();
    assert_eq!(
      q,
      Query::And(vec![Query::field("status", Op::Eq(json!("open")))])
    );
  }

  #[test]
  fn operators_parse() {
    let q = Query::from_json(&json!({"age": {"$gt": 21}})).unwrap();
    assert_eq!(q, Query::And(vec![Query::field("age", Op::Gt(json!(21)))]));
  }

  #[test]
  fn or_group_nests() {
    let q = Query::from_json(&json!({"$or": [{"a": 1}, {"b": 2}]})).unwrap();
    match q {
      Query::And(parts) => match &parts[0] {
        Query::Or(sub) => assert_eq!(sub.len(), 2),
        other => panic!("expected Or, got {other:?}"),
      },
      other => panic!("expected And, got {other:?}"),
    }
  }

  #[test]
  fn round_trips_through_json() {
    let original = json!({"age": {"$gt": 21}, "status": "open"});
    let q = Query::from_json(&original).unwrap();
    let back = q.to_json();
    let reparsed = Query::from_json(&back).unwrap();
    assert_eq!(q, reparsed);
  }

  #[test]
  fn clone_is_deep() {
    let q = Query::from_json(&json!({"$or": [{"a": 1}]})).unwrap();
    let cloned = q.clone();
    assert_eq!(q, cloned);
  }

  #[test]
  fn empty_in_list_parses() {
    let q = Query::from_json(&json!({"role": {"$in": []}})).unwrap();
    assert_eq!(
      q,
      Query::And(vec![Query::field("role", Op::In(vec![]))])
    );
  }

  #[test]
  fn top_level_equalities_extracts_eq_only() {
    let q = Query::from_json(&json!({"status": "open", "age": {"$gt": 21}})).unwrap();
    let eqs = q.top_level_equalities();
    assert_eq!(eqs.get("status"), Some(&json!("open")));
    assert!(!eqs.contains_key("age"));
  }

  #[test]
  fn projection_rejects_mixed_inclusion_exclusion() {
    let err = Projection::from_json(&json!({"a": 1, "b": 0}));
    assert!(err.is_err());
  }
}
