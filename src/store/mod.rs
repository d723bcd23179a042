//! The uniform record-set contract (spec.md §4.5), built atop a
//! `db::Backend` and the query/update translator. Read-modify-write
//! semantics for `Update`/`Upsert` live here, not in the backends: the
//! backends only know how to get whole rows in and out of one dialect.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::db::{Backend, StorageError};
use crate::id::{Clock, DocumentId};
use crate::query::{
  ColumnResolver, CompiledPredicate, FindOptions, Query, SchemaColumnResolver, SqlDialect, Translator, Update,
};
use crate::schema::ddl::materialized_columns;
use crate::types::{CollectionConfig, DefaultValue, Document};

/// The record set named by one collection directory, backed by whichever
/// `Backend` the process was configured with.
pub struct Store {
  backend: Arc<dyn Backend>,
  clock: Arc<dyn Clock>,
}

impl Store {
  pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
    Self { backend, clock }
  }

  /// Every query/sort field resolves against the declared columnar
  /// schema, plus the three system columns every table carries
  /// regardless of `useColumns` — `id`/`createdAt`/`updatedAt` are real
  /// columns, never JSON overflow, even for `json-blob` collections.
  fn resolver(config: &CollectionConfig) -> SchemaColumnResolver<'_> {
    let mut columns: std::collections::BTreeMap<&str, (&str, crate::types::FieldType)> = materialized_columns(config)
      .into_iter()
      .map(|(name, field_type)| (name, (name, field_type)))
      .collect();
    columns.insert("id", ("id", crate::types::FieldType::String));
    columns.insert("createdAt", ("created_at", crate::types::FieldType::Date));
    columns.insert("updatedAt", ("updated_at", crate::types::FieldType::Date));
    SchemaColumnResolver::new(columns)
  }

  fn translator<'a>(&self, resolver: &'a dyn ColumnResolver) -> Translator<'a> {
    Translator::new(self.backend.dialect(), resolver)
  }

  fn compile(&self, config: &CollectionConfig, query: &Query) -> Result<CompiledPredicate, StorageError> {
    let resolver = Self::resolver(config);
    Ok(self.translator(&resolver).compile_query(query, 0)?)
  }

  /// Fill in declared defaults for any property absent from `fields`.
  /// `"now"` resolves against the store's clock so inserts stay
  /// deterministic under `FixedClock` in tests.
  fn apply_defaults(&self, config: &CollectionConfig, fields: &mut Map<String, Value>) {
    for (name, prop) in &config.properties {
      if fields.contains_key(name) {
        continue;
      }
      match &prop.default {
        Some(DefaultValue::Now(_)) => {
          fields.insert(name.clone(), Value::String(self.clock.now().to_rfc3339()));
        }
        Some(DefaultValue::Literal(v)) => {
          fields.insert(name.clone(), v.clone());
        }
        None => {}
      }
    }
  }

  /// Generate an id, apply declared defaults, and write one new row.
  pub async fn insert(
    &self,
    collection: &str,
    config: &CollectionConfig,
    mut fields: Map<String, Value>,
  ) -> Result<Document, StorageError> {
    self.apply_defaults(config, &mut fields);
    let id = DocumentId::generate(self.clock.as_ref());
    let now = self.clock.now();
    let doc = Document::new(id, now, fields);
    self.backend.insert_row(collection, config, &doc).await?;
    Ok(doc)
  }

  /// Matching rows, already sorted/limited/skipped by the backend. Raw —
  /// no `$fields` projection is applied; that is a response-shaping
  /// concern the HTTP layer owns once it has decided what a field
  /// script's `hide` calls also remove.
  pub async fn find(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    options: &FindOptions,
  ) -> Result<Vec<Document>, StorageError> {
    let predicate = self.compile(config, query)?;
    let resolver = Self::resolver(config);
    let order_by = self.translator(&resolver).compile_sort(&options.sort)?;
    self
      .backend
      .fetch_rows(collection, config, &predicate, &order_by, options.limit, options.skip)
      .await
  }

  pub async fn find_one(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
  ) -> Result<Option<Document>, StorageError> {
    let options = FindOptions {
      limit: Some(1),
      ..Default::default()
    };
    let rows = self.find(collection, config, query, &options).await?;
    Ok(rows.into_iter().next())
  }

  pub async fn find_by_id(
    &self,
    collection: &str,
    config: &CollectionConfig,
    id: &DocumentId,
  ) -> Result<Option<Document>, StorageError> {
    self.find_one(collection, config, &Query::eq("id", id.as_hex())).await
  }

  pub async fn count(&self, collection: &str, config: &CollectionConfig, query: &Query) -> Result<u64, StorageError> {
    let predicate = self.compile(config, query)?;
    self.backend.count_rows(collection, config, &predicate).await
  }

  pub async fn remove(&self, collection: &str, config: &CollectionConfig, query: &Query) -> Result<u64, StorageError> {
    let predicate = self.compile(config, query)?;
    self.backend.delete_rows(collection, config, &predicate).await
  }

  /// Read-modify-write: materialize every matching document, apply the
  /// update operators in memory, write back only the ones that actually
  /// changed, stamping `updatedAt` on each. Returns the modified count.
  pub async fn update(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    update: &Update,
    one: bool,
  ) -> Result<u64, StorageError> {
    let options = FindOptions {
      limit: if one { Some(1) } else { None },
      ..Default::default()
    };
    let matched = self.find(collection, config, query, &options).await?;

    let mut modified = 0u64;
    for mut doc in matched {
      let before = doc.fields.clone();
      apply_update_operators(&mut doc.fields, update);
      if doc.fields == before {
        continue;
      }
      doc.updated_at = self.clock.now();
      self.backend.replace_row(collection, config, &doc).await?;
      modified += 1;
    }
    Ok(modified)
  }

  pub async fn update_one(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    update: &Update,
  ) -> Result<u64, StorageError> {
    self.update(collection, config, query, update, true).await
  }

  /// `Update`; if nothing matched, compose a new document from the
  /// query's top-level equalities plus the update ops and `Insert` it.
  pub async fn upsert(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    update: &Update,
  ) -> Result<Document, StorageError> {
    let modified = self.update(collection, config, query, update, false).await?;
    if modified > 0 {
      if let Some(doc) = self.find_one(collection, config, query).await? {
        return Ok(doc);
      }
    }

    let mut fields: Map<String, Value> = query.top_level_equalities().into_iter().collect();
    apply_update_operators(&mut fields, update);
    self.insert(collection, config, fields).await
  }

  pub async fn increment(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    fields: std::collections::BTreeMap<String, Value>,
  ) -> Result<u64, StorageError> {
    let update = Update {
      inc: fields,
      ..Update::default()
    };
    self.update(collection, config, query, &update, false).await
  }

  pub async fn push(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    fields: std::collections::BTreeMap<String, Value>,
  ) -> Result<u64, StorageError> {
    let update = Update {
      push: fields,
      ..Update::default()
    };
    self.update(collection, config, query, &update, false).await
  }

  pub async fn pull(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    fields: std::collections::BTreeMap<String, Value>,
  ) -> Result<u64, StorageError> {
    let update = Update {
      pull: fields,
      ..Update::default()
    };
    self.update(collection, config, query, &update, false).await
  }

  pub async fn add_to_set(
    &self,
    collection: &str,
    config: &CollectionConfig,
    query: &Query,
    fields: std::collections::BTreeMap<String, Value>,
  ) -> Result<u64, StorageError> {
    let update = Update {
      add_to_set: fields,
      ..Update::default()
    };
    self.update(collection, config, query, &update, false).await
  }

  pub fn dialect(&self) -> SqlDialect {
    self.backend.dialect()
  }

  /// Create the table if missing, bring its columns in line with the
  /// declared schema, and (re)create its indexes. Idempotent — safe to
  /// call on every collection load.
  pub async fn ensure_schema(&self, collection: &str, config: &CollectionConfig) -> Result<(), StorageError> {
    self.backend.ensure_table(collection, config).await?;
    self.backend.migrate(collection, config).await?;
    self.backend.create_indexes(collection, config).await?;
    Ok(())
  }
}

/// Apply `$set/$unset/$inc/$push/$pull/$addToSet` to an in-memory field
/// map (spec.md §4.5 array-operator semantics). `pub(crate)` so the
/// collection pipeline can preview a PUT's merged candidate document
/// before running `validate`/`put` against it.
pub(crate) fn apply_update_operators(fields: &mut Map<String, Value>, update: &Update) {
  for (field, value) in &update.set {
    fields.insert(field.clone(), value.clone());
  }
  for field in update.unset.keys() {
    fields.remove(field);
  }
  for (field, delta) in &update.inc {
    apply_inc(fields, field, delta);
  }
  for (field, value) in &update.push {
    match fields.get_mut(field) {
      Some(Value::Array(arr)) => arr.push(value.clone()),
      _ => {
        fields.insert(field.clone(), Value::Array(vec![value.clone()]));
      }
    }
  }
  for (field, value) in &update.pull {
    if let Some(Value::Array(arr)) = fields.get_mut(field) {
      arr.retain(|existing| existing != value);
    }
  }
  for (field, value) in &update.add_to_set {
    match fields.get_mut(field) {
      Some(Value::Array(arr)) => {
        if !arr.iter().any(|existing| existing == value) {
          arr.push(value.clone());
        }
      }
      _ => {
        fields.insert(field.clone(), Value::Array(vec![value.clone()]));
      }
    }
  }
}

/// `$inc`: numeric coercion of both sides; a non-numeric existing value
/// or delta is a no-op for that field, logged rather than rejected
/// (spec.md §9 open question).
fn apply_inc(fields: &mut Map<String, Value>, field: &str, delta: &Value) {
  if !delta.is_number() {
    tracing::warn!(field, "$inc delta is not numeric, skipping");
    return;
  }
  let existing = fields.get(field).cloned().unwrap_or(Value::from(0));
  if !existing.is_number() {
    tracing::warn!(field, "$inc target is not numeric, skipping");
    return;
  }

  let result = match (existing.as_i64(), delta.as_i64()) {
    (Some(a), Some(b)) => Value::from(a + b),
    _ => {
      let a = existing.as_f64().unwrap_or(0.0);
      let b = delta.as_f64().unwrap_or(0.0);
      serde_json::Number::from_f64(a + b).map(Value::Number).unwrap_or(Value::Null)
    }
  };
  fields.insert(field.to_string(), result);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::sqlite::SqliteBackend;
  use crate::id::FixedClock;
  use crate::query::Op;
  use crate::types::{CollectionOptions, PropertyConfig};
  use serde_json::json;
  use std::collections::BTreeMap;

  async fn store_with(config: &CollectionConfig) -> Store {
    let backend = SqliteBackend::in_memory().await.unwrap();
    backend.ensure_table("todos", config).await.unwrap();
    backend.create_indexes("todos", config).await.unwrap();
    Store::new(Arc::new(backend), FixedClock::new(1_700_000_000))
  }

  fn json_blob_config() -> CollectionConfig {
    let mut properties = BTreeMap::new();
    properties.insert(
      "title".to_string(),
      PropertyConfig {
        field_type: crate::types::FieldType::String,
        required: true,
        default: None,
        index: false,
        order: 0,
        system: false,
        readonly: false,
      },
    );
    properties.insert(
      "done".to_string(),
      PropertyConfig {
        field_type: crate::types::FieldType::Boolean,
        required: false,
        default: Some(DefaultValue::Literal(json!(false))),
        index: false,
        order: 1,
        system: false,
        readonly: false,
      },
    );
    CollectionConfig {
      properties,
      options: CollectionOptions::default(),
      events: BTreeMap::new(),
    }
  }

  #[tokio::test]
  async fn insert_applies_defaults_and_stamps_timestamps() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let mut fields = Map::new();
    fields.insert("title".into(), json!("write tests"));
    let doc = store.insert("todos", &config, fields).await.unwrap();
    assert_eq!(doc.fields.get("done"), Some(&json!(false)));
    assert_eq!(doc.created_at, doc.updated_at);
  }

  #[tokio::test]
  async fn find_matches_equality_query() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let mut fields = Map::new();
    fields.insert("title".into(), json!("write tests"));
    store.insert("todos", &config, fields).await.unwrap();

    let found = store
      .find("todos", &config, &Query::eq("title", "write tests"), &FindOptions::default())
      .await
      .unwrap();
    assert_eq!(found.len(), 1);
  }

  #[tokio::test]
  async fn update_only_writes_when_changed() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let mut fields = Map::new();
    fields.insert("title".into(), json!("write tests"));
    fields.insert("done".into(), json!(false));
    store.insert("todos", &config, fields).await.unwrap();

    let update = Update::new().set("done", true);
    let modified = store
      .update("todos", &config, &Query::all(), &update, false)
      .await
      .unwrap();
    assert_eq!(modified, 1);

    let noop = store
      .update("todos", &config, &Query::all(), &update, false)
      .await
      .unwrap();
    assert_eq!(noop, 0);
  }

  #[tokio::test]
  async fn upsert_inserts_when_nothing_matches() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let query = Query::eq("title", "new task");
    let update = Update::new().set("done", false);
    let doc = store.upsert("todos", &config, &query, &update).await.unwrap();
    assert_eq!(doc.fields.get("title"), Some(&json!("new task")));
    assert_eq!(doc.fields.get("done"), Some(&json!(false)));
  }

  #[tokio::test]
  async fn inc_is_noop_on_non_numeric_value() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let mut fields = Map::new();
    fields.insert("title".into(), json!("write tests"));
    store.insert("todos", &config, fields).await.unwrap();

    let mut inc = BTreeMap::new();
    inc.insert("title".to_string(), json!(1));
    let update = Update {
      inc,
      ..Update::default()
    };
    let modified = store
      .update("todos", &config, &Query::all(), &update, false)
      .await
      .unwrap();
    assert_eq!(modified, 0);
  }

  #[tokio::test]
  async fn push_and_pull_roundtrip() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let mut fields = Map::new();
    fields.insert("title".into(), json!("write tests"));
    fields.insert("tags".into(), json!(["a"]));
    store.insert("todos", &config, fields).await.unwrap();

    let mut push_fields = BTreeMap::new();
    push_fields.insert("tags".to_string(), json!("b"));
    store
      .push("todos", &config, &Query::all(), push_fields)
      .await
      .unwrap();

    let doc = store
      .find_one("todos", &config, &Query::all())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(doc.fields.get("tags"), Some(&json!(["a", "b"])));

    let mut pull_fields = BTreeMap::new();
    pull_fields.insert("tags".to_string(), json!("a"));
    store
      .pull("todos", &config, &Query::all(), pull_fields)
      .await
      .unwrap();
    let doc = store
      .find_one("todos", &config, &Query::all())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(doc.fields.get("tags"), Some(&json!(["b"])));
  }

  #[tokio::test]
  async fn remove_deletes_matching_rows() {
    let config = json_blob_config();
    let store = store_with(&config).await;
    let mut fields = Map::new();
    fields.insert("title".into(), json!("write tests"));
    store.insert("todos", &config, fields).await.unwrap();

    let deleted = store.remove("todos", &config, &Query::all()).await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(store.count("todos", &config, &Query::all()).await.unwrap(), 0);
  }

  #[test]
  fn gt_predicate_is_numeric_op() {
    assert!(matches!(Op::Gt(json!(1)), Op::Gt(_)));
  }
}
