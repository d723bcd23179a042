//! The per-request state machine (spec.md §4.8): RECEIVED → AUTHED →
//! {PROJECTING|VALIDATED} → PERSISTED → RESPONDED/ABORTED, dispatching
//! the seven lifecycle events in pipeline order around the `Store`.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::db::StorageError;
use crate::error::PipelineError;
use crate::events::EventRuntime;
use crate::id::DocumentId;
use crate::query::{FindOptions, Query};
use crate::schema::SchemaManager;
use crate::store::Store;
use crate::types::{CollectionConfig, Document, Principal};

pub use crate::events::EventContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

/// One inbound call, already parsed by the HTTP surface into the shapes
/// the pipeline needs.
pub struct PipelineRequest {
  pub collection: String,
  pub method: Method,
  pub id: Option<String>,
  /// POST: the new document's fields. PUT: the raw wire body (either an
  /// operator map or a plain replacement map — the pipeline disambiguates).
  pub body: Map<String, Value>,
  /// Merged URL query + reserved options, exposed to scripts as `query`.
  pub query: Value,
  pub find_query: Query,
  pub find_options: FindOptions,
  pub principal: Option<Principal>,
  pub url: String,
  /// `$skipEvents` from the wire payload; only honored when `principal`
  /// is root (spec.md §4.8 authorization).
  pub skip_events: bool,
}

pub enum PipelineOutcome {
  Many(Vec<Value>),
  Found(Value),
  Created(Value),
  Deleted,
}

/// Wires one collection's declared schema, its `Store`, and the event
/// runtime together. One instance serves every collection; the config
/// named by each request is resolved fresh (through the schema
/// manager's mtime cache) per call.
pub struct Pipeline {
  schema: Arc<SchemaManager>,
  store: Arc<Store>,
  events: Arc<EventRuntime>,
}

impl Pipeline {
  pub fn new(schema: Arc<SchemaManager>, store: Arc<Store>, events: Arc<EventRuntime>) -> Self {
    Self { schema, store, events }
  }

  fn load_config(&self, collection: &str) -> Result<CollectionConfig, PipelineError> {
    self
      .schema
      .load(collection)
      .map_err(|e| match e {
        crate::schema::SchemaError::NotFound(_) => PipelineError::NotFound,
        other => PipelineError::Storage(StorageError::Schema(other)),
      })
  }

  pub async fn handle(&self, req: PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
    let config = self.load_config(&req.collection)?;
    let skip_events = req.skip_events && req.principal.as_ref().map(|p| p.is_root).unwrap_or(false);

    // RECEIVED -> AUTHED: `beforerequest` always runs, `$skipEvents` or not.
    let mut gate = EventContext::new(
      req.body.clone(),
      None,
      req.principal.clone(),
      req.query.clone(),
      req.method.as_str(),
      req.url.clone(),
    );
    if let Some(event) = config.events.get("beforerequest") {
      self.events.run(event, &mut gate).await?;
    }
    if let Some(signal) = gate.cancel_signal() {
      return Err(PipelineError::cancel(signal.message.clone(), signal.status));
    }

    match req.method {
      Method::Get => match &req.id {
        Some(id) => self.handle_get_one(&req, &config, id, skip_events).await,
        None => self.handle_list(&req, &config, skip_events).await,
      },
      Method::Post => self.handle_post(&req, &config, skip_events).await,
      Method::Put => {
        let id = req.id.as_deref().ok_or(PipelineError::NotFound)?;
        self.handle_put(&req, &config, id, skip_events).await
      }
      Method::Delete => {
        let id = req.id.as_deref().ok_or(PipelineError::NotFound)?;
        self.handle_delete(&req, &config, id, skip_events).await
      }
    }
  }

  async fn handle_list(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    skip_events: bool,
  ) -> Result<PipelineOutcome, PipelineError> {
    let matched = self
      .store
      .find(&req.collection, config, &req.find_query, &req.find_options)
      .await?;

    let mut out = Vec::with_capacity(matched.len());
    for doc in matched {
      if let Some(json) = self.run_get_event(req, config, doc, skip_events).await? {
        out.push(json);
      }
    }
    if let Some(projection) = &req.find_options.fields {
      for doc in &mut out {
        if let Value::Object(map) = doc {
          projection.apply(map);
        }
      }
    }
    Ok(PipelineOutcome::Many(out))
  }

  async fn handle_get_one(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    id: &str,
    skip_events: bool,
  ) -> Result<PipelineOutcome, PipelineError> {
    let doc_id = DocumentId::parse(id).ok_or(PipelineError::NotFound)?;
    let doc = self
      .store
      .find_by_id(&req.collection, config, &doc_id)
      .await?
      .ok_or(PipelineError::NotFound)?;

    let mut json = self
      .run_get_event(req, config, doc, skip_events)
      .await?
      .ok_or(PipelineError::NotFound)?;
    if let (Some(projection), Value::Object(map)) = (&req.find_options.fields, &mut json) {
      projection.apply(map);
    }
    Ok(PipelineOutcome::Found(json))
  }

  /// Run the `get` event for one fetched document. `None` means the
  /// script cancelled — the document is dropped from the response
  /// (spec.md §4.8 "per-doc cancel -> drop that doc").
  async fn run_get_event(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    doc: Document,
    skip_events: bool,
  ) -> Result<Option<Value>, PipelineError> {
    let mut ctx = EventContext::new(
      doc.fields.clone(),
      None,
      req.principal.clone(),
      req.query.clone(),
      req.method.as_str(),
      req.url.clone(),
    );
    if !skip_events {
      if let Some(event) = config.events.get("get") {
        self.events.run(event, &mut ctx).await?;
      }
    }
    if ctx.is_cancelled() {
      return Ok(None);
    }
    let mut response = ctx.data.clone();
    ctx.apply_hide(&mut response);
    Ok(Some(wire_json(&doc, response)))
  }

  async fn handle_post(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    skip_events: bool,
  ) -> Result<PipelineOutcome, PipelineError> {
    let mut ctx = EventContext::new(
      req.body.clone(),
      None,
      req.principal.clone(),
      req.query.clone(),
      req.method.as_str(),
      req.url.clone(),
    );

    if !skip_events {
      if let Some(event) = config.events.get("validate") {
        self.events.run(event, &mut ctx).await?;
      }
      if ctx.has_errors() {
        return Err(PipelineError::Validation(ctx.errors().clone()));
      }
      if let Some(event) = config.events.get("post") {
        self.events.run(event, &mut ctx).await?;
      }
      if let Some(signal) = ctx.cancel_signal() {
        return Err(PipelineError::cancel(signal.message.clone(), signal.status));
      }
    }
    ctx.apply_protect();

    let doc = self.store.insert(&req.collection, config, ctx.data.clone()).await?;
    self.dispatch_aftercommit(req, config, skip_events, doc.clone(), None);
    Ok(PipelineOutcome::Created(doc.to_json()))
  }

  async fn handle_put(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    id: &str,
    skip_events: bool,
  ) -> Result<PipelineOutcome, PipelineError> {
    let doc_id = DocumentId::parse(id).ok_or(PipelineError::NotFound)?;
    let previous = self
      .store
      .find_by_id(&req.collection, config, &doc_id)
      .await?
      .ok_or(PipelineError::NotFound)?;

    let update = if crate::query::Update::has_operator_keys(&Value::Object(req.body.clone())) {
      crate::query::Update::from_json(&Value::Object(req.body.clone())).map_err(|e| {
        let mut errors = std::collections::BTreeMap::new();
        errors.insert("body".to_string(), e.to_string());
        PipelineError::Validation(errors)
      })?
    } else {
      crate::query::Update::from_replacement_fields(req.body.clone())
    };

    let mut working = previous.fields.clone();
    crate::store::apply_update_operators(&mut working, &update);

    let mut ctx = EventContext::new(
      working,
      Some(previous.clone()),
      req.principal.clone(),
      req.query.clone(),
      req.method.as_str(),
      req.url.clone(),
    );

    if !skip_events {
      if let Some(event) = config.events.get("validate") {
        self.events.run(event, &mut ctx).await?;
      }
      if ctx.has_errors() {
        return Err(PipelineError::Validation(ctx.errors().clone()));
      }
      if let Some(event) = config.events.get("put") {
        self.events.run(event, &mut ctx).await?;
      }
      if let Some(signal) = ctx.cancel_signal() {
        return Err(PipelineError::cancel(signal.message.clone(), signal.status));
      }
    }
    ctx.apply_protect();

    let diff = diff_to_update(&previous.fields, &ctx.data);
    self
      .store
      .update_one(&req.collection, config, &Query::eq("id", doc_id.as_hex()), &diff)
      .await?;

    let persisted = self
      .store
      .find_by_id(&req.collection, config, &doc_id)
      .await?
      .ok_or(PipelineError::NotFound)?;
    self.dispatch_aftercommit(req, config, skip_events, persisted.clone(), Some(previous));
    Ok(PipelineOutcome::Found(persisted.to_json()))
  }

  async fn handle_delete(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    id: &str,
    skip_events: bool,
  ) -> Result<PipelineOutcome, PipelineError> {
    let doc_id = DocumentId::parse(id).ok_or(PipelineError::NotFound)?;
    let previous = self
      .store
      .find_by_id(&req.collection, config, &doc_id)
      .await?
      .ok_or(PipelineError::NotFound)?;

    let mut ctx = EventContext::new(
      previous.fields.clone(),
      Some(previous.clone()),
      req.principal.clone(),
      req.query.clone(),
      req.method.as_str(),
      req.url.clone(),
    );
    if !skip_events {
      if let Some(event) = config.events.get("delete") {
        self.events.run(event, &mut ctx).await?;
      }
      if let Some(signal) = ctx.cancel_signal() {
        return Err(PipelineError::cancel(signal.message.clone(), signal.status));
      }
    }

    let deleted = self
      .store
      .remove(&req.collection, config, &Query::eq("id", doc_id.as_hex()))
      .await?;
    if deleted == 0 {
      return Err(PipelineError::NotFound);
    }
    self.dispatch_aftercommit(req, config, skip_events, previous.clone(), Some(previous));
    Ok(PipelineOutcome::Deleted)
  }

  /// `aftercommit` never blocks the response and its failures never
  /// surface to the client (spec.md §4.8); it runs on its own task
  /// against an owned copy of the context.
  fn dispatch_aftercommit(
    &self,
    req: &PipelineRequest,
    config: &CollectionConfig,
    skip_events: bool,
    doc: Document,
    previous: Option<Document>,
  ) {
    if skip_events {
      return;
    }
    let Some(event) = config.events.get("aftercommit").cloned() else {
      return;
    };
    let events = self.events.clone();
    let method = req.method.as_str().to_string();
    let url = req.url.clone();
    let query = req.query.clone();
    let principal = req.principal.clone();
    let collection = req.collection.clone();

    tokio::spawn(async move {
      let mut ctx = EventContext::new(doc.fields.clone(), previous, principal, query, method, url);
      if let Err(err) = events.run(&event, &mut ctx).await {
        tracing::error!(collection, error = %err, "aftercommit script failed");
      }
    });
  }
}

/// The document the script ended up with, minus hidden fields, rendered
/// in the wire shape (`id`/`createdAt`/`updatedAt` plus declared/
/// undeclared fields).
fn wire_json(doc: &Document, fields: Map<String, Value>) -> Value {
  let mut out = serde_json::Map::new();
  out.insert("id".to_string(), Value::String(doc.id.as_hex()));
  out.insert("createdAt".to_string(), Value::String(doc.created_at.to_rfc3339()));
  out.insert("updatedAt".to_string(), Value::String(doc.updated_at.to_rfc3339()));
  for (k, v) in fields {
    out.insert(k, v);
  }
  Value::Object(out)
}

/// Derive the minimal `$set`/`$unset` update that turns `previous` into
/// `desired`, so PUT's already-computed candidate document can be
/// persisted through the same read-modify-write path `Store::update`
/// uses for everything else.
fn diff_to_update(previous: &Map<String, Value>, desired: &Map<String, Value>) -> crate::query::Update {
  let mut update = crate::query::Update::new();
  for (field, value) in desired {
    if previous.get(field) != Some(value) {
      update.set.insert(field.clone(), value.clone());
    }
  }
  for field in previous.keys() {
    if !desired.contains_key(field) {
      update.unset.insert(field.clone(), Value::Null);
    }
  }
  update
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::sqlite::SqliteBackend;
  use crate::id::FixedClock;
  use crate::types::{CollectionOptions, EventConfig, FieldType, PropertyConfig, ScriptLanguage};
  use serde_json::json;
  use std::collections::BTreeMap;

  fn config_with_events(events: BTreeMap<String, EventConfig>) -> CollectionConfig {
    let mut properties = BTreeMap::new();
    properties.insert(
      "title".to_string(),
      PropertyConfig {
        field_type: FieldType::String,
        required: true,
        default: None,
        index: false,
        order: 0,
        system: false,
        readonly: false,
      },
    );
    CollectionConfig {
      properties,
      options: CollectionOptions::default(),
      events,
    }
  }

  fn interpreted(source: &str) -> EventConfig {
    EventConfig {
      language: ScriptLanguage::Interpreted,
      source: source.to_string(),
      compiled_handle: None,
    }
  }

  async fn pipeline_with(config: &CollectionConfig, dir: &tempfile::TempDir) -> Pipeline {
    std::fs::create_dir_all(dir.path().join("todos")).unwrap();
    std::fs::write(
      dir.path().join("todos").join("config.json"),
      serde_json::to_string(config).unwrap(),
    )
    .unwrap();
    let backend = SqliteBackend::in_memory().await.unwrap();
    backend.ensure_table("todos", config).await.unwrap();
    let clock = FixedClock::new(1_700_000_000);
    let store = Arc::new(Store::new(Arc::new(backend), clock));
    let schema = Arc::new(SchemaManager::new(dir.path()));
    let events = Arc::new(EventRuntime::new(std::time::Duration::from_secs(1)));
    Pipeline::new(schema, store, events)
  }

  fn list_request(collection: &str) -> PipelineRequest {
    PipelineRequest {
      collection: collection.to_string(),
      method: Method::Get,
      id: None,
      body: Map::new(),
      query: json!({}),
      find_query: Query::all(),
      find_options: FindOptions::default(),
      principal: None,
      url: format!("/{collection}"),
      skip_events: false,
    }
  }

  #[tokio::test]
  async fn post_applies_defaults_and_runs_validate() {
    let mut events = BTreeMap::new();
    events.insert(
      "validate".to_string(),
      interpreted("if (!this.title) error('title', 'Title is required');"),
    );
    let config = config_with_events(events);
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_with(&config, &dir).await;

    let mut req = list_request("todos");
    req.method = Method::Post;
    req.body.insert("title".into(), json!(""));

    let err = pipeline.handle(req).await.unwrap_err();
    match err {
      PipelineError::Validation(errors) => assert!(errors.contains_key("title")),
      other => panic!("expected validation error, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn post_creates_document() {
    let config = config_with_events(BTreeMap::new());
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_with(&config, &dir).await;

    let mut req = list_request("todos");
    req.method = Method::Post;
    req.body.insert("title".into(), json!("write tests"));

    match pipeline.handle(req).await.unwrap() {
      PipelineOutcome::Created(doc) => assert_eq!(doc["title"], json!("write tests")),
      _ => panic!("expected Created"),
    }
  }

  #[tokio::test]
  async fn get_hides_field_without_mutating_storage() {
    let mut events = BTreeMap::new();
    events.insert("get".to_string(), interpreted("hide('title');"));
    let config = config_with_events(events);
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_with(&config, &dir).await;

    let mut create = list_request("todos");
    create.method = Method::Post;
    create.body.insert("title".into(), json!("secret"));
    pipeline.handle(create).await.unwrap();

    let list = pipeline.handle(list_request("todos")).await.unwrap();
    match list {
      PipelineOutcome::Many(docs) => {
        assert_eq!(docs.len(), 1);
        assert!(docs[0].get("title").is_none());
      }
      _ => panic!("expected Many"),
    }
  }

  #[tokio::test]
  async fn delete_is_vetoed_by_cancel() {
    let mut events = BTreeMap::new();
    events.insert("delete".to_string(), interpreted("cancel('protected record', 403);"));
    let config = config_with_events(events);
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_with(&config, &dir).await;

    let mut create = list_request("todos");
    create.method = Method::Post;
    create.body.insert("title".into(), json!("keep me"));
    let created = match pipeline.handle(create).await.unwrap() {
      PipelineOutcome::Created(doc) => doc,
      _ => panic!("expected Created"),
    };
    let id = created["id"].as_str().unwrap().to_string();

    let mut del = list_request("todos");
    del.method = Method::Delete;
    del.id = Some(id);
    let err = pipeline.handle(del).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled { status: 403, .. }));
  }

  #[tokio::test]
  async fn put_merges_fields_and_preserves_unset_ones() {
    let config = config_with_events(BTreeMap::new());
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_with(&config, &dir).await;

    let mut create = list_request("todos");
    create.method = Method::Post;
    create.body.insert("title".into(), json!("write tests"));
    create.body.insert("done".into(), json!(false));
    let created = match pipeline.handle(create).await.unwrap() {
      PipelineOutcome::Created(doc) => doc,
      _ => panic!("expected Created"),
    };
    let id = created["id"].as_str().unwrap().to_string();

    let mut put = list_request("todos");
    put.method = Method::Put;
    put.id = Some(id);
    put.body.insert("done".into(), json!(true));

    match pipeline.handle(put).await.unwrap() {
      PipelineOutcome::Found(doc) => {
        assert_eq!(doc["done"], json!(true));
        assert_eq!(doc["title"], json!("write tests"));
      }
      _ => panic!("expected Found"),
    }
  }
}
