//! End-to-end pipeline scenarios against an in-memory SQLite backend,
//! exercising the full request path (HTTP request shape in, wire JSON
//! out) the way `src/db/sqlite.rs`'s own tests exercise the backend alone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use collectiond::collection::{Method, Pipeline, PipelineOutcome, PipelineRequest};
use collectiond::db::backend::Backend;
use collectiond::db::sqlite::SqliteBackend;
use collectiond::events::EventRuntime;
use collectiond::id::FixedClock;
use collectiond::query::{FindOptions, Query};
use collectiond::schema::SchemaManager;
use collectiond::store::Store;
use collectiond::types::{
  CollectionConfig, CollectionOptions, DefaultValue, EventConfig, FieldType, NowSentinel,
  PropertyConfig, ScriptLanguage,
};
use collectiond::PipelineError;
use serde_json::{json, Map};

fn property(field_type: FieldType, required: bool, default: Option<DefaultValue>) -> PropertyConfig {
  PropertyConfig {
    field_type,
    required,
    default,
    index: false,
    order: 0,
    system: false,
    readonly: false,
  }
}

fn interpreted(source: &str) -> EventConfig {
  EventConfig {
    language: ScriptLanguage::Interpreted,
    source: source.to_string(),
    compiled_handle: None,
  }
}

fn request(collection: &str, method: Method) -> PipelineRequest {
  PipelineRequest {
    collection: collection.to_string(),
    method,
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

async fn pipeline_for(
  collection: &str,
  config: &CollectionConfig,
  dir: &tempfile::TempDir,
) -> Pipeline {
  std::fs::create_dir_all(dir.path().join(collection)).unwrap();
  std::fs::write(
    dir.path().join(collection).join("config.json"),
    serde_json::to_string(config).unwrap(),
  )
  .unwrap();
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.ensure_table(collection, config).await.unwrap();
  let clock = FixedClock::new(1_700_000_000);
  let store = Arc::new(Store::new(Arc::new(backend), clock));
  let schema = Arc::new(SchemaManager::new(dir.path()));
  let events = Arc::new(EventRuntime::new(Duration::from_secs(1)));
  Pipeline::new(schema, store, events)
}

#[tokio::test]
async fn create_stamps_defaults_and_timestamps() {
  let mut properties = BTreeMap::new();
  properties.insert(
    "title".to_string(),
    property(FieldType::String, true, None),
  );
  properties.insert(
    "status".to_string(),
    property(
      FieldType::String,
      false,
      Some(DefaultValue::Literal(json!("open"))),
    ),
  );
  properties.insert(
    "openedAt".to_string(),
    property(FieldType::Date, false, Some(DefaultValue::Now(NowSentinel::Now))),
  );
  let config = CollectionConfig {
    properties,
    options: CollectionOptions::default(),
    events: BTreeMap::new(),
  };
  let dir = tempfile::tempdir().unwrap();
  let pipeline = pipeline_for("tickets", &config, &dir).await;

  let mut req = request("tickets", Method::Post);
  req.body.insert("title".into(), json!("billing question"));

  let outcome = pipeline.handle(req).await.unwrap();
  match outcome {
    PipelineOutcome::Created(doc) => {
      assert_eq!(doc["title"], json!("billing question"));
      assert_eq!(doc["status"], json!("open"));
      assert!(doc["openedAt"].is_string());
      assert!(doc["id"].is_string());
      assert_eq!(doc["createdAt"], doc["updatedAt"]);
    }
    _ => panic!("expected Created"),
  }
}

#[tokio::test]
async fn validate_event_rejects_with_field_errors() {
  let mut properties = BTreeMap::new();
  properties.insert("title".to_string(), property(FieldType::String, true, None));
  let mut events = BTreeMap::new();
  events.insert(
    "validate".to_string(),
    interpreted("if (!this.title) error('title', 'title is required');"),
  );
  let config = CollectionConfig {
    properties,
    options: CollectionOptions::default(),
    events,
  };
  let dir = tempfile::tempdir().unwrap();
  let pipeline = pipeline_for("tickets", &config, &dir).await;

  let req = request("tickets", Method::Post);
  let err = pipeline.handle(req).await.unwrap_err();
  match err {
    PipelineError::Validation(errors) => assert_eq!(errors.get("title").unwrap(), "title is required"),
    other => panic!("expected Validation, got {other:?}"),
  }
}

#[tokio::test]
async fn get_event_hides_a_field_from_the_wire_response() {
  let mut properties = BTreeMap::new();
  properties.insert("secret".to_string(), property(FieldType::String, false, None));
  let mut events = BTreeMap::new();
  events.insert("get".to_string(), interpreted("hide('secret');"));
  let config = CollectionConfig {
    properties,
    options: CollectionOptions::default(),
    events,
  };
  let dir = tempfile::tempdir().unwrap();
  let pipeline = pipeline_for("accounts", &config, &dir).await;

  let mut create = request("accounts", Method::Post);
  create.body.insert("secret".into(), json!("swordfish"));
  let created = match pipeline.handle(create).await.unwrap() {
    PipelineOutcome::Created(doc) => doc,
    _ => panic!("expected Created"),
  };
  let id = created["id"].as_str().unwrap().to_string();

  let mut get = request("accounts", Method::Get);
  get.id = Some(id);
  match pipeline.handle(get).await.unwrap() {
    PipelineOutcome::Found(doc) => assert!(doc.get("secret").is_none()),
    _ => panic!("expected Found"),
  }
}

#[tokio::test]
async fn delete_event_can_veto_the_operation() {
  let config = CollectionConfig {
    properties: BTreeMap::new(),
    options: CollectionOptions::default(),
    events: {
      let mut events = BTreeMap::new();
      events.insert(
        "delete".to_string(),
        interpreted("cancel('records are retained for 30 days', 403);"),
      );
      events
    },
  };
  let dir = tempfile::tempdir().unwrap();
  let pipeline = pipeline_for("invoices", &config, &dir).await;

  let created = match pipeline.handle(request("invoices", Method::Post)).await.unwrap() {
    PipelineOutcome::Created(doc) => doc,
    _ => panic!("expected Created"),
  };
  let id = created["id"].as_str().unwrap().to_string();

  let mut delete = request("invoices", Method::Delete);
  delete.id = Some(id.clone());
  let err = pipeline.handle(delete).await.unwrap_err();
  assert!(matches!(err, PipelineError::Cancelled { status: 403, .. }));

  // The record must still be there: the veto really stopped the delete.
  let mut get = request("invoices", Method::Get);
  get.id = Some(id);
  assert!(matches!(pipeline.handle(get).await.unwrap(), PipelineOutcome::Found(_)));
}

#[tokio::test]
async fn update_merges_into_existing_document_and_preserves_other_fields() {
  let mut properties = BTreeMap::new();
  properties.insert("title".to_string(), property(FieldType::String, false, None));
  properties.insert("done".to_string(), property(FieldType::Boolean, false, None));
  let config = CollectionConfig {
    properties,
    options: CollectionOptions::default(),
    events: BTreeMap::new(),
  };
  let dir = tempfile::tempdir().unwrap();
  let pipeline = pipeline_for("todos", &config, &dir).await;

  let mut create = request("todos", Method::Post);
  create.body.insert("title".into(), json!("write tests"));
  create.body.insert("done".into(), json!(false));
  let created = match pipeline.handle(create).await.unwrap() {
    PipelineOutcome::Created(doc) => doc,
    _ => panic!("expected Created"),
  };
  let id = created["id"].as_str().unwrap().to_string();

  let mut update = request("todos", Method::Put);
  update.id = Some(id);
  update.body.insert("done".into(), json!(true));

  match pipeline.handle(update).await.unwrap() {
    PipelineOutcome::Found(doc) => {
      assert_eq!(doc["done"], json!(true));
      assert_eq!(doc["title"], json!("write tests"));
    }
    _ => panic!("expected Found"),
  }
}

#[tokio::test]
async fn list_query_filters_by_equality() {
  let mut properties = BTreeMap::new();
  properties.insert("status".to_string(), property(FieldType::String, false, None));
  let config = CollectionConfig {
    properties,
    options: CollectionOptions::default(),
    events: BTreeMap::new(),
  };
  let dir = tempfile::tempdir().unwrap();
  let pipeline = pipeline_for("tickets", &config, &dir).await;

  for status in ["open", "closed", "open"] {
    let mut create = request("tickets", Method::Post);
    create.body.insert("status".into(), json!(status));
    pipeline.handle(create).await.unwrap();
  }

  let mut list = request("tickets", Method::Get);
  list.find_query = Query::eq("status", json!("open"));
  match pipeline.handle(list).await.unwrap() {
    PipelineOutcome::Many(docs) => assert_eq!(docs.len(), 2),
    _ => panic!("expected Many"),
  }
}
