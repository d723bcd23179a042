//! The HTTP surface (spec.md §4.9): one axum router mapping
//! `GET/POST/PUT/DELETE /{collection}[/{id}]` onto the collection
//! pipeline, plus the reserved-query-string dialect (`?q=`, `$sort`,
//! `$limit`, `$skip`, `$fields`, `$skipEvents`).

use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::collection::{Method, Pipeline, PipelineOutcome, PipelineRequest};
use crate::db::sanitize;
use crate::error::PipelineError;
use crate::query::{FindOptions, Projection, Query, SortDirection};
use crate::types::Principal;

/// Bound on the `?q=` parse cache (one entry per distinct raw query string).
const QUERY_CACHE_SIZE: usize = 1024;

#[derive(Clone)]
pub struct AppState {
  pub pipeline: Arc<Pipeline>,
  query_cache: Arc<Mutex<LruCache<String, Query>>>,
}

impl AppState {
  pub fn new(pipeline: Arc<Pipeline>) -> Self {
    Self {
      pipeline,
      query_cache: Arc::new(Mutex::new(LruCache::new(
        NonZeroUsize::new(QUERY_CACHE_SIZE).unwrap(),
      ))),
    }
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/healthz", get(health))
    .route(
      "/{collection}",
      get(list_collection).post(create_document),
    )
    .route(
      "/{collection}/{id}",
      get(get_document).put(replace_document).delete(delete_document),
    )
    .with_state(state)
}

async fn health() -> &'static str {
  "ok"
}

/// Resolve the already-authenticated caller (spec.md §4.6 `me`). Session
/// storage and token verification are out of scope here; an upstream
/// layer is expected to have done that and to forward the resolved
/// identity in these headers.
fn principal_from_headers(headers: &axum::http::HeaderMap) -> Option<Principal> {
  let id = headers.get("x-principal-id")?.to_str().ok()?.to_string();
  let username = headers
    .get("x-principal-username")
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .to_string();
  let is_root = headers
    .get("x-principal-root")
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("true"))
    .unwrap_or(false);
  Some(if is_root {
    Principal::root(id, username)
  } else {
    Principal::user(id, username)
  })
}

fn validate_collection(name: &str) -> Result<(), PipelineError> {
  if name.starts_with('_') {
    return Err(PipelineError::NotFound);
  }
  sanitize::validate_collection_name(name).map_err(|_| PipelineError::NotFound)?;
  Ok(())
}

/// The reserved-key dialect parsed out of one request's query string.
struct ParsedListQuery {
  find_query: Query,
  find_options: FindOptions,
  skip_events: bool,
  /// The merged view handed to scripts as `query` (spec.md §4.6).
  script_query: Value,
}

fn parse_list_query(
  raw: Option<&str>,
  query_cache: &Mutex<LruCache<String, Query>>,
) -> Result<ParsedListQuery, PipelineError> {
  let mut flat = Map::new();
  let mut q: Option<String> = None;
  let mut sort_json: Option<Value> = None;
  let mut fields_json: Option<Value> = None;
  let mut limit: Option<usize> = None;
  let mut skip: Option<usize> = None;
  let mut skip_events = false;

  if let Some(raw) = raw {
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
      match key.as_ref() {
        "q" => q = Some(value.into_owned()),
        "$sort" => sort_json = Some(parse_json_param(&value)?),
        "$fields" => fields_json = Some(parse_json_param(&value)?),
        "$limit" => limit = Some(parse_usize_param(&value)?),
        "$skip" => skip = Some(parse_usize_param(&value)?),
        "$skipEvents" => skip_events = value == "true" || value == "1",
        field => {
          flat.insert(field.to_string(), Value::String(value.into_owned()));
        }
      }
    }
  }

  let find_query = match q {
    Some(raw_q) => {
      if let Some(cached) = query_cache.lock().get(&raw_q) {
        cached.clone()
      } else {
        let parsed = parse_json_param(&raw_q)
          .and_then(|value| Query::from_json(&value).map_err(bad_request))?;
        query_cache.lock().put(raw_q, parsed.clone());
        parsed
      }
    }
    None => Query::from_json(&Value::Object(flat.clone())).map_err(bad_request)?,
  };

  let sort = match sort_json {
    Some(Value::Object(obj)) => {
      let mut pairs = Vec::with_capacity(obj.len());
      for (field, dir) in obj {
        let dir = dir.as_i64().unwrap_or(1);
        pairs.push((field, SortDirection::from(dir)));
      }
      pairs
    }
    _ => Vec::new(),
  };

  let fields = match fields_json {
    Some(value) => Some(Projection::from_json(&value).map_err(bad_request)?),
    None => None,
  };

  let mut script_query = Map::new();
  script_query.extend(flat);
  if let Some(sort) = &sort_json {
    script_query.insert("$sort".to_string(), sort.clone());
  }
  if let Some(limit) = limit {
    script_query.insert("$limit".to_string(), Value::from(limit));
  }
  if let Some(skip) = skip {
    script_query.insert("$skip".to_string(), Value::from(skip));
  }

  Ok(ParsedListQuery {
    find_query,
    find_options: FindOptions {
      sort,
      limit,
      skip,
      fields,
    },
    skip_events,
    script_query: Value::Object(script_query),
  })
}

fn parse_json_param(raw: &str) -> Result<Value, PipelineError> {
  serde_json::from_str(raw).map_err(|e| bad_request(e.to_string()))
}

fn parse_usize_param(raw: &str) -> Result<usize, PipelineError> {
  raw.parse::<usize>().map_err(|e| bad_request(e.to_string()))
}

fn bad_request(message: impl ToString) -> PipelineError {
  let mut errors = std::collections::BTreeMap::new();
  errors.insert("query".to_string(), message.to_string());
  PipelineError::Validation(errors)
}

async fn list_collection(
  State(state): State<AppState>,
  Path(collection): Path<String>,
  RawQuery(raw): RawQuery,
  headers: axum::http::HeaderMap,
) -> Result<Response, PipelineError> {
  validate_collection(&collection)?;
  let parsed = parse_list_query(raw.as_deref(), &state.query_cache)?;

  let req = PipelineRequest {
    collection: collection.clone(),
    method: Method::Get,
    id: None,
    body: Map::new(),
    query: parsed.script_query,
    find_query: parsed.find_query,
    find_options: parsed.find_options,
    principal: principal_from_headers(&headers),
    url: format!("/{collection}"),
    skip_events: parsed.skip_events,
  };

  match state.pipeline.handle(req).await? {
    PipelineOutcome::Many(docs) => Ok((StatusCode::OK, Json(docs)).into_response()),
    _ => unreachable!("list requests always resolve to Many"),
  }
}

async fn get_document(
  State(state): State<AppState>,
  Path((collection, id)): Path<(String, String)>,
  RawQuery(raw): RawQuery,
  headers: axum::http::HeaderMap,
) -> Result<Response, PipelineError> {
  validate_collection(&collection)?;
  let parsed = parse_list_query(raw.as_deref(), &state.query_cache)?;

  let req = PipelineRequest {
    collection: collection.clone(),
    method: Method::Get,
    id: Some(id.clone()),
    body: Map::new(),
    query: parsed.script_query,
    find_query: Query::all(),
    find_options: parsed.find_options,
    principal: principal_from_headers(&headers),
    url: format!("/{collection}/{id}"),
    skip_events: parsed.skip_events,
  };

  match state.pipeline.handle(req).await? {
    PipelineOutcome::Found(doc) => Ok((StatusCode::OK, Json(doc)).into_response()),
    _ => unreachable!("get-by-id requests always resolve to Found"),
  }
}

async fn create_document(
  State(state): State<AppState>,
  Path(collection): Path<String>,
  headers: axum::http::HeaderMap,
  Json(body): Json<Value>,
) -> Result<Response, PipelineError> {
  validate_collection(&collection)?;
  let fields = body
    .as_object()
    .cloned()
    .ok_or_else(|| bad_request("request body must be a JSON object"))?;
  let skip_events = fields.get("$skipEvents").and_then(Value::as_bool).unwrap_or(false);

  let req = PipelineRequest {
    collection: collection.clone(),
    method: Method::Post,
    id: None,
    body: fields,
    query: Value::Object(Map::new()),
    find_query: Query::all(),
    find_options: FindOptions::default(),
    principal: principal_from_headers(&headers),
    url: format!("/{collection}"),
    skip_events,
  };

  match state.pipeline.handle(req).await? {
    PipelineOutcome::Created(doc) => Ok((StatusCode::CREATED, Json(doc)).into_response()),
    _ => unreachable!("create requests always resolve to Created"),
  }
}

async fn replace_document(
  State(state): State<AppState>,
  Path((collection, id)): Path<(String, String)>,
  headers: axum::http::HeaderMap,
  Json(body): Json<Value>,
) -> Result<Response, PipelineError> {
  validate_collection(&collection)?;
  let fields = body
    .as_object()
    .cloned()
    .ok_or_else(|| bad_request("request body must be a JSON object"))?;
  let skip_events = fields.get("$skipEvents").and_then(Value::as_bool).unwrap_or(false);

  let req = PipelineRequest {
    collection: collection.clone(),
    method: Method::Put,
    id: Some(id.clone()),
    body: fields,
    query: Value::Object(Map::new()),
    find_query: Query::all(),
    find_options: FindOptions::default(),
    principal: principal_from_headers(&headers),
    url: format!("/{collection}/{id}"),
    skip_events,
  };

  match state.pipeline.handle(req).await? {
    PipelineOutcome::Found(doc) => Ok((StatusCode::OK, Json(doc)).into_response()),
    _ => unreachable!("replace requests always resolve to Found"),
  }
}

async fn delete_document(
  State(state): State<AppState>,
  Path((collection, id)): Path<(String, String)>,
  headers: axum::http::HeaderMap,
) -> Result<Response, PipelineError> {
  validate_collection(&collection)?;

  let req = PipelineRequest {
    collection: collection.clone(),
    method: Method::Delete,
    id: Some(id.clone()),
    body: Map::new(),
    query: Value::Object(Map::new()),
    find_query: Query::all(),
    find_options: FindOptions::default(),
    principal: principal_from_headers(&headers),
    url: format!("/{collection}/{id}"),
    skip_events: false,
  };

  match state.pipeline.handle(req).await? {
    PipelineOutcome::Deleted => Ok(StatusCode::NO_CONTENT.into_response()),
    _ => unreachable!("delete requests always resolve to Deleted"),
  }
}
