//! The per-request object threaded through the pipeline and exposed to
//! event scripts (spec.md §4.6). Both script backends see the same shape:
//! a JSON view of `data`/`previous`/`me`/`query` plus four recorded
//! effects (`errors`, `cancel`, `hidden`, `protected`) that the pipeline
//! inspects between steps rather than the scripts' control flow itself
//! (spec.md §9 "do not model as exceptions").

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Document, Principal};

#[derive(Debug, Clone)]
pub struct EventContext {
  pub data: Map<String, Value>,
  pub previous: Option<Document>,
  pub me: Option<Principal>,
  pub query: Value,
  pub is_root: bool,
  pub method: String,
  pub url: String,
  errors: BTreeMap<String, String>,
  cancel: Option<CancelSignal>,
  hidden: BTreeSet<String>,
  protected: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSignal {
  pub message: String,
  pub status: u16,
}

impl EventContext {
  pub fn new(
    data: Map<String, Value>,
    previous: Option<Document>,
    me: Option<Principal>,
    query: Value,
    method: impl Into<String>,
    url: impl Into<String>,
  ) -> Self {
    let is_root = me.as_ref().map(|p| p.is_root).unwrap_or(false);
    Self {
      data,
      previous,
      me,
      query,
      is_root,
      method: method.into(),
      url: url.into(),
      errors: BTreeMap::new(),
      cancel: None,
      hidden: BTreeSet::new(),
      protected: BTreeSet::new(),
    }
  }

  /// Record a field-scoped validation error. Does not stop execution —
  /// every field error for one request is accumulated before the
  /// pipeline checks `has_errors` between steps.
  pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
    self.errors.insert(field.into(), message.into());
  }

  /// Signal that the pipeline must abort with `status`. Cooperative: the
  /// pipeline checks this after the script returns, never mid-script.
  pub fn cancel(&mut self, message: impl Into<String>, status: u16) {
    if self.cancel.is_none() {
      self.cancel = Some(CancelSignal {
        message: message.into(),
        status,
      });
    }
  }

  pub fn hide(&mut self, field: impl Into<String>) {
    self.hidden.insert(field.into());
  }

  pub fn protect(&mut self, field: impl Into<String>) {
    self.protected.insert(field.into());
  }

  pub fn has_errors(&self) -> bool {
    !self.errors.is_empty()
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_some()
  }

  pub fn cancel_signal(&self) -> Option<&CancelSignal> {
    self.cancel.as_ref()
  }

  pub fn errors(&self) -> &BTreeMap<String, String> {
    &self.errors
  }

  pub fn hidden(&self) -> &BTreeSet<String> {
    &self.hidden
  }

  pub fn protected(&self) -> &BTreeSet<String> {
    &self.protected
  }

  /// Restore every protected field to its previous stored value (or, if
  /// there was no previous document, drop it so the client can't set a
  /// value through the write-side mask at all).
  pub fn apply_protect(&mut self) {
    let previous_fields = self.previous.as_ref().map(|p| p.fields.clone());
    for field in self.protected.clone() {
      match previous_fields.as_ref().and_then(|f| f.get(&field)) {
        Some(value) => {
          self.data.insert(field, value.clone());
        }
        None => {
          self.data.remove(&field);
        }
      }
    }
  }

  /// Remove every hidden field from a response document. Output-only:
  /// the stored row is untouched.
  pub fn apply_hide(&self, doc: &mut Map<String, Value>) {
    for field in &self.hidden {
      doc.remove(field);
    }
  }

  /// The JSON object both script backends receive: the uniform,
  /// dialect-free context API (spec.md §6).
  pub fn to_script_input(&self) -> Value {
    serde_json::json!({
      "data": Value::Object(self.data.clone()),
      "previous": self.previous.as_ref().map(|p| p.to_json()),
      "me": self.me.as_ref().and_then(|p| serde_json::to_value(p).ok()),
      "query": self.query,
      "isRoot": self.is_root,
      "method": self.method,
      "url": self.url,
    })
  }

  /// Fold a script's recorded effects back onto the context. Errors and
  /// hide/protect sets merge (a native reload can't un-hide a field an
  /// earlier call already hid); `cancel` only ever latches once.
  pub fn apply_script_output(&mut self, output: ScriptOutput) {
    if let Value::Object(data) = output.data {
      self.data = data;
    }
    for (field, message) in output.errors {
      self.error(field, message);
    }
    if let Some(signal) = output.cancel {
      self.cancel(signal.message, signal.status);
    }
    for field in output.hidden {
      self.hide(field);
    }
    for field in output.protected {
      self.protect(field);
    }
  }

  /// A cheap, fully-owned copy for the async `aftercommit` dispatch,
  /// which must not race the pipeline's own teardown of `self`
  /// (spec.md §9 "Async aftercommit").
  pub fn shallow_clone(&self) -> Self {
    self.clone()
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptOutput {
  pub data: Value,
  #[serde(default)]
  pub errors: BTreeMap<String, String>,
  #[serde(default)]
  pub cancel: Option<CancelSignal>,
  #[serde(default)]
  pub hidden: Vec<String>,
  #[serde(default)]
  pub protected: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn ctx() -> EventContext {
    let mut fields = Map::new();
    fields.insert("title".into(), json!("hi"));
    EventContext::new(fields, None, None, json!({}), "POST", "/todos")
  }

  #[test]
  fn error_does_not_cancel() {
    let mut c = ctx();
    c.error("title", "required");
    assert!(c.has_errors());
    assert!(!c.is_cancelled());
  }

  #[test]
  fn cancel_latches_first_call() {
    let mut c = ctx();
    c.cancel("first", 403);
    c.cancel("second", 500);
    assert_eq!(c.cancel_signal().unwrap().message, "first");
  }

  #[test]
  fn protect_restores_previous_value() {
    let mut fields = Map::new();
    fields.insert("cost".into(), json!(5));
    let previous = Document::new(
      crate::id::DocumentId::generate(&crate::id::SystemClock),
      chrono::Utc::now(),
      fields,
    );
    let mut data = Map::new();
    data.insert("cost".into(), json!(999));
    let mut c = EventContext::new(data, Some(previous), None, json!({}), "PUT", "/x");
    c.protect("cost");
    c.apply_protect();
    assert_eq!(c.data.get("cost"), Some(&json!(5)));
  }

  #[test]
  fn protect_without_previous_drops_field() {
    let mut data = Map::new();
    data.insert("cost".into(), json!(999));
    let mut c = EventContext::new(data, None, None, json!({}), "POST", "/x");
    c.protect("cost");
    c.apply_protect();
    assert!(!c.data.contains_key("cost"));
  }

  #[test]
  fn hide_removes_field_from_response_only() {
    let mut c = ctx();
    c.hide("title");
    let mut response = c.data.clone();
    c.apply_hide(&mut response);
    assert!(!response.contains_key("title"));
    assert!(c.data.contains_key("title"));
  }
}
