//! Embedded script backend: each event source is evaluated fresh, per
//! request, against a `rquickjs` runtime (spec.md §4.7). The split
//! mirrors the teacher's `QueryEngine` — a reusable `Runtime` (the heavy,
//! slow-to-build half) paired with a fresh `Context` per call (the cheap,
//! must-not-leak-state-across-requests half).

use std::time::{Duration, Instant};

use rquickjs::{Context, Function, Runtime};

use super::context::{EventContext, ScriptOutput};
use super::ScriptError;

/// Harness evaluated around every event source. It binds the uniform
/// context API (`data`/`this`, `me`, `query`, `isRoot`, `method`, `url`,
/// `error`, `cancel`, `hide`, `protect`, `hasErrors`) into a scope built
/// fresh from the JSON the host passes in, runs the source with `this`
/// bound to `data`, and serializes the recorded effects back out.
///
/// `cancel()` throws a sentinel so it can short-circuit the remainder of
/// the script body the way spec.md's "guaranteed to short-circuit"
/// wording implies; any other thrown value propagates as a genuine
/// `ScriptError` (converted by the pipeline to `cancel(internal, 500)`).
const HARNESS: &str = r#"
(function(__inputJson) {
  var __ctx = JSON.parse(__inputJson);
  var data = __ctx.data;
  var previous = __ctx.previous;
  var me = __ctx.me;
  var query = __ctx.query;
  var isRoot = __ctx.isRoot;
  var method = __ctx.method;
  var url = __ctx.url;

  var __errors = {};
  var __cancelSignal = null;
  var __hidden = [];
  var __protected = [];
  var __CANCELLED = {};

  function error(field, message) { __errors[field] = message; }
  function cancel(message, statusCode) {
    __cancelSignal = { message: message, status: statusCode || 500 };
    throw __CANCELLED;
  }
  function hide(field) { __hidden.push(field); }
  function protect(field) { __protected.push(field); }
  function hasErrors() { return Object.keys(__errors).length > 0; }

  try {
    (function() {
      %SCRIPT_SOURCE%
    }).call(data);
  } catch (e) {
    if (e !== __CANCELLED) { throw e; }
  }

  return JSON.stringify({
    data: data,
    errors: __errors,
    cancel: __cancelSignal,
    hidden: __hidden,
    protected: __protected
  });
})
"#;

pub struct InterpretedRuntime {
  default_timeout: Duration,
  max_stack_size: usize,
  memory_limit: usize,
}

impl InterpretedRuntime {
  pub fn new(default_timeout: Duration) -> Self {
    Self {
      default_timeout,
      max_stack_size: 1024 * 1024,
      memory_limit: 16 * 1024 * 1024,
    }
  }

  pub async fn run(&self, source: &str, ctx: &mut EventContext) -> Result<(), ScriptError> {
    let input = ctx.to_script_input().to_string();
    let source = source.to_string();
    let timeout = self.default_timeout;
    let max_stack_size = self.max_stack_size;
    let memory_limit = self.memory_limit;

    let output = tokio::task::spawn_blocking(move || {
      run_sync(&source, &input, timeout, max_stack_size, memory_limit)
    })
    .await
    .map_err(|e| ScriptError::Eval(format!("script task panicked: {e}")))??;

    ctx.apply_script_output(output);
    Ok(())
  }
}

fn run_sync(
  source: &str,
  input_json: &str,
  timeout: Duration,
  max_stack_size: usize,
  memory_limit: usize,
) -> Result<ScriptOutput, ScriptError> {
  let runtime = Runtime::new().map_err(|e| ScriptError::Eval(format!("failed to start interpreter: {e}")))?;
  runtime.set_max_stack_size(max_stack_size);
  runtime.set_memory_limit(memory_limit);

  let deadline = Instant::now() + timeout;
  runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

  let harness = HARNESS.replace("%SCRIPT_SOURCE%", source);

  let context = Context::full(&runtime).map_err(|e| ScriptError::Eval(format!("failed to create scope: {e}")))?;
  let result: Result<String, rquickjs::Error> = context.with(|ctx| {
    let harness_fn: Function = ctx.eval(harness)?;
    harness_fn.call((input_json.to_string(),))
  });

  let json = result.map_err(|e| {
    if e.to_string().contains("interrupted") {
      ScriptError::Timeout
    } else {
      ScriptError::Eval(e.to_string())
    }
  })?;

  Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::context::EventContext;
  use serde_json::{json, Map};

  fn ctx_with(data: Map<String, serde_json::Value>) -> EventContext {
    EventContext::new(data, None, None, json!({}), "POST", "/todos")
  }

  #[tokio::test]
  async fn runs_validate_style_script() {
    let mut data = Map::new();
    data.insert("title".into(), json!(""));
    let mut ctx = ctx_with(data);
    let runtime = InterpretedRuntime::new(Duration::from_secs(1));
    runtime
      .run("if (!this.title) error('title', 'Title is required');", &mut ctx)
      .await
      .unwrap();
    assert!(ctx.has_errors());
    assert_eq!(ctx.errors().get("title").unwrap(), "Title is required");
  }

  #[tokio::test]
  async fn cancel_short_circuits_remaining_statements() {
    let mut ctx = ctx_with(Map::new());
    let runtime = InterpretedRuntime::new(Duration::from_secs(1));
    runtime
      .run("cancel('nope', 403); data.unreachable = true;", &mut ctx)
      .await
      .unwrap();
    assert!(ctx.is_cancelled());
    assert_eq!(ctx.cancel_signal().unwrap().status, 403);
    assert!(!ctx.data.contains_key("unreachable"));
  }

  #[tokio::test]
  async fn mutates_data_field() {
    let mut data = Map::new();
    data.insert("done".into(), json!(false));
    let mut ctx = ctx_with(data);
    let runtime = InterpretedRuntime::new(Duration::from_secs(1));
    runtime.run("this.done = true;", &mut ctx).await.unwrap();
    assert_eq!(ctx.data.get("done"), Some(&json!(true)));
  }

  #[tokio::test]
  async fn hide_and_protect_recorded() {
    let mut ctx = ctx_with(Map::new());
    let runtime = InterpretedRuntime::new(Duration::from_secs(1));
    runtime.run("hide('cost'); protect('owner');", &mut ctx).await.unwrap();
    assert!(ctx.hidden().contains("cost"));
    assert!(ctx.protected().contains("owner"));
  }

  #[tokio::test]
  async fn infinite_loop_times_out() {
    let mut ctx = ctx_with(Map::new());
    let runtime = InterpretedRuntime::new(Duration::from_millis(50));
    let result = runtime.run("while (true) {}", &mut ctx).await;
    assert!(matches!(result, Err(ScriptError::Timeout)));
  }
}
