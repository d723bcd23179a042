//! The event script engine (spec.md §4.7): a uniform `EventContext` run
//! against either an interpreted (`rquickjs`) or native (hot-reloaded
//! `cdylib`) backend, dispatched per the `language` declared on a
//! collection's event config.

pub mod context;
mod interpreted;
mod native;

pub use context::{CancelSignal, EventContext, ScriptOutput};
pub use interpreted::InterpretedRuntime;
pub use native::NativeScriptRegistry;

use std::path::Path;
use std::time::Duration;

use crate::types::{EventConfig, ScriptLanguage};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
  #[error("script evaluation failed: {0}")]
  Eval(String),
  #[error("script execution exceeded its time budget")]
  Timeout,
  #[error("event has no compiled artifact configured")]
  MissingArtifact,
  #[error("failed to load native artifact {0}: {1}")]
  Load(String, String),
  #[error("native call failed: {0}")]
  NativeCall(String),
  #[error("malformed script output: {0}")]
  MalformedOutput(#[from] serde_json::Error),
}

/// Dispatches one event invocation to the backend its config declares.
/// Owned by the collection registry; cheap to clone (both backends hold
/// their state behind `Arc`/interior locks already).
#[derive(Clone)]
pub struct EventRuntime {
  interpreted: std::sync::Arc<InterpretedRuntime>,
  native: std::sync::Arc<NativeScriptRegistry>,
}

impl EventRuntime {
  pub fn new(script_timeout: Duration) -> Self {
    Self {
      interpreted: std::sync::Arc::new(InterpretedRuntime::new(script_timeout)),
      native: std::sync::Arc::new(NativeScriptRegistry::new()),
    }
  }

  pub async fn run(&self, config: &EventConfig, ctx: &mut EventContext) -> Result<(), ScriptError> {
    match config.language {
      ScriptLanguage::Interpreted => self.interpreted.run(&config.source, ctx).await,
      ScriptLanguage::Native => {
        let handle = config.compiled_handle.as_deref().unwrap_or(&config.source);
        if handle.is_empty() {
          return Err(ScriptError::MissingArtifact);
        }
        self.native.run(Path::new(handle), ctx).await
      }
    }
  }

  pub fn last_native_reload_error(&self, compiled_handle: &str) -> Option<String> {
    self.native.last_reload_error(Path::new(compiled_handle))
  }
}
