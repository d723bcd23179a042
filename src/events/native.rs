//! Native hot-reload script backend (spec.md §4.7/§9). Each collection's
//! compiled artifact is a `cdylib` the operator builds out-of-process and
//! drops at `compiledHandle`; this registry watches that path's mtime
//! with `notify`, reloads it with `libloading` on change, and swaps the
//! pointer under a `parking_lot::RwLock` so in-flight calls keep running
//! against the handle they acquired on entry. A failed rebuild leaves
//! the last-good artifact installed and records a `ReloadError`.
//!
//! ABI: the artifact exports `sqrl_event_run(ctx_json: *const c_char) ->
//! *mut c_char`, taking the same JSON shape the interpreted backend's
//! harness parses and returning either `null` (fatal failure) or a JSON
//! `ScriptOutput` string that must be freed with `sqrl_event_free`. This
//! keeps the ABI dialect-free: scripts never see Rust types directly.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::SystemTime;

use libloading::{Library, Symbol};
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use super::context::{EventContext, ScriptOutput};
use super::ScriptError;

type RunFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);

struct Artifact {
  library: Library,
  mtime: SystemTime,
}

// The artifact is only ever dereferenced through `Registry::run`, which
// looks up the exported symbols fresh on each call; nothing here assumes
// a particular calling thread.
unsafe impl Send for Artifact {}
unsafe impl Sync for Artifact {}

struct Slot {
  artifact: RwLock<Arc<Artifact>>,
  last_reload_error: RwLock<Option<String>>,
}

/// Process-wide registry of loaded native event artifacts, keyed by
/// path. One `notify` watcher per watched directory marks slots dirty;
/// the actual reload happens lazily on the next call so a burst of
/// filesystem events never triggers more than one reload per miss.
pub struct NativeScriptRegistry {
  slots: RwLock<HashMap<PathBuf, Arc<Slot>>>,
  watcher: Option<Mutex<notify::RecommendedWatcher>>,
  dirty: Arc<RwLock<std::collections::HashSet<PathBuf>>>,
}

impl NativeScriptRegistry {
  pub fn new() -> Self {
    let dirty = Arc::new(RwLock::new(std::collections::HashSet::new()));
    let dirty_for_watcher = dirty.clone();
    let (tx, rx) = mpsc::channel();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
      let _ = tx.send(res);
    })
    .ok()
    .map(Mutex::new);

    if watcher.is_some() {
      let dirty = dirty_for_watcher;
      std::thread::spawn(move || {
        while let Ok(Ok(event)) = rx.recv() {
          for path in event.paths {
            dirty.write().insert(path);
          }
        }
      });
    }

    Self {
      slots: RwLock::new(HashMap::new()),
      watcher,
      dirty,
    }
  }

  fn mark_watched(&self, path: &Path) {
    if let Some(watcher) = self.watcher.as_ref() {
      // Errors here (e.g. a path that doesn't exist yet) only mean
      // reload falls back to the per-call mtime check in `maybe_reload`.
      let _ = watcher.lock().watch(path, RecursiveMode::NonRecursive);
    }
  }

  async fn slot_for(&self, path: &Path) -> Result<Arc<Slot>, ScriptError> {
    if let Some(slot) = self.slots.read().get(path) {
      return Ok(slot.clone());
    }
    let path_owned = path.to_path_buf();
    let artifact = load_artifact(&path_owned).await?;
    let slot = Arc::new(Slot {
      artifact: RwLock::new(Arc::new(artifact)),
      last_reload_error: RwLock::new(None),
    });
    self.mark_watched(path);
    self.slots.write().insert(path_owned, slot.clone());
    Ok(slot)
  }

  /// Reload `path` if its mtime has advanced or `notify` flagged it
  /// dirty since the last load; a failed rebuild keeps the prior
  /// artifact and records the error for admin visibility.
  async fn maybe_reload(&self, path: &Path, slot: &Slot) {
    let flagged = self.dirty.write().remove(path);
    let current_mtime = tokio::fs::metadata(path).await.ok().and_then(|m| m.modified().ok());
    let needs_check = flagged || current_mtime.map(|m| m > slot_mtime(slot)).unwrap_or(false);
    if !needs_check {
      return;
    }
    match load_artifact(&path.to_path_buf()).await {
      Ok(fresh) => {
        *slot.artifact.write() = Arc::new(fresh);
        *slot.last_reload_error.write() = None;
      }
      Err(e) => {
        tracing::warn!(path = %path.display(), error = %e, "native script reload failed, keeping previous artifact");
        *slot.last_reload_error.write() = Some(e.to_string());
      }
    }
  }

  pub async fn run(&self, path: &Path, ctx: &mut EventContext) -> Result<(), ScriptError> {
    let slot = self.slot_for(path).await?;
    self.maybe_reload(path, &slot).await;
    let artifact = slot.artifact.read().clone();

    let input = ctx.to_script_input().to_string();
    let output = tokio::task::spawn_blocking(move || call_artifact(&artifact, &input))
      .await
      .map_err(|e| ScriptError::NativeCall(format!("native call panicked: {e}")))??;

    ctx.apply_script_output(output);
    Ok(())
  }

  pub fn last_reload_error(&self, path: &Path) -> Option<String> {
    self.slots.read().get(path).and_then(|s| s.last_reload_error.read().clone())
  }
}

impl Default for NativeScriptRegistry {
  fn default() -> Self {
    Self::new()
  }
}

fn slot_mtime(slot: &Slot) -> SystemTime {
  slot.artifact.read().mtime
}

async fn load_artifact(path: &PathBuf) -> Result<Artifact, ScriptError> {
  let path = path.clone();
  tokio::task::spawn_blocking(move || {
    let mtime = std::fs::metadata(&path)
      .and_then(|m| m.modified())
      .map_err(|e| ScriptError::Load(path.display().to_string(), e.to_string()))?;
    let library = unsafe { Library::new(&path) }.map_err(|e| ScriptError::Load(path.display().to_string(), e.to_string()))?;
    // Probe the entry point eagerly so a malformed artifact fails at
    // load time, not on the first request.
    unsafe {
      let _sym: Symbol<RunFn> = library
        .get(b"sqrl_event_run\0")
        .map_err(|e| ScriptError::Load(path.display().to_string(), e.to_string()))?;
    }
    Ok(Artifact { library, mtime })
  })
  .await
  .map_err(|e| ScriptError::Load(path.display().to_string(), e.to_string()))?
}

fn call_artifact(artifact: &Artifact, input_json: &str) -> Result<ScriptOutput, ScriptError> {
  let input = CString::new(input_json).map_err(|e| ScriptError::NativeCall(e.to_string()))?;
  unsafe {
    let run: Symbol<RunFn> = artifact
      .library
      .get(b"sqrl_event_run\0")
      .map_err(|e| ScriptError::NativeCall(e.to_string()))?;
    let raw = run(input.as_ptr());
    if raw.is_null() {
      return Err(ScriptError::NativeCall("native script returned null".to_string()));
    }
    let json = CStr::from_ptr(raw).to_string_lossy().into_owned();
    if let Ok(free) = artifact.library.get::<FreeFn>(b"sqrl_event_free\0") {
      free(raw);
    }
    Ok(serde_json::from_str(&json)?)
  }
}
