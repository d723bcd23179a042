use serde::{Deserialize, Serialize};

/// The already-resolved caller identity. Authentication itself (session
/// storage, master-key checks) lives outside the core; the pipeline only
/// ever sees this resolved shape, or `None` for an anonymous request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
  pub id: String,
  pub username: String,
  #[serde(rename = "isRoot")]
  pub is_root: bool,
}

impl Principal {
  pub fn root(id: impl Into<String>, username: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      username: username.into(),
      is_root: true,
    }
  }

  pub fn user(id: impl Into<String>, username: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      username: username.into(),
      is_root: false,
    }
  }
}
