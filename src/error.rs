//! Error kinds that cross the pipeline/HTTP boundary (spec.md §7).
//!
//! Internal code favours `anyhow::Error` with `?` wherever the error is
//! only ever logged or wrapped again. `PipelineError` exists at the one
//! seam that needs a deterministic, exhaustive mapping to an HTTP
//! status: the collection pipeline's outer response.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  /// Accumulated `error(field, message)` calls from event scripts; never
  /// short-circuits on its own, so every field error for one request is
  /// collected before this is raised.
  #[error("validation failed")]
  Validation(BTreeMap<String, String>),

  /// An event called `cancel(message, statusCode)`.
  #[error("{message}")]
  Cancelled { message: String, status: u16 },

  /// `beforerequest` cancelled with 401/403.
  #[error("{message}")]
  Auth { message: String, status: u16 },

  #[error("not found")]
  NotFound,

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("storage error: {0}")]
  Storage(#[from] crate::db::StorageError),

  #[error("script error: {0}")]
  Script(#[from] crate::events::ScriptError),
}

impl PipelineError {
  pub fn cancel(message: impl Into<String>, status: u16) -> Self {
    Self::Cancelled {
      message: message.into(),
      status,
    }
  }
}

impl IntoResponse for PipelineError {
  fn into_response(self) -> Response {
    let (status, body) = match self {
      PipelineError::Validation(errors) => (
        StatusCode::BAD_REQUEST,
        json!({"errors": errors}),
      ),
      PipelineError::Cancelled { message, status } => (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        json!({"message": message}),
      ),
      PipelineError::Auth { message, status } => (
        StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN),
        json!({"message": message}),
      ),
      PipelineError::NotFound => (StatusCode::NOT_FOUND, json!({"message": "not found"})),
      PipelineError::Conflict(message) => (StatusCode::CONFLICT, json!({"message": message})),
      PipelineError::Storage(err) => {
        tracing::error!(error = %err, "storage error");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          json!({"message": "internal error"}),
        )
      }
      PipelineError::Script(err) => {
        tracing::error!(error = %err, "script error");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          json!({"message": "internal error"}),
        )
      }
    };
    (status, axum::Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn validation_maps_to_400() {
    let mut errors = BTreeMap::new();
    errors.insert("title".to_string(), "required".to_string());
    let resp = PipelineError::Validation(errors).into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  }

  #[test]
  fn not_found_maps_to_404() {
    let resp = PipelineError::NotFound.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
  }

  #[test]
  fn cancel_uses_caller_supplied_status() {
    let resp = PipelineError::cancel("protected", 403).into_response();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
  }
}
