//! Error types for the provider, the record store, the pipeline and the HTTP surface.
//!
//! Malformed model output has no variant here: it is repaired or scored as
//! zero, never surfaced as an error.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::domain::CorrectionStatus;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
  #[error("HTTP request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("OpenAI HTTP {status}: {message}")]
  Upstream { status: u16, message: String },

  #[error("could not decode model response: {0}")]
  Decode(String),

  #[error("empty response from model")]
  EmptyResponse,

  #[error("no chat provider configured")]
  NotConfigured,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("record {0} not found")]
  NotFound(String),

  #[error("status cannot move from {from} back to {to}")]
  StatusRegression { from: CorrectionStatus, to: CorrectionStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error("stage {stage} failed: {source}")]
  Model {
    stage: CorrectionStatus,
    #[source]
    source: LlmError,
  },

  #[error("stage {stage} could not persist: {source}")]
  Store {
    stage: CorrectionStatus,
    #[source]
    source: StoreError,
  },
}

impl PipelineError {
  pub fn stage(&self) -> CorrectionStatus {
    match self {
      PipelineError::Model { stage, .. } | PipelineError::Store { stage, .. } => *stage,
    }
  }
}

/// Errors returned by HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),

  #[error("missing x-user-id header")]
  Unauthorized,

  #[error("not the owner of this correction")]
  Forbidden,

  #[error("correction not found")]
  NotFound,

  #[error("grading is unavailable: {0}")]
  Unavailable(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> axum::response::Response {
    let status = match &self {
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::Forbidden => StatusCode::FORBIDDEN,
      ApiError::NotFound | ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
      ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}
