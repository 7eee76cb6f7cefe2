//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! The caller is identified by the `x-user-id` header set by the auth proxy.

use std::sync::Arc;
use axum::{extract::{Path, State}, http::{HeaderMap, StatusCode}, Json, response::IntoResponse};
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::logic::*;
use crate::protocol::*;
use crate::state::AppState;

const USER_HEADER: &str = "x-user-id";

fn caller(headers: &HeaderMap) -> Option<String> {
  headers
    .get(USER_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
}

fn require_caller(headers: &HeaderMap) -> Result<String, ApiError> {
  caller(headers).ok_or(ApiError::Unauthorized)
}

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, llm: state.provider.is_some() })
}

#[instrument(level = "info", skip(state, headers, body), fields(essays = body.essays.as_ref().map_or(1, Vec::len)))]
pub async fn http_post_corrections(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  Json(body): Json<SubmitIn>,
) -> Result<impl IntoResponse, ApiError> {
  let user_id = require_caller(&headers)?;
  let out = submit_corrections(&state, &user_id, body).await?;
  info!(target: "inkcraft_backend", %user_id, count = out.uuids.len(), "HTTP corrections submitted");
  Ok((StatusCode::ACCEPTED, Json(out)))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_list_corrections(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
  let user_id = require_caller(&headers)?;
  let rows: Vec<CorrectionSummaryOut> = state.store.list_by_user(&user_id).await.iter().map(to_summary).collect();
  Ok(Json(rows))
}

#[instrument(level = "info", skip(state, headers), fields(%uuid))]
pub async fn http_get_correction(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  Path(uuid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
  let c = get_visible(&state, &uuid, caller(&headers).as_deref()).await?;
  Ok(Json(to_out(&c)))
}

#[instrument(level = "debug", skip(state, headers), fields(%uuid))]
pub async fn http_get_progress(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  Path(uuid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
  let c = get_visible(&state, &uuid, caller(&headers).as_deref()).await?;
  Ok(Json(to_progress(&c)))
}

#[instrument(level = "info", skip(state, headers, body), fields(%uuid, public = body.public))]
pub async fn http_patch_visibility(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  Path(uuid): Path<String>,
  Json(body): Json<VisibilityIn>,
) -> Result<impl IntoResponse, ApiError> {
  let user_id = require_caller(&headers)?;
  let c = set_visibility(&state, &uuid, &user_id, body.public).await?;
  Ok(Json(to_out(&c)))
}

#[instrument(level = "info", skip(state, headers), fields(%uuid))]
pub async fn http_delete_correction(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  Path(uuid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
  let user_id = require_caller(&headers)?;
  delete_owned(&state, &uuid, &user_id).await?;
  info!(target: "inkcraft_backend", %uuid, %user_id, "HTTP correction deleted");
  Ok(StatusCode::NO_CONTENT)
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_quote(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(daily_quote(&state).await)
}
