//! Public HTTP request/response bodies (serde ready).
//! Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::domain::{Correction, CorrectionKind, CorrectionStatus, Tone};

/// Body of `POST /api/v1/corrections`. Exactly one of `essay` / `essays`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIn {
  pub prompt: String,
  #[serde(default)]
  pub essay: Option<String>,
  #[serde(default)]
  pub essays: Option<Vec<String>>,
  #[serde(default)]
  pub tone: Option<Tone>,
  #[serde(default)]
  pub model: Option<String>,
  #[serde(default)]
  pub public: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOut {
  pub uuids: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionOut {
  pub uuid: String,
  pub title: String,
  pub icon: String,
  pub model: String,
  pub tone: Tone,
  pub kind: CorrectionKind,
  pub batch_id: Option<String>,
  pub public: bool,
  pub prompt: String,
  pub essay: String,
  pub content: String,
  pub score: Option<f64>,
  pub status: CorrectionStatus,
  pub error: Option<String>,
  pub created_at: String,
  pub updated_at: String,
}

/// Listing rows leave out the essay and the report body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionSummaryOut {
  pub uuid: String,
  pub title: String,
  pub icon: String,
  pub kind: CorrectionKind,
  pub batch_id: Option<String>,
  pub public: bool,
  pub score: Option<f64>,
  pub status: CorrectionStatus,
  pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressOut {
  pub status: CorrectionStatus,
  /// No further change is coming; clients stop polling.
  pub done: bool,
  pub percent: u8,
  pub label: String,
  pub score: Option<f64>,
  pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityIn {
  pub public: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuoteOut {
  pub text: String,
  pub source: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthOut {
  pub ok: bool,
  pub llm: bool,
}

pub fn to_out(c: &Correction) -> CorrectionOut {
  CorrectionOut {
    uuid: c.uuid.clone(),
    title: c.title.clone(),
    icon: c.icon.clone(),
    model: c.model.clone(),
    tone: c.tone,
    kind: c.kind,
    batch_id: c.batch_id.clone(),
    public: c.public,
    prompt: c.prompt.clone(),
    essay: c.essay.clone(),
    content: c.content.clone(),
    score: c.score,
    status: c.reported_status(),
    error: c.error.clone(),
    created_at: c.created_at.to_rfc3339(),
    updated_at: c.updated_at.to_rfc3339(),
  }
}

pub fn to_summary(c: &Correction) -> CorrectionSummaryOut {
  CorrectionSummaryOut {
    uuid: c.uuid.clone(),
    title: c.title.clone(),
    icon: c.icon.clone(),
    kind: c.kind,
    batch_id: c.batch_id.clone(),
    public: c.public,
    score: c.score,
    status: c.reported_status(),
    created_at: c.created_at.to_rfc3339(),
  }
}

pub fn to_progress(c: &Correction) -> ProgressOut {
  let p = c.progress();
  ProgressOut {
    status: c.reported_status(),
    done: c.is_terminal(),
    percent: p.percent,
    label: p.label.to_string(),
    score: c.score,
    error: c.error.clone(),
  }
}
