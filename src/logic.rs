//! Core behaviors behind the HTTP handlers.
//!
//! This includes:
//!   - Creating corrections (single or batch) and handing them to the runner
//!   - Visibility and ownership checks for reads and mutations
//!   - The daily writing quote (cached, with a built-in fallback)

use rand::seq::SliceRandom;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Correction, CorrectionKind, CorrectionPatch, NewCorrection};
use crate::error::ApiError;
use crate::llm::{ChatRequest, Sampling};
use crate::protocol::{QuoteOut, SubmitIn, SubmitOut};
use crate::state::AppState;
use crate::util::trunc_for_log;

const FALLBACK_QUOTES: &[&str] = &[
  "There is no greater agony than bearing an untold story inside you. —— Maya Angelou（心中藏着未讲的故事，是最大的痛苦。）",
  "Start writing, no matter what. The water does not flow until the faucet is turned on. —— Louis L'Amour（无论如何，先动笔。）",
  "You can always edit a bad page. You can't edit a blank page. —— Jodi Picoult（烂稿可以修改，白纸无从下手。）",
  "Easy reading is damn hard writing. —— Nathaniel Hawthorne（读来轻松，写来艰辛。）",
  "The first draft is just you telling yourself the story. —— Terry Pratchett（初稿只是讲给自己听的故事。）",
];

/// Validate the body, create the records, and start grading in the background.
#[instrument(level = "info", skip(state, body), fields(%user_id, prompt_len = body.prompt.len()))]
pub async fn submit_corrections(state: &AppState, user_id: &str, body: SubmitIn) -> Result<SubmitOut, ApiError> {
  let prompt = body.prompt.trim();
  if prompt.is_empty() {
    return Err(ApiError::BadRequest("prompt must not be empty".into()));
  }
  let is_batch = body.essays.is_some();
  let essays = match (body.essay, body.essays) {
    (Some(essay), None) => vec![essay],
    (None, Some(essays)) if !essays.is_empty() => essays,
    (None, Some(_)) => return Err(ApiError::BadRequest("essays must not be empty".into())),
    (Some(_), Some(_)) => return Err(ApiError::BadRequest("send either essay or essays, not both".into())),
    (None, None) => return Err(ApiError::BadRequest("essay is required".into())),
  };
  if essays.iter().any(|e| e.trim().is_empty()) {
    return Err(ApiError::BadRequest("essay must not be empty".into()));
  }

  let runner = state.runner().map_err(|e| ApiError::Unavailable(e.to_string()))?;
  let model = state.settings.resolve_model(body.model.as_deref());
  let (kind, batch_id) = if is_batch {
    (CorrectionKind::Batch, Some(Uuid::new_v4().to_string()))
  } else {
    (CorrectionKind::Single, None)
  };

  let mut created: Vec<Correction> = Vec::with_capacity(essays.len());
  for essay in essays {
    let record = state
      .store
      .create(NewCorrection {
        user_id: user_id.to_string(),
        model: model.clone(),
        tone: body.tone.unwrap_or_default(),
        kind,
        batch_id: batch_id.clone(),
        public: body.public,
        prompt: prompt.to_string(),
        essay: essay.trim().to_string(),
      })
      .await;
    info!(target: "inkcraft_backend", uuid = %record.uuid, %model, essay = %trunc_for_log(&record.essay, 40), "Correction queued");
    created.push(record);
  }

  match kind {
    CorrectionKind::Single => {
      for c in &created {
        runner.submit(c.id);
      }
    }
    CorrectionKind::Batch => {
      runner.submit_batch(created.iter().map(|c| c.id).collect());
    }
  }

  Ok(SubmitOut { uuids: created.into_iter().map(|c| c.uuid).collect(), batch_id })
}

/// Record by uuid if the caller may see it. Hidden records read as missing.
#[instrument(level = "debug", skip(state))]
pub async fn get_visible(state: &AppState, uuid: &str, user_id: Option<&str>) -> Result<Correction, ApiError> {
  match state.store.get_by_uuid(uuid).await {
    Some(c) if c.visible_to(user_id) => Ok(c),
    _ => Err(ApiError::NotFound),
  }
}

async fn get_owned(state: &AppState, uuid: &str, user_id: &str) -> Result<Correction, ApiError> {
  let c = state.store.get_by_uuid(uuid).await.ok_or(ApiError::NotFound)?;
  if !c.is_owned_by(user_id) {
    warn!(target: "inkcraft_backend", %uuid, %user_id, "Rejected mutation by non-owner");
    return Err(ApiError::Forbidden);
  }
  Ok(c)
}

#[instrument(level = "info", skip(state))]
pub async fn set_visibility(state: &AppState, uuid: &str, user_id: &str, public: bool) -> Result<Correction, ApiError> {
  let c = get_owned(state, uuid, user_id).await?;
  state
    .store
    .update(c.id, CorrectionPatch { public: Some(public), ..Default::default() })
    .await?
    .ok_or(ApiError::NotFound)
}

#[instrument(level = "info", skip(state))]
pub async fn delete_owned(state: &AppState, uuid: &str, user_id: &str) -> Result<(), ApiError> {
  get_owned(state, uuid, user_id).await?;
  if state.store.delete_by_uuid(uuid).await { Ok(()) } else { Err(ApiError::NotFound) }
}

/// Today's quote: cached model output, else a fresh one, else a built-in line.
#[instrument(level = "info", skip(state))]
pub async fn daily_quote(state: &AppState) -> QuoteOut {
  if let Some(text) = state.quote_cache.get().await {
    return QuoteOut { text, source: "cache".into() };
  }

  if let Some(provider) = &state.provider {
    let req = ChatRequest::new(
      state.settings.fast_model.as_str(),
      state.prompts.quote_system.as_str(),
      "请给出今天的写作名言。",
      Sampling { max_tokens: Some(160), temperature: 0.9, top_p: None },
    );
    match provider.complete(req).await {
      Ok(text) => {
        let text = text.trim().to_string();
        state.quote_cache.put(text.clone()).await;
        return QuoteOut { text, source: "model".into() };
      }
      Err(e) => error!(target: "inkcraft_backend", error = %e, "Quote generation failed; serving built-in quote"),
    }
  }

  let text = FALLBACK_QUOTES.choose(&mut rand::thread_rng()).copied().unwrap_or_default();
  QuoteOut { text: text.to_string(), source: "builtin".into() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use crate::config::AppConfig;
  use crate::llm::testing::{MockProvider, Reply};
  use crate::progress::LogSink;
  use crate::store::MemoryStore;

  fn state_with(replies: Option<Vec<Reply>>) -> AppState {
    let provider = replies.map(|r| Arc::new(MockProvider::new(r)) as Arc<dyn crate::llm::ChatProvider>);
    AppState::from_parts(AppConfig::default(), Arc::new(MemoryStore::new()), provider, Arc::new(LogSink))
  }

  fn body(essay: Option<&str>, essays: Option<Vec<&str>>) -> SubmitIn {
    SubmitIn {
      prompt: "续写：The door creaked open.".into(),
      essay: essay.map(Into::into),
      essays: essays.map(|v| v.into_iter().map(Into::into).collect()),
      tone: None,
      model: Some("not-allowed".into()),
      public: false,
    }
  }

  #[tokio::test]
  async fn offline_submission_is_unavailable_but_reads_work() {
    let state = state_with(None);
    let err = submit_corrections(&state, "alice", body(Some("I ran."), None)).await.unwrap_err();
    assert!(matches!(err, ApiError::Unavailable(_)));
    assert!(matches!(get_visible(&state, "nope", Some("alice")).await, Err(ApiError::NotFound)));
  }

  #[tokio::test]
  async fn malformed_bodies_are_rejected() {
    let state = state_with(Some(vec![]));
    for b in [body(None, None), body(Some("x"), Some(vec!["y"])), body(None, Some(vec![])), body(Some("  "), None)] {
      let err = submit_corrections(&state, "alice", b).await.unwrap_err();
      assert!(matches!(err, ApiError::BadRequest(_)));
    }
  }

  #[tokio::test]
  async fn batch_shares_id_and_uses_default_model() {
    let state = state_with(Some(vec![]));
    let out = submit_corrections(&state, "alice", body(None, Some(vec!["One.", "Two."]))).await.unwrap();
    assert_eq!(out.uuids.len(), 2);
    let batch = out.batch_id.clone().unwrap();
    for uuid in &out.uuids {
      let c = state.store.get_by_uuid(uuid).await.unwrap();
      assert_eq!(c.kind, CorrectionKind::Batch);
      assert_eq!(c.batch_id.as_deref(), Some(batch.as_str()));
      assert_eq!(c.model, state.settings.strong_model);
    }
  }

  #[tokio::test]
  async fn only_owner_mutates() {
    let state = state_with(Some(vec![]));
    let out = submit_corrections(&state, "alice", body(Some("I ran."), None)).await.unwrap();
    let uuid = &out.uuids[0];

    assert!(matches!(get_visible(&state, uuid, Some("bob")).await, Err(ApiError::NotFound)));
    assert!(matches!(set_visibility(&state, uuid, "bob", true).await, Err(ApiError::Forbidden)));
    assert!(matches!(delete_owned(&state, uuid, "bob").await, Err(ApiError::Forbidden)));

    let shared = set_visibility(&state, uuid, "alice", true).await.unwrap();
    assert!(shared.public);
    assert!(get_visible(&state, uuid, None).await.is_ok());

    delete_owned(&state, uuid, "alice").await.unwrap();
    assert!(matches!(delete_owned(&state, uuid, "alice").await, Err(ApiError::NotFound)));
  }

  #[tokio::test]
  async fn quote_is_cached_after_first_generation() {
    let state = state_with(Some(vec![Reply::Text(" Write drunk, edit sober. ".into())]));
    let first = daily_quote(&state).await;
    assert_eq!((first.text.as_str(), first.source.as_str()), ("Write drunk, edit sober.", "model"));
    let second = daily_quote(&state).await;
    assert_eq!(second.source, "cache");
    assert_eq!(second.text, first.text);
  }

  #[tokio::test]
  async fn quote_falls_back_to_builtin_list() {
    let state = state_with(Some(vec![Reply::Fail("down".into())]));
    let q = daily_quote(&state).await;
    assert_eq!(q.source, "builtin");
    assert!(FALLBACK_QUOTES.contains(&q.text.as_str()));
    assert!(state.quote_cache.get().await.is_none());
  }
}
