//! Record store for corrections.
//!
//! The pipeline only needs create / get / partial update / delete. `MemoryStore`
//! keeps everything behind a `tokio::sync::RwLock`; a database-backed store
//! would implement the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{Correction, CorrectionPatch, CorrectionStatus, NewCorrection};
use crate::error::StoreError;

#[async_trait]
pub trait RecordStore: Send + Sync {
  async fn create(&self, new: NewCorrection) -> Correction;
  async fn get_by_id(&self, id: u64) -> Option<Correction>;
  async fn get_by_uuid(&self, uuid: &str) -> Option<Correction>;
  /// Applies only the `Some` fields. `Ok(None)` when the record does not exist.
  async fn update(&self, id: u64, patch: CorrectionPatch) -> Result<Option<Correction>, StoreError>;
  async fn delete_by_uuid(&self, uuid: &str) -> bool;
  async fn list_by_user(&self, user_id: &str) -> Vec<Correction>;
}

pub struct MemoryStore {
  by_id: RwLock<HashMap<u64, Correction>>,
  next_id: AtomicU64,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self { by_id: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

fn apply(record: &mut Correction, patch: CorrectionPatch) -> Result<(), StoreError> {
  if let Some(next) = patch.status {
    if !record.status.can_advance_to(next) {
      return Err(StoreError::StatusRegression { from: record.status, to: next });
    }
    record.status = next;
  }
  if let Some(title) = patch.title { record.title = title; }
  if let Some(icon) = patch.icon { record.icon = icon; }
  if let Some(content) = patch.content { record.content = content; }
  if let Some(score) = patch.score { record.score = Some(score); }
  if patch.clear_error { record.error = None; }
  if let Some(error) = patch.error { record.error = Some(error); }
  if let Some(public) = patch.public { record.public = public; }
  record.updated_at = Utc::now();
  Ok(())
}

#[async_trait]
impl RecordStore for MemoryStore {
  #[instrument(level = "debug", skip(self, new), fields(user_id = %new.user_id))]
  async fn create(&self, new: NewCorrection) -> Correction {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now();
    let record = Correction {
      id,
      uuid: Uuid::new_v4().to_string(),
      user_id: new.user_id,
      title: String::new(),
      icon: String::new(),
      model: new.model,
      tone: new.tone,
      kind: new.kind,
      batch_id: new.batch_id,
      public: new.public,
      prompt: new.prompt,
      essay: new.essay,
      content: String::new(),
      score: None,
      status: CorrectionStatus::Pending,
      error: None,
      created_at: now,
      updated_at: now,
    };
    self.by_id.write().await.insert(id, record.clone());
    debug!(id, uuid = %record.uuid, "Correction created");
    record
  }

  async fn get_by_id(&self, id: u64) -> Option<Correction> {
    self.by_id.read().await.get(&id).cloned()
  }

  async fn get_by_uuid(&self, uuid: &str) -> Option<Correction> {
    self.by_id.read().await.values().find(|c| c.uuid == uuid).cloned()
  }

  #[instrument(level = "debug", skip(self, patch))]
  async fn update(&self, id: u64, patch: CorrectionPatch) -> Result<Option<Correction>, StoreError> {
    let mut guard = self.by_id.write().await;
    let Some(record) = guard.get_mut(&id) else { return Ok(None) };
    apply(record, patch)?;
    Ok(Some(record.clone()))
  }

  async fn delete_by_uuid(&self, uuid: &str) -> bool {
    let mut guard = self.by_id.write().await;
    let id = guard.values().find(|c| c.uuid == uuid).map(|c| c.id);
    match id {
      Some(id) => guard.remove(&id).is_some(),
      None => false,
    }
  }

  async fn list_by_user(&self, user_id: &str) -> Vec<Correction> {
    let mut out: Vec<Correction> = self.by_id.read().await
      .values()
      .filter(|c| c.user_id == user_id)
      .cloned()
      .collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{CorrectionKind, Tone};

  fn new_job(user: &str) -> NewCorrection {
    NewCorrection {
      user_id: user.into(),
      model: "gpt-4o".into(),
      tone: Tone::Neutral,
      kind: CorrectionKind::Single,
      batch_id: None,
      public: false,
      prompt: "续写故事".into(),
      essay: "Then I opened the door.".into(),
    }
  }

  #[tokio::test]
  async fn create_starts_pending_and_empty() {
    let store = MemoryStore::new();
    let c = store.create(new_job("alice")).await;
    assert_eq!(c.status, CorrectionStatus::Pending);
    assert!(c.content.is_empty());
    assert_eq!(store.get_by_uuid(&c.uuid).await.unwrap().id, c.id);
    assert_eq!(store.get_by_id(c.id).await.unwrap().uuid, c.uuid);
  }

  #[tokio::test]
  async fn partial_update_leaves_other_fields() {
    let store = MemoryStore::new();
    let c = store.create(new_job("alice")).await;
    store.update(c.id, CorrectionPatch { title: Some("标题".into()), ..Default::default() }).await.unwrap();
    let after = store
      .update(c.id, CorrectionPatch { score: Some(12.5), ..Default::default() })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(after.title, "标题");
    assert_eq!(after.score, Some(12.5));
    assert_eq!(after.essay, c.essay);
  }

  #[tokio::test]
  async fn status_regression_is_rejected() {
    let store = MemoryStore::new();
    let c = store.create(new_job("alice")).await;
    let patch = |s| CorrectionPatch { status: Some(s), ..Default::default() };
    store.update(c.id, patch(CorrectionStatus::GenerateUpgradation)).await.unwrap();
    let err = store.update(c.id, patch(CorrectionStatus::GenerateScore)).await.unwrap_err();
    assert!(matches!(err, StoreError::StatusRegression { .. }));
    assert_eq!(store.get_by_id(c.id).await.unwrap().status, CorrectionStatus::GenerateUpgradation);
  }

  #[tokio::test]
  async fn clear_error_drops_recorded_failure() {
    let store = MemoryStore::new();
    let c = store.create(new_job("alice")).await;
    store.update(c.id, CorrectionPatch { error: Some("boom".into()), ..Default::default() }).await.unwrap();
    let after = store
      .update(c.id, CorrectionPatch { clear_error: true, ..Default::default() })
      .await
      .unwrap()
      .unwrap();
    assert!(after.error.is_none());
  }

  #[tokio::test]
  async fn update_missing_is_none_and_delete_reports() {
    let store = MemoryStore::new();
    assert!(store.update(42, CorrectionPatch::default()).await.unwrap().is_none());
    let c = store.create(new_job("alice")).await;
    assert!(store.delete_by_uuid(&c.uuid).await);
    assert!(!store.delete_by_uuid(&c.uuid).await);
  }

  #[tokio::test]
  async fn list_is_scoped_to_user() {
    let store = MemoryStore::new();
    store.create(new_job("alice")).await;
    store.create(new_job("bob")).await;
    store.create(new_job("alice")).await;
    assert_eq!(store.list_by_user("alice").await.len(), 2);
    assert_eq!(store.list_by_user("carol").await.len(), 0);
  }
}
