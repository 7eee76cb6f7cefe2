//! Orchestration of the generation stages for one correction.
//!
//! Stages run strictly in sequence. After each stage its output and the new
//! status are written in a single store update, so the status column always
//! names the last stage whose result is durable. A failing stage records the
//! error and stops the job; the status is never moved backwards and nothing
//! is retried. Running a job twice appends its sections twice.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::config::{PipelineSettings, Prompts};
use crate::domain::{Correction, CorrectionPatch, CorrectionStatus};
use crate::error::{LlmError, PipelineError, StoreError};
use crate::llm::ChatProvider;
use crate::progress::{PipelineEvent, ProgressSink};
use crate::stages::{self, StageContext};
use crate::store::RecordStore;

/// Output of one stage, folded into the record.
#[derive(Debug, Default)]
struct StageOutput {
  append: Option<String>,
  score: Option<f64>,
  title: Option<String>,
  icon: Option<String>,
}

pub struct Pipeline {
  provider: Arc<dyn ChatProvider>,
  store: Arc<dyn RecordStore>,
  prompts: Arc<Prompts>,
  settings: Arc<PipelineSettings>,
  sink: Arc<dyn ProgressSink>,
}

impl Pipeline {
  pub fn new(
    provider: Arc<dyn ChatProvider>,
    store: Arc<dyn RecordStore>,
    prompts: Arc<Prompts>,
    settings: Arc<PipelineSettings>,
    sink: Arc<dyn ProgressSink>,
  ) -> Self {
    Self { provider, store, prompts, settings, sink }
  }

  /// Run every stage for the correction `id`, returning the final record.
  #[instrument(level = "info", skip(self))]
  pub async fn run(&self, id: u64) -> Result<Correction, PipelineError> {
    let mut job = self.load(id, CorrectionStatus::Pending).await?;
    if job.error.is_some() {
      job = self.store
        .update(id, CorrectionPatch { clear_error: true, ..Default::default() })
        .await
        .map_err(|source| PipelineError::Store { stage: job.status, source })?
        .unwrap_or(job);
    }
    info!(target: "pipeline", uuid = %job.uuid, model = %job.model, "job started");

    for stage in CorrectionStatus::STAGES {
      if let Err(e) = self.run_stage(&job, stage).await {
        self.record_failure(&job, &e).await;
        return Err(e);
      }
    }

    let done = self.persist(&job, CorrectionStatus::Success, StageOutput::default()).await?;
    info!(target: "pipeline", uuid = %done.uuid, score = ?done.score, "job finished");
    Ok(done)
  }

  async fn load(&self, id: u64, stage: CorrectionStatus) -> Result<Correction, PipelineError> {
    self.store
      .get_by_id(id)
      .await
      .ok_or_else(|| PipelineError::Store { stage, source: StoreError::NotFound(id.to_string()) })
  }

  async fn run_stage(&self, job: &Correction, stage: CorrectionStatus) -> Result<(), PipelineError> {
    self.sink.emit(PipelineEvent::StageStarted { uuid: job.uuid.clone(), stage });
    let ctx = StageContext {
      provider: self.provider.as_ref(),
      prompts: &self.prompts,
      settings: &self.settings,
      sink: self.sink.as_ref(),
    };

    let output = self.generate(&ctx, job, stage).await.map_err(|source| {
      self.sink.emit(PipelineEvent::Error { uuid: job.uuid.clone(), stage, message: source.to_string() });
      PipelineError::Model { stage, source }
    })?;

    self.persist(job, stage, output).await?;
    self.sink.emit(PipelineEvent::StageFinished { uuid: job.uuid.clone(), stage });
    Ok(())
  }

  async fn generate(&self, ctx: &StageContext<'_>, job: &Correction, stage: CorrectionStatus) -> Result<StageOutput, LlmError> {
    let output = match stage {
      CorrectionStatus::GenerateScore => {
        let out = stages::score_stage(ctx, job).await?;
        StageOutput { append: Some(out.markdown), score: Some(out.outcome.score), ..Default::default() }
      }
      CorrectionStatus::GenerateUpgradation => {
        StageOutput { append: Some(stages::upgrade_stage(ctx, job).await?), ..Default::default() }
      }
      CorrectionStatus::GeneratePureUpgradation => {
        StageOutput { append: Some(stages::pure_upgrade_stage(ctx, job).await?), ..Default::default() }
      }
      CorrectionStatus::GenerateTitle => {
        StageOutput { title: Some(stages::title_stage(ctx, job).await?), ..Default::default() }
      }
      CorrectionStatus::GenerateIcon => {
        StageOutput { icon: Some(stages::icon_stage(ctx, job).await?), ..Default::default() }
      }
      CorrectionStatus::Pending | CorrectionStatus::Success | CorrectionStatus::Failed => StageOutput::default(),
    };
    Ok(output)
  }

  /// One store write per stage: appended content, stage fields, and the status
  /// (unless the record is already further along, e.g. on a re-run).
  async fn persist(&self, job: &Correction, stage: CorrectionStatus, output: StageOutput) -> Result<Correction, PipelineError> {
    let current = self.load(job.id, stage).await?;
    let content = output
      .append
      .filter(|s| !s.trim().is_empty())
      .map(|section| {
        if current.content.is_empty() { section } else { format!("{}\n{}", current.content.trim_end(), section) }
      });
    let status = (current.status.rank() < stage.rank() && current.status.can_advance_to(stage)).then_some(stage);

    let patch = CorrectionPatch {
      content,
      score: output.score,
      title: output.title,
      icon: output.icon,
      status,
      ..Default::default()
    };
    self.store
      .update(job.id, patch)
      .await
      .map_err(|source| PipelineError::Store { stage, source })?
      .ok_or_else(|| PipelineError::Store { stage, source: StoreError::NotFound(job.uuid.clone()) })
  }

  async fn record_failure(&self, job: &Correction, err: &PipelineError) {
    error!(target: "pipeline", uuid = %job.uuid, stage = %err.stage(), error = %err, "job failed");
    if let PipelineError::Store { .. } = err {
      self.sink.emit(PipelineEvent::Error { uuid: job.uuid.clone(), stage: err.stage(), message: err.to_string() });
    }
    let patch = CorrectionPatch { error: Some(err.to_string()), ..Default::default() };
    if let Err(e) = self.store.update(job.id, patch).await {
      error!(target: "pipeline", uuid = %job.uuid, error = %e, "could not record job failure");
    }
  }
}
