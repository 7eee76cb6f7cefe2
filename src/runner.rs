//! Background execution of pipeline jobs.
//!
//! Submissions return as soon as the task is spawned; clients poll the
//! progress endpoint. Batch entries run one after another in a single task,
//! each as its own job.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct JobRunner {
  pipeline: Arc<Pipeline>,
}

impl JobRunner {
  pub fn new(pipeline: Arc<Pipeline>) -> Self {
    Self { pipeline }
  }

  /// Spawn the pipeline for one correction.
  pub fn submit(&self, id: u64) -> JoinHandle<()> {
    let pipeline = self.pipeline.clone();
    let span = tracing::info_span!(target: "pipeline", "job", id);
    tokio::spawn(
      async move {
        if let Err(e) = pipeline.run(id).await {
          warn!(target: "pipeline", error = %e, "job ended with error");
        }
      }
      .instrument(span),
    )
  }

  /// Spawn one task that runs every id in order. A failed essay does not
  /// stop the rest of the batch.
  pub fn submit_batch(&self, ids: Vec<u64>) -> JoinHandle<()> {
    let pipeline = self.pipeline.clone();
    let span = tracing::info_span!(target: "pipeline", "batch", size = ids.len());
    tokio::spawn(
      async move {
        let total = ids.len();
        let mut failed = 0usize;
        for id in ids {
          if let Err(e) = pipeline.run(id).await {
            failed += 1;
            warn!(target: "pipeline", id, error = %e, "batch entry failed; continuing");
          }
        }
        info!(target: "pipeline", total, failed, "batch finished");
      }
      .instrument(span),
    )
  }
}
