//! Streaming progress: label detection over the growing response buffer,
//! pipeline events, and the sinks they are delivered to.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::CorrectionStatus;

/// Rubric categories the score prompt asks the model to emit, in prompt order.
pub const RUBRIC_LABELS: [&str; 9] = [
  "内容要点",
  "情节衔接",
  "逻辑连贯",
  "词汇丰富性",
  "语法准确性",
  "句式多样性",
  "篇章结构",
  "主题升华",
  "书写规范",
];

/// Top-level keys of the upgrade-suggestion JSON.
pub const UPGRADE_SECTIONS: [&str; 4] = [
  "writing_analysis",
  "vocabulary_upgrades",
  "sentence_upgrades",
  "style_suggestions",
];

/// Reports each label the first time it shows up in a growing buffer.
#[derive(Debug)]
pub struct SectionTracker {
  labels: Vec<&'static str>,
  seen: Vec<bool>,
  /// Byte offset up to which the buffer has been fully scanned.
  scanned: usize,
  longest: usize,
}

impl SectionTracker {
  pub fn new(labels: &[&'static str]) -> Self {
    let longest = labels.iter().map(|l| l.len()).max().unwrap_or(0);
    Self { labels: labels.to_vec(), seen: vec![false; labels.len()], scanned: 0, longest }
  }

  /// Labels appearing for the first time in `buffer`, ordered by position.
  ///
  /// `buffer` must be the same accumulated text on every call, only ever growing.
  pub fn observe(&mut self, buffer: &str) -> Vec<&'static str> {
    // A label may straddle the previous scan boundary.
    let mut from = self.scanned.saturating_sub(self.longest.saturating_sub(1));
    while from > 0 && !buffer.is_char_boundary(from) {
      from -= 1;
    }
    let window = &buffer[from..];

    let mut hits: Vec<(usize, usize)> = Vec::new();
    for (i, label) in self.labels.iter().enumerate() {
      if self.seen[i] {
        continue;
      }
      if let Some(pos) = window.find(label) {
        hits.push((pos, i));
      }
    }
    hits.sort_unstable();
    self.scanned = buffer.len();

    hits
      .into_iter()
      .map(|(_, i)| {
        self.seen[i] = true;
        self.labels[i]
      })
      .collect()
  }

  pub fn seen_count(&self) -> usize {
    self.seen.iter().filter(|s| **s).count()
  }

  pub fn total(&self) -> usize {
    self.labels.len()
  }
}

/// Event emitted while a job runs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
  StageStarted { uuid: String, stage: CorrectionStatus },
  Progress { uuid: String, stage: CorrectionStatus, label: String },
  StageFinished { uuid: String, stage: CorrectionStatus },
  Error { uuid: String, stage: CorrectionStatus, message: String },
}

/// Receiver of pipeline events.
pub trait ProgressSink: Send + Sync {
  fn emit(&self, event: PipelineEvent);
}

/// Writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
  fn emit(&self, event: PipelineEvent) {
    match &event {
      PipelineEvent::Error { uuid, stage, message } => {
        warn!(target: "pipeline", %uuid, %stage, %message, "stage error")
      }
      PipelineEvent::Progress { uuid, stage, label } => {
        info!(target: "pipeline", %uuid, %stage, %label, "section received")
      }
      PipelineEvent::StageStarted { uuid, stage } => info!(target: "pipeline", %uuid, %stage, "stage started"),
      PipelineEvent::StageFinished { uuid, stage } => info!(target: "pipeline", %uuid, %stage, "stage finished"),
    }
  }
}

impl ProgressSink for mpsc::UnboundedSender<PipelineEvent> {
  fn emit(&self, event: PipelineEvent) {
    // Receiver gone means nobody is listening; the job carries on.
    let _ = self.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn labels_reported_in_order_of_appearance() {
    let mut t = SectionTracker::new(&RUBRIC_LABELS);
    let buf = r#"{"词汇丰富性": {"score": 8}, "语法准确性": {"score": 7}}"#;
    assert_eq!(t.observe(buf), vec!["词汇丰富性", "语法准确性"]);
  }

  #[test]
  fn each_label_reported_once() {
    let mut t = SectionTracker::new(&RUBRIC_LABELS);
    let mut buf = String::from("{\"语法准确性\": 1, ");
    assert_eq!(t.observe(&buf), vec!["语法准确性"]);
    buf.push_str("\"comment\": \"语法准确性还可以\", \"词汇丰富性\"");
    assert_eq!(t.observe(&buf), vec!["词汇丰富性"]);
    buf.push_str(" 语法准确性 词汇丰富性");
    assert!(t.observe(&buf).is_empty());
    assert_eq!(t.seen_count(), 2);
    assert_eq!(t.total(), 9);
  }

  #[test]
  fn label_split_across_chunks_is_found() {
    let mut t = SectionTracker::new(&UPGRADE_SECTIONS);
    let mut buf = String::from("{\"vocabulary_up");
    assert!(t.observe(&buf).is_empty());
    buf.push_str("grades\": []");
    assert_eq!(t.observe(&buf), vec!["vocabulary_upgrades"]);
  }

  #[test]
  fn multibyte_label_split_across_chunks_is_found() {
    let mut t = SectionTracker::new(&RUBRIC_LABELS);
    let mut buf = String::from("前言…… 词汇丰");
    assert!(t.observe(&buf).is_empty());
    buf.push_str("富性");
    assert_eq!(t.observe(&buf), vec!["词汇丰富性"]);
  }

  #[test]
  fn channel_sink_forwards_events() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ev = PipelineEvent::StageStarted { uuid: "u".into(), stage: CorrectionStatus::GenerateScore };
    tx.emit(ev.clone());
    assert_eq!(rx.try_recv().unwrap(), ev);
  }
}
