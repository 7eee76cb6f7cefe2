//! Domain models: the correction record, its status chain, and the progress lookup.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single essay or one entry of a batch submission.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
  #[default]
  Single,
  Batch,
}

/// Feedback tone requested by the student.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
  #[default]
  Encouraging,
  Neutral,
  Strict,
}

impl Tone {
  /// Phrase substituted into the `{tone}` prompt placeholder.
  pub fn prompt_phrase(&self) -> &'static str {
    match self {
      Tone::Encouraging => "语气温和、以鼓励为主，先肯定优点再指出问题",
      Tone::Neutral => "语气客观中立，优缺点并列陈述",
      Tone::Strict => "语气严格，按高考阅卷标准直接指出所有问题",
    }
  }
}

/// Pipeline status persisted on the record.
///
/// Stage variants name the last stage whose output is durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrectionStatus {
  #[serde(rename = "pending")]
  Pending,
  #[serde(rename = "generate-score")]
  GenerateScore,
  #[serde(rename = "generate-upgradation")]
  GenerateUpgradation,
  #[serde(rename = "generate-pure-upgradation")]
  GeneratePureUpgradation,
  #[serde(rename = "generate-title")]
  GenerateTitle,
  #[serde(rename = "generate-icon")]
  GenerateIcon,
  #[serde(rename = "success", alias = "finished")]
  Success,
  #[serde(rename = "failed", alias = "error")]
  Failed,
}

impl CorrectionStatus {
  /// Stages in execution order.
  pub const STAGES: [CorrectionStatus; 5] = [
    CorrectionStatus::GenerateScore,
    CorrectionStatus::GenerateUpgradation,
    CorrectionStatus::GeneratePureUpgradation,
    CorrectionStatus::GenerateTitle,
    CorrectionStatus::GenerateIcon,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      CorrectionStatus::Pending => "pending",
      CorrectionStatus::GenerateScore => "generate-score",
      CorrectionStatus::GenerateUpgradation => "generate-upgradation",
      CorrectionStatus::GeneratePureUpgradation => "generate-pure-upgradation",
      CorrectionStatus::GenerateTitle => "generate-title",
      CorrectionStatus::GenerateIcon => "generate-icon",
      CorrectionStatus::Success => "success",
      CorrectionStatus::Failed => "failed",
    }
  }

  /// Position in the forward-only chain. Both terminal values share the top rank.
  pub fn rank(&self) -> u8 {
    match self {
      CorrectionStatus::Pending => 0,
      CorrectionStatus::GenerateScore => 1,
      CorrectionStatus::GenerateUpgradation => 2,
      CorrectionStatus::GeneratePureUpgradation => 3,
      CorrectionStatus::GenerateTitle => 4,
      CorrectionStatus::GenerateIcon => 5,
      CorrectionStatus::Success | CorrectionStatus::Failed => 6,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, CorrectionStatus::Success | CorrectionStatus::Failed)
  }

  /// True when moving from `self` to `next` does not roll the chain back.
  pub fn can_advance_to(&self, next: CorrectionStatus) -> bool {
    if self.is_terminal() {
      return *self == next;
    }
    next.rank() >= self.rank()
  }
}

impl fmt::Display for CorrectionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CorrectionStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "pending" => Ok(CorrectionStatus::Pending),
      "generate-score" => Ok(CorrectionStatus::GenerateScore),
      "generate-upgradation" => Ok(CorrectionStatus::GenerateUpgradation),
      "generate-pure-upgradation" => Ok(CorrectionStatus::GeneratePureUpgradation),
      "generate-title" => Ok(CorrectionStatus::GenerateTitle),
      "generate-icon" => Ok(CorrectionStatus::GenerateIcon),
      "success" | "finished" => Ok(CorrectionStatus::Success),
      "failed" | "error" => Ok(CorrectionStatus::Failed),
      other => Err(format!("unknown status: {other}")),
    }
  }
}

/// Coarse progress shown to polling clients.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Progress {
  pub percent: u8,
  pub label: &'static str,
}

/// Fixed status → (percent, label) table.
pub fn progress_for(status: CorrectionStatus) -> Progress {
  let (percent, label) = match status {
    CorrectionStatus::Pending => (5, "排队中"),
    CorrectionStatus::GenerateScore => (35, "评分完成，正在生成升格建议"),
    CorrectionStatus::GenerateUpgradation => (60, "升格建议完成，正在生成全文升格"),
    CorrectionStatus::GeneratePureUpgradation => (80, "全文升格完成，正在生成标题"),
    CorrectionStatus::GenerateTitle => (90, "标题完成，正在生成图标"),
    CorrectionStatus::GenerateIcon => (95, "即将完成"),
    CorrectionStatus::Success => (100, "批改完成"),
    CorrectionStatus::Failed => (100, "批改失败"),
  };
  Progress { percent, label }
}

/// One grading job and its accumulated result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Correction {
  pub id: u64,
  pub uuid: String,
  pub user_id: String,
  pub title: String,
  pub icon: String,
  pub model: String,
  pub tone: Tone,
  pub kind: CorrectionKind,
  #[serde(default)] pub batch_id: Option<String>,
  pub public: bool,

  pub prompt: String,
  pub essay: String,

  /// Markdown report, appended to by each stage.
  pub content: String,
  #[serde(default)] pub score: Option<f64>,
  pub status: CorrectionStatus,
  #[serde(default)] pub error: Option<String>,

  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Correction {
  /// Owners always see their records; everyone else only public ones.
  pub fn visible_to(&self, user_id: Option<&str>) -> bool {
    self.public || user_id == Some(self.user_id.as_str())
  }

  pub fn is_owned_by(&self, user_id: &str) -> bool {
    self.user_id == user_id
  }

  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal() || self.error.is_some()
  }

  /// Status as reported to clients: a recorded error reads as `failed`
  /// while the stored status keeps naming the last durable stage.
  pub fn reported_status(&self) -> CorrectionStatus {
    if self.error.is_some() { CorrectionStatus::Failed } else { self.status }
  }

  pub fn progress(&self) -> Progress {
    match self.error {
      Some(_) => Progress { percent: progress_for(self.status).percent, label: progress_for(CorrectionStatus::Failed).label },
      None => progress_for(self.status),
    }
  }
}

/// Fields supplied when a job is submitted. Content starts empty.
#[derive(Clone, Debug)]
pub struct NewCorrection {
  pub user_id: String,
  pub model: String,
  pub tone: Tone,
  pub kind: CorrectionKind,
  pub batch_id: Option<String>,
  pub public: bool,
  pub prompt: String,
  pub essay: String,
}

/// Partial update; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct CorrectionPatch {
  pub title: Option<String>,
  pub icon: Option<String>,
  pub content: Option<String>,
  pub score: Option<f64>,
  pub status: Option<CorrectionStatus>,
  pub error: Option<String>,
  /// Drop a previously recorded error (a re-run starting over).
  pub clear_error: bool,
  pub public: Option<bool>,
}
