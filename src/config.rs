//! Loading service configuration (prompts + pipeline settings) from env and TOML.
//!
//! See `AppConfig`, `Prompts` and `PipelineSettings` for the expected schema.
//! Every field has a default, so a TOML file only needs the keys it overrides.

use serde::Deserialize;
use tracing::{error, info};

use crate::llm::Sampling;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub pipeline: PipelineSettings,
}

/// Prompts used by every pipeline stage. Placeholders: `{prompt}`, `{essay}`, `{tone}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub score_system: String,
  pub score_user_template: String,
  pub upgrade_system: String,
  pub upgrade_user_template: String,
  pub pure_upgrade_system: String,
  pub pure_upgrade_user_template: String,
  pub title_system: String,
  pub icon_system: String,
  pub quote_system: String,
}

const SCORE_SYSTEM: &str = r#"
你是一名资深的高考英语读后续写阅卷老师。请严格按照以下 100 分制评分细则给学生的续写打分。

评分维度（括号内为该项满分）：
1. 内容要点（15）：是否完成续写任务，情节是否丰富、细节是否充分。
2. 情节衔接（15）：续写与原文及所给段首句是否自然衔接，人物、情节是否前后一致。
3. 逻辑连贯（10）：段内、段间逻辑是否清楚，过渡是否自然。
4. 词汇丰富性（10）：词汇是否丰富、准确、有表现力，是否使用高级词汇和短语。
5. 语法准确性（15）：语法、时态、主谓一致、拼写等是否准确。
6. 句式多样性（10）：是否恰当使用复合句、非谓语、倒装、独立主格等多样句式。
7. 篇章结构（10）：结构是否完整，首尾是否呼应。
8. 主题升华（10）：结尾是否点题、是否有恰当的情感或主题升华。
9. 书写规范（5）：标点、大小写、字数是否符合要求（约 150 词）。

输出要求：
- 只输出一个 JSON 对象，不要输出任何其它文字。
- 键名必须依次为上述九个维度的中文名称，每个值形如 {"score": 数字, "comment": "简短评语"}。
- 另加一个键 "summary"，值为不超过 80 字的总评。
- 每项得分不得超过该项满分。
"#;

const UPGRADE_SYSTEM: &str = r#"
你是一名高考英语写作教练，负责为学生的读后续写提供升格建议。{tone}。

只输出一个 JSON 对象，包含以下四个键（缺少内容的键可以省略）：
- "writing_analysis": 字符串，分析整体写作亮点与不足。
- "vocabulary_upgrades": 数组，每项 {"original": "原词或短语", "upgraded": "升级表达", "reason": "理由"}。
- "sentence_upgrades": 数组，每项 {"original": "原句", "upgraded": "升级句", "technique": "所用句式或技巧"}。
- "style_suggestions": 数组，每项为一条文风或修辞建议（字符串）。
"#;

const PURE_UPGRADE_SYSTEM: &str = r#"
你是一名高考英语写作教练。请逐句升格学生的续写，保持原意和情节不变。

只输出一个 JSON 对象：{"rows": [{"original": "原句", "upgraded": "升格后的句子", "comment": "修改说明（中文）"}]}
按原文顺序覆盖每一个句子。
"#;

impl Default for Prompts {
  fn default() -> Self {
    Self {
      score_system: SCORE_SYSTEM.trim().into(),
      score_user_template: "【原文及续写要求】\n{prompt}\n\n【学生续写】\n{essay}".into(),
      upgrade_system: UPGRADE_SYSTEM.trim().into(),
      upgrade_user_template: "【原文及续写要求】\n{prompt}\n\n【学生续写】\n{essay}".into(),
      pure_upgrade_system: PURE_UPGRADE_SYSTEM.trim().into(),
      pure_upgrade_user_template: "【学生续写】\n{essay}".into(),
      title_system: "根据学生的续写内容拟一个不超过 12 个字的中文标题。只输出标题本身，不要引号。".into(),
      icon_system: "Pick ONE emoji that best represents the story below. Output ONLY that single emoji.".into(),
      quote_system: "给正在练习英语写作的高中生一句简短的英文写作名言，并附中文翻译。格式：英文 —— 作者（中文翻译）。只输出这一行。".into(),
    }
  }
}

/// Models, sampling parameters, and cache settings for the pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
  /// Default model for the grading stages; overridable per request.
  pub strong_model: String,
  /// Smaller model for title, icon and quote.
  pub fast_model: String,
  /// Models a request may select. Empty means only `strong_model`.
  pub allowed_models: Vec<String>,
  pub score_sampling: Sampling,
  pub upgrade_sampling: Sampling,
  pub pure_upgrade_sampling: Sampling,
  pub title_sampling: Sampling,
  pub icon_sampling: Sampling,
  pub fallback_icon: String,
  pub fallback_title: String,
  pub quote_ttl_secs: u64,
}

impl Default for PipelineSettings {
  fn default() -> Self {
    let strong_model = std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());
    let fast_model = std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    Self {
      allowed_models: vec![strong_model.clone(), fast_model.clone()],
      strong_model,
      fast_model,
      score_sampling: Sampling { max_tokens: Some(2048), temperature: 0.2, top_p: Some(0.9) },
      upgrade_sampling: Sampling { max_tokens: Some(3072), temperature: 0.6, top_p: Some(0.95) },
      pure_upgrade_sampling: Sampling { max_tokens: Some(3072), temperature: 0.5, top_p: Some(0.95) },
      title_sampling: Sampling { max_tokens: Some(32), temperature: 0.7, top_p: None },
      icon_sampling: Sampling { max_tokens: Some(8), temperature: 0.7, top_p: None },
      fallback_icon: "📄".into(),
      fallback_title: "未命名批改".into(),
      quote_ttl_secs: 24 * 60 * 60,
    }
  }
}

impl PipelineSettings {
  /// Requested model if allowed, otherwise the default grading model.
  pub fn resolve_model(&self, requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|m| !m.is_empty()) {
      Some(m) if m == self.strong_model || self.allowed_models.iter().any(|a| a == m) => m.to_string(),
      _ => self.strong_model.clone(),
    }
  }
}

/// Parse TOML text into `AppConfig`.
pub fn parse_config(text: &str) -> Result<AppConfig, toml::de::Error> {
  toml::from_str::<AppConfig>(text)
}

/// Load `AppConfig` from INKCRAFT_CONFIG_PATH. On any parsing/IO error, defaults are used.
pub fn load_config_from_env() -> AppConfig {
  let Ok(path) = std::env::var("INKCRAFT_CONFIG_PATH") else {
    return AppConfig::default();
  };
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_config(&s) {
      Ok(cfg) => {
        info!(target: "inkcraft_backend", %path, "Loaded config (TOML)");
        cfg
      }
      Err(e) => {
        error!(target: "inkcraft_backend", %path, error = %e, "Failed to parse TOML config; using defaults");
        AppConfig::default()
      }
    },
    Err(e) => {
      error!(target: "inkcraft_backend", %path, error = %e, "Failed to read TOML config file; using defaults");
      AppConfig::default()
    }
  }
}
