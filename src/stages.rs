//! The individual generation stages.
//!
//! Each stage makes one (or for title/icon, one small) model call and turns the
//! text it gets back into a markdown section or a field value. Malformed model
//! output never fails a stage; only the model call itself can.

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::{PipelineSettings, Prompts};
use crate::domain::{Correction, CorrectionStatus};
use crate::error::LlmError;
use crate::json_repair;
use crate::llm::{ChatProvider, ChatRequest};
use crate::progress::{PipelineEvent, ProgressSink, SectionTracker, RUBRIC_LABELS, UPGRADE_SECTIONS};
use crate::scoring::{self, ScoreOutcome, ScoreSource};
use crate::util::{fill_template, is_emoji, md_cell, trunc_for_log};

/// Everything a stage needs besides the job itself.
pub struct StageContext<'a> {
  pub provider: &'a dyn ChatProvider,
  pub prompts: &'a Prompts,
  pub settings: &'a PipelineSettings,
  pub sink: &'a dyn ProgressSink,
}

/// Consume a token stream, reporting each tracked label once as it first appears.
async fn collect_stream(
  ctx: &StageContext<'_>,
  job: &Correction,
  stage: CorrectionStatus,
  req: ChatRequest,
  mut tracker: Option<SectionTracker>,
) -> Result<String, LlmError> {
  let mut stream = ctx.provider.stream(req).await?;
  let mut buffer = String::new();
  while let Some(delta) = stream.next().await {
    buffer.push_str(&delta?);
    if let Some(t) = tracker.as_mut() {
      for label in t.observe(&buffer) {
        ctx.sink.emit(PipelineEvent::Progress { uuid: job.uuid.clone(), stage, label: label.to_string() });
      }
    }
  }
  if buffer.trim().is_empty() {
    // Parsed downstream like any other unusable output.
    warn!(target: "pipeline", %stage, "model stream ended without content");
    return Ok(buffer);
  }
  if let Some(t) = tracker.as_ref().filter(|t| t.seen_count() < t.total()) {
    debug!(target: "pipeline", %stage, seen = t.seen_count(), expected = t.total(), "some sections never appeared");
  }
  debug!(target: "pipeline", %stage, response_len = buffer.len(), preview = %trunc_for_log(&buffer, 60), "stream complete");
  Ok(buffer)
}

fn user_message(template: &str, job: &Correction) -> String {
  fill_template(template, &[("prompt", &job.prompt), ("essay", &job.essay), ("tone", job.tone.prompt_phrase())])
}

fn system_message(template: &str, job: &Correction) -> String {
  fill_template(template, &[("tone", job.tone.prompt_phrase())])
}

/// Non-streamed call where a blank answer means "use the fallback".
async fn complete_or_blank(ctx: &StageContext<'_>, req: ChatRequest) -> Result<String, LlmError> {
  match ctx.provider.complete(req).await {
    Err(LlmError::EmptyResponse) => {
      warn!(target: "pipeline", model = %ctx.settings.fast_model, "blank completion, using fallback");
      Ok(String::new())
    }
    other => other,
  }
}

fn fmt_points(v: f64) -> String {
  if v.fract() == 0.0 { format!("{}", v as i64) } else { format!("{v:.1}") }
}

// --- Score stage ---

pub struct ScoreStageOutput {
  pub outcome: ScoreOutcome,
  pub markdown: String,
}

#[instrument(level = "info", skip_all, fields(uuid = %job.uuid, model = %job.model))]
pub async fn score_stage(ctx: &StageContext<'_>, job: &Correction) -> Result<ScoreStageOutput, LlmError> {
  let stage = CorrectionStatus::GenerateScore;
  let req = ChatRequest::new(
    job.model.clone(),
    system_message(&ctx.prompts.score_system, job),
    user_message(&ctx.prompts.score_user_template, job),
    ctx.settings.score_sampling,
  );
  let raw = collect_stream(ctx, job, stage, req, Some(SectionTracker::new(&RUBRIC_LABELS))).await?;
  let outcome = scoring::derive_score(&raw);
  info!(target: "pipeline", score = outcome.score, source = ?outcome.source, categories = outcome.breakdown.len(), "score derived");
  let markdown = score_markdown(&outcome);
  Ok(ScoreStageOutput { outcome, markdown })
}

pub fn score_markdown(outcome: &ScoreOutcome) -> String {
  let mut md = String::from("## 评分\n\n");
  md.push_str(&format!("**总分：{:.1} / {}**\n\n", outcome.score, scoring::OUTPUT_SCALE));
  match outcome.source {
    ScoreSource::Json => {}
    ScoreSource::RegexFallback => md.push_str("> 评分结果格式异常，总分由文本中的分值推算，可能不准确。\n\n"),
    ScoreSource::None => md.push_str("> 未能解析评分结果。\n\n"),
  }
  if !outcome.breakdown.is_empty() {
    md.push_str("| 维度 | 得分 | 评语 |\n| --- | --- | --- |\n");
    for row in &outcome.breakdown {
      md.push_str(&format!("| {} | {} | {} |\n", md_cell(&row.label), fmt_points(row.score), md_cell(&row.comment)));
    }
    md.push('\n');
  }
  if let Some(summary) = &outcome.summary {
    md.push_str(&format!("**总评：** {}\n\n", summary.trim()));
  }
  md
}

// --- Upgrade-suggestion stage ---

#[instrument(level = "info", skip_all, fields(uuid = %job.uuid, model = %job.model))]
pub async fn upgrade_stage(ctx: &StageContext<'_>, job: &Correction) -> Result<String, LlmError> {
  let stage = CorrectionStatus::GenerateUpgradation;
  let req = ChatRequest::new(
    job.model.clone(),
    system_message(&ctx.prompts.upgrade_system, job),
    user_message(&ctx.prompts.upgrade_user_template, job),
    ctx.settings.upgrade_sampling,
  );
  let raw = collect_stream(ctx, job, stage, req, Some(SectionTracker::new(&UPGRADE_SECTIONS))).await?;
  let value = json_repair::parse_lenient(json_repair::extract_outermost_object(&raw).unwrap_or(&raw));
  Ok(upgrade_markdown(&value))
}

/// Markdown for the four upgrade sections; absent or empty sections are skipped.
pub fn upgrade_markdown(value: &Value) -> String {
  let mut body = String::new();

  if let Some(v) = value.get("writing_analysis") {
    let text = render_free(v);
    if !text.is_empty() {
      body.push_str(&format!("### 写作分析\n\n{text}\n\n"));
    }
  }
  if let Some(v) = value.get("vocabulary_upgrades") {
    let text = render_rows(v, &[("original", "原表达"), ("upgraded", "升级表达"), ("reason", "理由")]);
    if !text.is_empty() {
      body.push_str(&format!("### 词汇升级\n\n{text}\n"));
    }
  }
  if let Some(v) = value.get("sentence_upgrades") {
    let text = render_rows(v, &[("original", "原句"), ("upgraded", "升级句"), ("technique", "技巧")]);
    if !text.is_empty() {
      body.push_str(&format!("### 句式升级\n\n{text}\n"));
    }
  }
  if let Some(v) = value.get("style_suggestions") {
    let text = render_free(v);
    if !text.is_empty() {
      body.push_str(&format!("### 文风建议\n\n{text}\n\n"));
    }
  }

  if body.is_empty() {
    return String::new();
  }
  format!("## 升格建议\n\n{body}")
}

/// Strings as-is, arrays as bullet lists, objects as `key：value` bullets.
fn render_free(v: &Value) -> String {
  match v {
    Value::String(s) => s.trim().to_string(),
    Value::Array(items) => items
      .iter()
      .map(render_free)
      .filter(|s| !s.is_empty())
      .map(|s| format!("- {}", s.replace('\n', " ")))
      .collect::<Vec<_>>()
      .join("\n"),
    Value::Object(map) => map
      .iter()
      .map(|(k, v)| (k, render_free(v)))
      .filter(|(_, s)| !s.is_empty())
      .map(|(k, s)| format!("- **{k}**：{}", s.replace('\n', " ")))
      .collect::<Vec<_>>()
      .join("\n"),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// A table for arrays of objects; bullets for anything else.
fn render_rows(v: &Value, columns: &[(&str, &str)]) -> String {
  let Some(items) = v.as_array() else { return render_free(v) };
  let objects: Vec<_> = items.iter().filter_map(Value::as_object).collect();
  if objects.is_empty() {
    return render_free(v);
  }
  let cell = |obj: &serde_json::Map<String, Value>, key: &str| {
    obj.get(key).map(|v| md_cell(&render_free(v))).unwrap_or_default()
  };
  let mut md = format!(
    "| {} |\n|{}\n",
    columns.iter().map(|(_, h)| *h).collect::<Vec<_>>().join(" | "),
    " --- |".repeat(columns.len())
  );
  for obj in objects {
    let cells: Vec<String> = columns.iter().map(|(k, _)| cell(obj, k)).collect();
    md.push_str(&format!("| {} |\n", cells.join(" | ")));
  }
  md
}

// --- Pure-rewrite stage ---

#[instrument(level = "info", skip_all, fields(uuid = %job.uuid, model = %job.model))]
pub async fn pure_upgrade_stage(ctx: &StageContext<'_>, job: &Correction) -> Result<String, LlmError> {
  let req = ChatRequest::new(
    job.model.clone(),
    system_message(&ctx.prompts.pure_upgrade_system, job),
    user_message(&ctx.prompts.pure_upgrade_user_template, job),
    ctx.settings.pure_upgrade_sampling,
  );
  let raw = collect_stream(ctx, job, CorrectionStatus::GeneratePureUpgradation, req, None).await?;
  let value = json_repair::parse_lenient(json_repair::extract_outermost(&raw).unwrap_or(&raw));
  Ok(rewrite_table(&value))
}

/// Sentence-aligned rewrite table. Accepts a bare array or `{rows|sentences: [...]}`.
pub fn rewrite_table(value: &Value) -> String {
  let rows = match value {
    Value::Array(items) => Some(items),
    Value::Object(map) => ["rows", "sentences", "items"].iter().find_map(|k| map.get(*k)?.as_array()),
    _ => None,
  };
  let rows: Vec<_> = rows
    .map(|r| r.iter().filter_map(Value::as_object).collect())
    .unwrap_or_default();
  if rows.is_empty() {
    return String::new();
  }

  let text = |obj: &serde_json::Map<String, Value>, keys: &[&str]| {
    keys.iter().find_map(|k| obj.get(*k)?.as_str()).map(md_cell).unwrap_or_default()
  };
  let mut md = String::from("## 全文升格\n\n| 原句 | 升格句 | 说明 |\n| --- | --- | --- |\n");
  for obj in rows {
    md.push_str(&format!(
      "| {} | {} | {} |\n",
      text(obj, &["original", "source"]),
      text(obj, &["upgraded", "rewrite", "improved"]),
      text(obj, &["comment", "reason", "note"]),
    ));
  }
  md.push('\n');
  md
}

// --- Title & icon stages ---

#[instrument(level = "info", skip_all, fields(uuid = %job.uuid, model = %ctx.settings.fast_model))]
pub async fn title_stage(ctx: &StageContext<'_>, job: &Correction) -> Result<String, LlmError> {
  let req = ChatRequest::new(
    ctx.settings.fast_model.clone(),
    ctx.prompts.title_system.clone(),
    job.essay.clone(),
    ctx.settings.title_sampling,
  );
  let raw = complete_or_blank(ctx, req).await?;
  Ok(clean_title(&raw, &ctx.settings.fallback_title))
}

/// Trimmed first line without wrapping quotes; fallback when nothing is left.
pub fn clean_title(raw: &str, fallback: &str) -> String {
  const WRAPPERS: &[char] = &['"', '\'', '“', '”', '‘', '’', '《', '》', '「', '」', '*', '#'];
  let line = raw.trim().lines().next().unwrap_or_default();
  let title = line.trim().trim_matches(WRAPPERS).trim();
  if title.is_empty() { fallback.to_string() } else { title.to_string() }
}

#[instrument(level = "info", skip_all, fields(uuid = %job.uuid, model = %ctx.settings.fast_model))]
pub async fn icon_stage(ctx: &StageContext<'_>, job: &Correction) -> Result<String, LlmError> {
  let req = ChatRequest::new(
    ctx.settings.fast_model.clone(),
    ctx.prompts.icon_system.clone(),
    job.essay.clone(),
    ctx.settings.icon_sampling,
  );
  let raw = complete_or_blank(ctx, req).await?;
  Ok(pick_icon(&raw, &ctx.settings.fallback_icon))
}

/// First grapheme cluster if it is an emoji, otherwise `fallback`.
pub fn pick_icon(raw: &str, fallback: &str) -> String {
  match raw.trim().graphemes(true).next() {
    // keycaps like 1️⃣ start with a plain digit
    Some(g) if g.chars().next().is_some_and(is_emoji) || g.contains('\u{20E3}') => g.to_string(),
    _ => fallback.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  use crate::domain::{CorrectionKind, Tone};
  use crate::llm::testing::{MockProvider, Reply};
  use crate::llm::OpenAI;
  use crate::scoring::CategoryScore;
  use tokio::sync::mpsc;

  fn job() -> Correction {
    let now = chrono::Utc::now();
    Correction {
      id: 1,
      uuid: "job-1".into(),
      user_id: "alice".into(),
      title: String::new(),
      icon: String::new(),
      model: "gpt-4o".into(),
      tone: Tone::Strict,
      kind: CorrectionKind::Single,
      batch_id: None,
      public: false,
      prompt: "Paragraph 1: When I opened the door...".into(),
      essay: "I stepped inside and saw my father smiling.".into(),
      content: String::new(),
      score: None,
      status: CorrectionStatus::Pending,
      error: None,
      created_at: now,
      updated_at: now,
    }
  }

  #[test]
  fn icon_keeps_first_grapheme_only() {
    assert_eq!(pick_icon("🎉🎊✨", "📄"), "🎉");
    assert_eq!(pick_icon("  👨‍👩‍👧 family", "📄"), "👨‍👩‍👧");
    assert_eq!(pick_icon("Book", "📄"), "📄");
    assert_eq!(pick_icon("书", "📄"), "📄");
    assert_eq!(pick_icon("", "📄"), "📄");
  }

  #[test]
  fn icon_accepts_supplementary_and_legacy_symbols() {
    for icon in ["🀄", "🃏", "🆗", "🈶", "1️⃣", "©️", "™️", "‼️"] {
      assert_eq!(pick_icon(icon, "📄"), icon);
    }
    assert_eq!(pick_icon("1. 标题", "📄"), "📄");
  }

  #[test]
  fn title_is_trimmed_and_unquoted() {
    assert_eq!(clean_title("  《门后的微笑》 \n第二行", "x"), "门后的微笑");
    assert_eq!(clean_title("\"A Door Opens\"", "x"), "A Door Opens");
    assert_eq!(clean_title("   ", "未命名批改"), "未命名批改");
  }

  #[test]
  fn upgrade_markdown_omits_missing_sections() {
    let v = json!({
      "writing_analysis": "情节完整，但细节描写不足。",
      "sentence_upgrades": [{"original": "He was sad.", "upgraded": "Sorrow welled up in him.", "technique": "抽象名词作主语"}]
    });
    let md = upgrade_markdown(&v);
    assert!(md.starts_with("## 升格建议"));
    assert!(md.contains("### 写作分析\n\n情节完整"));
    assert!(md.contains("| 原句 | 升级句 | 技巧 |"));
    assert!(md.contains("| He was sad. | Sorrow welled up in him. | 抽象名词作主语 |"));
    assert!(!md.contains("词汇升级"));
    assert!(!md.contains("文风建议"));
  }

  #[test]
  fn upgrade_markdown_of_nothing_is_empty() {
    assert_eq!(upgrade_markdown(&json!({})), "");
    assert_eq!(upgrade_markdown(&Value::Null), "");
    assert_eq!(upgrade_markdown(&json!({"style_suggestions": []})), "");
  }

  #[test]
  fn style_suggestions_render_as_bullets() {
    let md = upgrade_markdown(&json!({"style_suggestions": ["多用动作描写", "结尾点题"]}));
    assert!(md.contains("- 多用动作描写\n- 结尾点题"));
  }

  #[test]
  fn rewrite_table_accepts_wrapped_and_bare_arrays() {
    let wrapped = json!({"rows": [{"original": "I am happy.", "upgraded": "Joy | filled me.", "comment": "情感具象化"}]});
    let md = rewrite_table(&wrapped);
    assert!(md.contains("| I am happy. | Joy \\| filled me. | 情感具象化 |"));

    let bare = json!([{"original": "a", "upgraded": "b"}]);
    assert!(rewrite_table(&bare).contains("| a | b |  |"));
    assert_eq!(rewrite_table(&json!({"rows": []})), "");
  }

  #[test]
  fn score_markdown_flags_fallback() {
    let outcome = ScoreOutcome {
      score: 8.9,
      source: ScoreSource::RegexFallback,
      breakdown: vec![CategoryScore { label: "内容要点".into(), score: 12.0, comment: "较完整".into() }],
      summary: Some("继续努力".into()),
    };
    let md = score_markdown(&outcome);
    assert!(md.contains("**总分：8.9 / 25**"));
    assert!(md.contains("可能不准确"));
    assert!(md.contains("| 内容要点 | 12 | 较完整 |"));
    assert!(md.contains("**总评：** 继续努力"));
  }

  #[tokio::test]
  async fn score_stage_emits_progress_in_stream_order_once_each() {
    let raw = r#"{"词汇丰富性": {"score": 8, "comment": "词汇丰富性尚可"}, "语法准确性": {"score": 12}, "内容要点": {"score": 10}}"#;
    let provider = MockProvider::new(vec![Reply::Text(raw.into())]);
    let prompts = Prompts::default();
    let settings = PipelineSettings::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = StageContext { provider: &provider, prompts: &prompts, settings: &settings, sink: &tx };

    let out = score_stage(&ctx, &job()).await.unwrap();
    assert_eq!(out.outcome.score, 7.5);

    let mut labels = Vec::new();
    while let Ok(ev) = rx.try_recv() {
      if let PipelineEvent::Progress { label, .. } = ev {
        labels.push(label);
      }
    }
    assert_eq!(labels, vec!["词汇丰富性", "语法准确性", "内容要点"]);

    let sent = provider.requests.lock().unwrap();
    assert_eq!(sent[0].model, "gpt-4o");
    assert!(sent[0].messages[1].content.contains("I stepped inside"));
  }

  #[tokio::test]
  async fn stage_propagates_model_failure() {
    let provider = MockProvider::new(vec![Reply::Fail("upstream down".into())]);
    let prompts = Prompts::default();
    let settings = PipelineSettings::default();
    let ctx = StageContext { provider: &provider, prompts: &prompts, settings: &settings, sink: &crate::progress::LogSink };
    let err = upgrade_stage(&ctx, &job()).await.unwrap_err();
    assert!(matches!(err, LlmError::Upstream { status: 500, .. }));
  }

  #[tokio::test]
  async fn icon_and_title_use_fast_model() {
    let provider = MockProvider::new(vec![Reply::Text("“回家”".into()), Reply::Text("not an emoji".into())]);
    let prompts = Prompts::default();
    let settings = PipelineSettings::default();
    let ctx = StageContext { provider: &provider, prompts: &prompts, settings: &settings, sink: &crate::progress::LogSink };
    assert_eq!(title_stage(&ctx, &job()).await.unwrap(), "回家");
    assert_eq!(icon_stage(&ctx, &job()).await.unwrap(), "📄");
    let sent = provider.requests.lock().unwrap();
    assert!(sent.iter().all(|r| r.model == settings.fast_model));
  }

  #[tokio::test]
  async fn blank_title_and_icon_completions_use_fallbacks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"content": "  \n "}}]
      })))
      .expect(2)
      .mount(&server)
      .await;
    let provider = OpenAI::new("sk-test", format!("{}/v1/", server.uri()), Duration::from_secs(5)).unwrap();
    let prompts = Prompts::default();
    let settings = PipelineSettings::default();
    let ctx = StageContext { provider: &provider, prompts: &prompts, settings: &settings, sink: &crate::progress::LogSink };
    assert_eq!(title_stage(&ctx, &job()).await.unwrap(), "未命名批改");
    assert_eq!(icon_stage(&ctx, &job()).await.unwrap(), "📄");
  }

  #[tokio::test]
  async fn empty_score_stream_scores_zero() {
    let provider = MockProvider::new(vec![Reply::Text(String::new())]);
    let prompts = Prompts::default();
    let settings = PipelineSettings::default();
    let ctx = StageContext { provider: &provider, prompts: &prompts, settings: &settings, sink: &crate::progress::LogSink };
    let out = score_stage(&ctx, &job()).await.unwrap();
    assert_eq!(out.outcome.score, 0.0);
    assert_eq!(out.outcome.source, ScoreSource::None);
    assert!(out.markdown.contains("未能解析评分结果"));
  }
}
