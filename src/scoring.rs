//! Score derivation from the rubric stage's raw model output.
//!
//! The rubric is marked out of 100; the report shows a 25-point score.
//! A derived zero is treated as an extraction failure and retried with a
//! regex scan for `<number>分` tokens. That scan also picks up numbers that
//! were never rubric scores (e.g. "满分25分"), which is a known source of
//! wrong scores; it is kept because a zero is worse for students.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::json_repair;

pub const RUBRIC_TOTAL: f64 = 100.0;
pub const OUTPUT_SCALE: f64 = 25.0;

/// Raw text shorter than this (non-whitespace chars) is not worth a regex rescue.
const MIN_FALLBACK_CHARS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
  Json,
  RegexFallback,
  None,
}

/// One rubric row recovered for the report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CategoryScore {
  pub label: String,
  pub score: f64,
  pub comment: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreOutcome {
  /// 0–25, one decimal.
  pub score: f64,
  pub source: ScoreSource,
  pub breakdown: Vec<CategoryScore>,
  /// Summary comment from the model, if any.
  pub summary: Option<String>,
}

static SCORE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*分").expect("static regex"));

/// Numeric value of a `score` field: numbers, or strings like `"18"` / `"18分"`.
fn numeric(v: &Value) -> Option<f64> {
  match v {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => {
      let t = s.trim().trim_end_matches('分').trim();
      t.parse::<f64>().ok()
    }
    _ => None,
  }
}

/// Sum of every numeric leaf stored under a key named `score`, at any depth.
pub fn sum_leaf_scores(value: &Value) -> f64 {
  match value {
    Value::Object(map) => map
      .iter()
      .map(|(k, v)| match (k.as_str(), numeric(v)) {
        ("score", Some(n)) => n,
        _ => sum_leaf_scores(v),
      })
      .sum(),
    Value::Array(items) => items.iter().map(sum_leaf_scores).sum(),
    _ => 0.0,
  }
}

/// 100-point sum → 25-point score rounded to one decimal and clamped to [0, 25].
pub fn rescale(sum: f64) -> f64 {
  if !sum.is_finite() {
    return 0.0;
  }
  let scaled = (sum * OUTPUT_SCALE * 10.0 / RUBRIC_TOTAL).round() / 10.0;
  scaled.clamp(0.0, OUTPUT_SCALE)
}

/// Sum of all `<number>分` occurrences in free text.
pub fn regex_fallback_sum(text: &str) -> f64 {
  SCORE_RE
    .captures_iter(text)
    .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
    .sum()
}

fn comment_of(obj: &serde_json::Map<String, Value>) -> String {
  ["comment", "reason", "feedback", "评语"]
    .iter()
    .find_map(|k| obj.get(*k).and_then(Value::as_str))
    .unwrap_or_default()
    .trim()
    .to_string()
}

/// Rubric rows: top-level objects carrying a `score`, or entries of a
/// top-level array that name themselves via `name`/`category`.
pub fn breakdown(value: &Value) -> Vec<CategoryScore> {
  let mut rows = Vec::new();
  let Some(map) = value.as_object() else { return rows };
  for (key, v) in map {
    match v {
      Value::Object(obj) => {
        if let Some(score) = obj.get("score").and_then(numeric) {
          rows.push(CategoryScore { label: key.clone(), score, comment: comment_of(obj) });
        }
      }
      Value::Array(items) => {
        for item in items.iter().filter_map(Value::as_object) {
          let label = item.get("name").or_else(|| item.get("category")).and_then(Value::as_str);
          if let (Some(label), Some(score)) = (label, item.get("score").and_then(numeric)) {
            rows.push(CategoryScore { label: label.to_string(), score, comment: comment_of(item) });
          }
        }
      }
      _ => {}
    }
  }
  rows
}

fn summary_of(value: &Value) -> Option<String> {
  ["summary", "overall_comment", "总评"]
    .iter()
    .find_map(|k| value.get(*k).and_then(Value::as_str))
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
}

/// Full score derivation for the rubric stage.
pub fn derive_score(raw: &str) -> ScoreOutcome {
  let payload = json_repair::extract_outermost_object(raw).unwrap_or(raw);
  let value = match json_repair::parse(payload) {
    Ok(v) => v,
    Err(partial) if partial.is_empty() => {
      debug!(target: "pipeline", preview = %crate::util::trunc_for_log(raw, 60), "no rubric JSON recovered");
      partial.value
    }
    Err(partial) => {
      debug!(target: "pipeline", repairs = ?partial.repairs, "rubric JSON needed repair");
      partial.value
    }
  };

  let rows = breakdown(&value);
  let summary = summary_of(&value);
  let score = rescale(sum_leaf_scores(&value));
  if score != 0.0 {
    return ScoreOutcome { score, source: ScoreSource::Json, breakdown: rows, summary };
  }

  let significant = raw.chars().filter(|c| !c.is_whitespace()).count();
  if significant >= MIN_FALLBACK_CHARS {
    let fallback = regex_fallback_sum(raw);
    if fallback > 0.0 {
      let score = rescale(fallback);
      warn!(target: "pipeline", fallback_sum = fallback, score, "rubric JSON yielded zero; using regex score fallback");
      return ScoreOutcome { score, source: ScoreSource::RegexFallback, breakdown: rows, summary };
    }
  }

  ScoreOutcome { score: 0.0, source: ScoreSource::None, breakdown: rows, summary }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn rescale_matches_rounding_rule() {
    assert_eq!(rescale(60.0), 15.0);
    assert_eq!(rescale(100.0), 25.0);
    assert_eq!(rescale(0.0), 0.0);
    assert_eq!(rescale(73.0), 18.3); // 18.25 → 18.3
    assert_eq!(rescale(87.0), 21.8); // 21.75 → 21.8
    assert_eq!(rescale(41.0), 10.3); // 10.25 → 10.3
  }

  #[test]
  fn rescale_is_clamped() {
    assert_eq!(rescale(180.0), 25.0);
    assert_eq!(rescale(-20.0), 0.0);
    assert_eq!(rescale(f64::NAN), 0.0);
  }

  #[test]
  fn every_sum_in_range_maps_to_rounded_quarter() {
    for s in 0..=100 {
      let tenths = (s * 25 + 5) / 10;
      let expected = tenths as f64 / 10.0;
      assert_eq!(rescale(s as f64), expected, "sum {s}");
      assert!((0.0..=25.0).contains(&rescale(s as f64)));
    }
  }

  #[test]
  fn sums_nested_score_leaves() {
    let v = json!({
      "内容要点": {"score": 15, "comment": "要点齐全"},
      "语言": {"词汇丰富性": {"score": "8"}, "语法准确性": {"score": "7分"}},
      "list": [{"score": 5.5}, {"score": 4.5}],
      "max_score": 100,
      "note": "总分100"
    });
    assert_eq!(sum_leaf_scores(&v), 40.0);
  }

  #[test]
  fn derive_from_clean_json() {
    let raw = r#"{"a": {"score": 30}, "b": {"score": 30}}"#;
    let out = derive_score(raw);
    assert_eq!(out.score, 15.0);
    assert_eq!(out.source, ScoreSource::Json);
    assert_eq!(out.breakdown.len(), 2);
  }

  #[test]
  fn derive_from_prose_wrapped_broken_json() {
    let raw = "评分如下：\n```json\n{\"词汇丰富性\": {\"score\": 8, \"comment\": \"用词较丰富\",}, \"语法准确性\": {\"score\": 12}}\n```";
    let out = derive_score(raw);
    assert_eq!(out.score, 5.0);
    assert_eq!(out.source, ScoreSource::Json);
    let vocab = out.breakdown.iter().find(|r| r.label == "词汇丰富性").unwrap();
    assert_eq!(vocab, &CategoryScore { label: "词汇丰富性".into(), score: 8.0, comment: "用词较丰富".into() });
  }

  #[test]
  fn zero_score_falls_back_to_regex() {
    let raw = "内容要点：18分，词汇丰富性：9分，语法准确性 8.5 分。整体不错，但结尾仓促。";
    let out = derive_score(raw);
    assert_eq!(out.source, ScoreSource::RegexFallback);
    assert_eq!(out.score, rescale(35.5));
  }

  #[test]
  fn regex_fallback_also_counts_unrelated_numbers() {
    // Known weakness: "满分25分" is summed too.
    let raw = "本文满分25分，内容要点得10分，其余待改进，请继续努力写作。";
    assert_eq!(regex_fallback_sum(raw), 35.0);
  }

  #[test]
  fn trivial_text_gets_zero_without_fallback() {
    let out = derive_score("5分");
    assert_eq!(out.score, 0.0);
    assert_eq!(out.source, ScoreSource::None);
  }

  #[test]
  fn unparseable_and_regex_free_text_scores_zero() {
    let out = derive_score("I am unable to grade this essay right now, sorry about that.");
    assert_eq!(out.score, 0.0);
    assert_eq!(out.source, ScoreSource::None);
  }

  #[test]
  fn summary_and_array_breakdown() {
    let v = json!({"categories": [{"name": "篇章结构", "score": 9, "reason": "段落清晰"}], "summary": " 不错 "});
    assert_eq!(breakdown(&v), vec![CategoryScore { label: "篇章结构".into(), score: 9.0, comment: "段落清晰".into() }]);
    assert_eq!(summary_of(&v), Some("不错".into()));
  }

  #[test]
  fn rubric_missing_commas_between_members_still_scores() {
    let raw = "{\"内容要点\": {\"comment\": \"要点齐全\" \"score\": 40}, \"语法准确性\": {\"comment\": \"不错\"\n\"score\": 20}}";
    let out = derive_score(raw);
    assert_eq!(out.score, 15.0);
    assert_eq!(out.source, ScoreSource::Json);
    assert_eq!(out.breakdown.len(), 2);
  }
}
