//! Chat-completion provider.
//!
//! `ChatProvider` is the seam the pipeline talks to; `OpenAI` implements it over
//! `/chat/completions`, either as a single JSON response or as a server-sent
//! event stream of text deltas.
//!
//! NOTE: We never log the API key or message contents, only model names,
//! latencies and sizes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::LlmError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
  pub role: String,
  pub content: String,
}

impl ChatMessage {
  pub fn system(content: impl Into<String>) -> Self {
    Self { role: "system".into(), content: content.into() }
  }

  pub fn user(content: impl Into<String>) -> Self {
    Self { role: "user".into(), content: content.into() }
  }
}

/// Sampling parameters sent with every request.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
  #[serde(default)] pub max_tokens: Option<u32>,
  pub temperature: f32,
  #[serde(default)] pub top_p: Option<f32>,
}

impl Default for Sampling {
  fn default() -> Self {
    Self { max_tokens: None, temperature: 0.7, top_p: None }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
  pub model: String,
  pub messages: Vec<ChatMessage>,
  pub sampling: Sampling,
}

impl ChatRequest {
  pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>, sampling: Sampling) -> Self {
    Self {
      model: model.into(),
      messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
      sampling,
    }
  }
}

/// Stream of text deltas.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
  /// Whole completion as one string.
  async fn complete(&self, req: ChatRequest) -> Result<String, LlmError>;

  /// Completion as incremental text deltas.
  async fn stream(&self, req: ChatRequest) -> Result<TextStream, LlmError>;
}

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
}

impl OpenAI {
  pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      api_key: api_key.into(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
    })
  }

  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let timeout = std::env::var("OPENAI_TIMEOUT_SECS")
      .ok()
      .and_then(|s| s.parse::<u64>().ok())
      .unwrap_or(120);

    match Self::new(api_key, base_url, Duration::from_secs(timeout)) {
      Ok(oa) => Some(oa),
      Err(e) => {
        warn!(target: "inkcraft_backend", error = %e, "Failed to build HTTP client for OpenAI");
        None
      }
    }
  }

  async fn post(&self, req: &ChatRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
    let url = format!("{}/chat/completions", self.base_url);
    let body = ChatCompletionRequest {
      model: &req.model,
      messages: &req.messages,
      temperature: req.sampling.temperature,
      top_p: req.sampling.top_p,
      max_tokens: req.sampling.max_tokens,
      stream,
    };

    let res = self.client.post(&url)
      .header(USER_AGENT, "inkcraft-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&body).send().await?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let message = extract_openai_error(&body).unwrap_or(body);
      return Err(LlmError::Upstream { status: status.as_u16(), message });
    }
    Ok(res)
  }
}

#[async_trait]
impl ChatProvider for OpenAI {
  #[instrument(level = "info", skip(self, req), fields(model = %req.model))]
  async fn complete(&self, req: ChatRequest) -> Result<String, LlmError> {
    let start = Instant::now();
    let res = self.post(&req, false).await?;
    let raw = res.text().await?;
    let body: ChatCompletionResponse =
      serde_json::from_str(&raw).map_err(|e| LlmError::Decode(e.to_string()))?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.into_iter().next()
      .and_then(|c| c.message.content)
      .unwrap_or_default();
    info!(elapsed = ?start.elapsed(), response_len = text.len(), "Completion received");
    if text.trim().is_empty() {
      return Err(LlmError::EmptyResponse);
    }
    Ok(text)
  }

  #[instrument(level = "info", skip(self, req), fields(model = %req.model))]
  async fn stream(&self, req: ChatRequest) -> Result<TextStream, LlmError> {
    let res = self.post(&req, true).await?;
    debug!("Stream opened");
    Ok(sse_text_stream(res.bytes_stream()))
  }
}

/// Turns a raw SSE byte stream into a stream of text deltas.
fn sse_text_stream<S, B, E>(bytes: S) -> TextStream
where
  S: futures::Stream<Item = Result<B, E>> + Send + 'static,
  B: AsRef<[u8]> + Send + 'static,
  E: Into<LlmError> + Send + 'static,
{
  let state = (Box::pin(bytes), SseDecoder::default(), VecDeque::<Result<String, LlmError>>::new());
  futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
    loop {
      if let Some(item) = pending.pop_front() {
        return Some((item, (bytes, decoder, pending)));
      }
      if decoder.is_done() {
        return None;
      }
      match bytes.next().await {
        Some(Ok(chunk)) => match decoder.push(chunk.as_ref()) {
          Ok(deltas) => pending.extend(deltas.into_iter().map(Ok)),
          Err(e) => {
            decoder.finish();
            pending.push_back(Err(e));
          }
        },
        Some(Err(e)) => {
          decoder.finish();
          pending.push_back(Err(e.into()));
        }
        None => {
          match decoder.flush() {
            Ok(deltas) => pending.extend(deltas.into_iter().map(Ok)),
            Err(e) => pending.push_back(Err(e)),
          }
          decoder.finish();
        }
      }
    }
  })
  .boxed()
}

/// Incremental decoder for `text/event-stream` chat completion chunks.
///
/// Input may be split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
  buf: Vec<u8>,
  done: bool,
}

impl SseDecoder {
  pub fn is_done(&self) -> bool {
    self.done
  }

  fn finish(&mut self) {
    self.done = true;
  }

  /// Feed bytes; returns the text deltas of every complete line.
  pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LlmError> {
    self.buf.extend_from_slice(bytes);
    let mut out = Vec::new();
    while let Some(nl) = self.buf.iter().position(|b| *b == b'\n') {
      let line: Vec<u8> = self.buf.drain(..=nl).collect();
      if self.done {
        continue;
      }
      self.decode_line(&line, &mut out)?;
    }
    Ok(out)
  }

  /// Decode whatever is left once the byte stream has ended.
  pub fn flush(&mut self) -> Result<Vec<String>, LlmError> {
    let mut out = Vec::new();
    let rest = std::mem::take(&mut self.buf);
    if !rest.is_empty() && !self.done {
      self.decode_line(&rest, &mut out)?;
    }
    Ok(out)
  }

  fn decode_line(&mut self, raw: &[u8], out: &mut Vec<String>) -> Result<(), LlmError> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    let Some(data) = line.strip_prefix("data:") else { return Ok(()) };
    let data = data.trim_start();
    if data.is_empty() {
      return Ok(());
    }
    if data.trim() == "[DONE]" {
      self.done = true;
      return Ok(());
    }
    match serde_json::from_str::<StreamChunk>(data) {
      Ok(chunk) => {
        for choice in chunk.choices {
          if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            out.push(text);
          }
        }
        Ok(())
      }
      Err(_) => match extract_openai_error(data) {
        Some(message) => Err(LlmError::Upstream { status: 200, message }),
        None => {
          warn!(data_len = data.len(), "Skipping undecodable stream chunk");
          Ok(())
        }
      },
    }
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
  model: &'a str,
  messages: &'a [ChatMessage],
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  top_p: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
  stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamChunk {
  #[serde(default)] choices: Vec<StreamChoice>,
}
#[derive(Deserialize)]
struct StreamChoice {
  #[serde(default)] delta: Delta,
}
#[derive(Deserialize, Default)]
struct Delta {
  #[serde(default)] content: Option<String>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
