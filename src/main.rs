//! InkCraft · essay-continuation grading backend
//!
//! - Axum HTTP API (submit, poll, list, share, delete corrections)
//! - Staged LLM pipeline: score, upgrade suggestions, full rewrite, title, icon
//! - Static SPA fallback (./static/index.html)
//!
//! Important env variables:
//!   PORT                 : u16 (default 3000)
//!   OPENAI_API_KEY       : required for grading; without it submissions get 503
//!   OPENAI_BASE_URL      : default "https://api.openai.com/v1"
//!   OPENAI_STRONG_MODEL  : default "gpt-4o"
//!   OPENAI_FAST_MODEL    : default "gpt-4o-mini"
//!   OPENAI_TIMEOUT_SECS  : default 120
//!   INKCRAFT_CONFIG_PATH : path to TOML config (prompts + pipeline settings)
//!   LOG_LEVEL            : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT           : "pretty" (default), "compact" or "json"

mod telemetry;
mod util;
mod error;
mod domain;
mod config;
mod json_repair;
mod scoring;
mod progress;
mod llm;
mod store;
mod stages;
mod pipeline;
mod runner;
mod cache;
mod state;
mod protocol;
mod logic;
mod routes;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  let state = Arc::new(AppState::new());
  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "inkcraft_backend", %addr, llm = state.provider.is_some(), "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!(target: "inkcraft_backend", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "inkcraft_backend", error = %e, "Failed to listen for shutdown signal");
  }
}
