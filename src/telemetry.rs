//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! Behavior:
//! - LOG_LEVEL controls the filter (e.g. "debug" or detailed directives like
//!   "info,pipeline=debug,inkcraft_backend=debug,tower_http=info,axum=info").
//! - LOG_FORMAT selects "pretty" (default), "compact", or "json" structured logs.
//!
//! Targets in use: `inkcraft_backend` (startup, handlers) and `pipeline`
//! (stage progress, score fallback, job failures). Essays only ever appear
//! truncated.

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new("info,pipeline=info,inkcraft_backend=debug,tower_http=info,axum=info")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => {
            builder.json().with_current_span(true).init();
        }
        Ok("compact") => {
            builder.compact().init();
        }
        _ => {
            builder.init();
        }
    }
}
