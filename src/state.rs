//! Application state: record store, chat provider, job runner, config, quote cache.
//!
//! The provider is optional. Without OPENAI_API_KEY the service still serves
//! stored corrections, but nothing can be graded.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::cache::TtlCache;
use crate::config::{load_config_from_env, AppConfig, PipelineSettings, Prompts};
use crate::error::LlmError;
use crate::llm::{ChatProvider, OpenAI};
use crate::pipeline::Pipeline;
use crate::progress::{LogSink, ProgressSink};
use crate::runner::JobRunner;
use crate::store::{MemoryStore, RecordStore};

pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub provider: Option<Arc<dyn ChatProvider>>,
    pub runner: Option<JobRunner>,
    pub prompts: Arc<Prompts>,
    pub settings: Arc<PipelineSettings>,
    pub quote_cache: TtlCache<String>,
}

impl AppState {
    /// Build state from env: load config, init OpenAI, start with an empty memory store.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_config_from_env();

        let openai = OpenAI::from_env();
        if let Some(oa) = &openai {
            info!(target: "inkcraft_backend", base_url = %oa.base_url, strong_model = %cfg.pipeline.strong_model, fast_model = %cfg.pipeline.fast_model, "OpenAI enabled.");
        } else {
            warn!(target: "inkcraft_backend", "OpenAI disabled (no OPENAI_API_KEY). Submissions will be rejected.");
        }
        let provider = openai.map(|oa| Arc::new(oa) as Arc<dyn ChatProvider>);

        Self::from_parts(cfg, Arc::new(MemoryStore::new()), provider, Arc::new(LogSink))
    }

    /// Wire state from explicit parts.
    pub fn from_parts(
        cfg: AppConfig,
        store: Arc<dyn RecordStore>,
        provider: Option<Arc<dyn ChatProvider>>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let prompts = Arc::new(cfg.prompts);
        let settings = Arc::new(cfg.pipeline);
        let runner = provider.as_ref().map(|p| {
            let pipeline = Pipeline::new(p.clone(), store.clone(), prompts.clone(), settings.clone(), sink);
            JobRunner::new(Arc::new(pipeline))
        });
        let quote_cache = TtlCache::new(Duration::from_secs(settings.quote_ttl_secs));

        Self { store, provider, runner, prompts, settings, quote_cache }
    }

    /// The runner, or `NotConfigured` when no provider is available.
    pub fn runner(&self) -> Result<&JobRunner, LlmError> {
        self.runner.as_ref().ok_or(LlmError::NotConfigured)
    }
}
