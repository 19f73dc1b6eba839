//! Run orchestration: connect the backend pool once, then for each batch
//! split lines into jobs, wait for the workers to drain the queue, and
//! reassemble the results in input order.

pub mod cache;
pub mod glossary;
pub mod job;
pub mod postprocess;
pub mod script;
pub mod split;
pub mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::Connector;
use crate::config::{BackendConfig, ConfigError, DispatchSettings};
use crate::metrics::{metric_names, MetricSummary, MetricsRegistry};
use crate::worker::Dispatcher;

use self::glossary::Glossary;
use self::job::{render_ja_zh, Renderer};
use self::store::StoreError;

pub use self::split::Translations;

/// One batch of lines plus where its results go.
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    pub lines: Vec<String>,
    pub strict: bool,
    pub glossary: Glossary,
    /// Prepare-text file updated with every reassembled line.
    pub target_out_file: Option<PathBuf>,
    /// Persisted translation cache merged with this run's results.
    pub cache_file: Option<PathBuf>,
}

impl TranslateRequest {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub enum TranslateError {
    Config(ConfigError),
    Store(StoreError),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::Config(e) => write!(f, "configuration error: {e}"),
            TranslateError::Store(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for TranslateError {}

impl From<ConfigError> for TranslateError {
    fn from(e: ConfigError) -> Self {
        TranslateError::Config(e)
    }
}

impl From<StoreError> for TranslateError {
    fn from(e: StoreError) -> Self {
        TranslateError::Store(e)
    }
}

/// Owns the dispatcher and serializes runs over it.
pub struct Translator {
    dispatcher: Arc<Dispatcher>,
    renderer: Renderer,
    run_lock: tokio::sync::Mutex<()>,
}

impl Translator {
    /// Connect every enabled backend, load default models and start one
    /// worker per live connection. Zero live backends is fatal.
    pub async fn connect(
        configs: &[BackendConfig],
        connector: Arc<dyn Connector>,
        settings: DispatchSettings,
    ) -> Result<Self, TranslateError> {
        let dispatcher = Dispatcher::new(connector, settings, Arc::new(MetricsRegistry::new()));

        let joined = dispatcher.connect_all(configs).await;
        if joined == 0 {
            return Err(ConfigError::NoBackends.into());
        }
        dispatcher.pool.ensure_models_loaded().await;
        dispatcher.start_workers();
        info!(backends = ?dispatcher.pool.names(), "translator_ready");

        Ok(Self {
            dispatcher,
            renderer: render_ja_zh,
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Swap the prompt renderer used for new jobs.
    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn backends(&self) -> Vec<String> {
        self.dispatcher.pool.names()
    }

    pub fn metrics_summary(&self) -> BTreeMap<String, MetricSummary> {
        self.dispatcher.metrics.summary()
    }

    /// Translate one batch. Returns once every queued job, including any
    /// requeued after a disconnect, has completed.
    pub async fn translate(&self, request: TranslateRequest) -> Result<Translations, TranslateError> {
        let _run = self.run_lock.lock().await;
        let run_id = uuid::Uuid::new_v4();
        let span = self.dispatcher.metrics.span(metric_names::RUN_TOTAL);
        let ctx = &self.dispatcher;

        ctx.reset_run();
        let mut plan = split::split(
            &request.lines,
            &request.glossary,
            request.strict,
            self.renderer,
            &ctx.cache,
        );
        let jobs = plan.take_jobs();
        info!(
            %run_id,
            lines = request.lines.len(),
            jobs = jobs.len(),
            glossary_hits = plan.glossary_hits(),
            strict = request.strict,
            "run_started"
        );

        for job in jobs {
            ctx.queue.push(job);
        }
        ctx.queue.join().await;

        let translations = plan.reassemble(&request.lines, &ctx.cache);
        info!(%run_id, cached = ctx.cache.len(), "replace_data_ready");

        if let Some(target) = &request.target_out_file {
            store::merge_into(target, translations.iter())?;
        }
        if let Some(cache_file) = &request.cache_file {
            store::merge_into(cache_file, translations.iter())?;
        }

        let elapsed_us = span.finish();
        for (name, m) in self.metrics_summary() {
            info!(
                %run_id,
                metric = %name,
                p50_us = m.p50_us,
                p95_us = m.p95_us,
                max_us = m.max_us,
                count = m.count,
                "metric_summary"
            );
        }
        info!(%run_id, lines = translations.len(), elapsed_ms = elapsed_us / 1000.0, "run_finished");
        Ok(translations)
    }

    pub fn shutdown(&self) {
        if self.dispatcher.queue.unfinished() > 0 {
            warn!(unfinished = self.dispatcher.queue.unfinished(), "shutdown_with_pending_jobs");
        }
        self.dispatcher.shutdown();
    }
}

impl Drop for Translator {
    fn drop(&mut self) {
        if !self.dispatcher.is_shut_down() {
            self.dispatcher.shutdown();
        }
    }
}
