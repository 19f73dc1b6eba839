//! Worker loops and reconnection supervisors.
//!
//! One worker task drains the shared queue per live backend. A transport
//! failure retires the worker: the backend is closed and dropped from the
//! pool, the in-flight job goes back on the queue, and a supervisor task
//! keeps reconnecting from static config until a fresh worker can take over.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendKind, Connector, TransportError};
use crate::config::{BackendConfig, DispatchSettings};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::pool::BackendPool;
use crate::queue::{DispatchQueue, Ticket};
use crate::translate::cache::{short_hex, Fingerprint, FingerprintCache};
use crate::translate::postprocess::PostProcess;

/// Lifecycle of one backend slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Running => "RUNNING",
            WorkerState::Disconnected => "DISCONNECTED",
            WorkerState::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

fn transition(backend: &str, from: WorkerState, to: WorkerState) {
    info!(backend, from = %from, to = %to, "worker_state_transition");
}

/// Everything workers and supervisors share for the lifetime of a service.
pub struct Dispatcher {
    pub queue: Arc<DispatchQueue>,
    pub cache: Arc<FingerprintCache>,
    pub pool: Arc<BackendPool>,
    pub metrics: Arc<MetricsRegistry>,
    connector: Arc<dyn Connector>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
    /// Echoed answers seen so far per in-flight fragment.
    no_progress: Mutex<HashMap<Fingerprint, u32>>,
}

/// What a worker does after handling one ticket.
enum Outcome {
    Continue,
    Disconnected(Ticket, TransportError),
}

impl Dispatcher {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: DispatchSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: DispatchQueue::new(),
            cache: Arc::new(FingerprintCache::new()),
            pool: Arc::new(BackendPool::new()),
            metrics,
            connector,
            settings,
            shutdown: CancellationToken::new(),
            no_progress: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Initial connection attempt for every config. Failures are logged and
    /// not retried; returns the number of backends that joined the pool.
    pub async fn connect_all(&self, configs: &[BackendConfig]) -> usize {
        let mut joined = 0;
        for config in configs.iter().filter(|c| c.enabled) {
            match self.connector.connect(config).await {
                Ok(backend) => {
                    self.pool.add(backend);
                    joined += 1;
                }
                Err(e) => error!(backend = %config.name, address = %config.address, error = %e, "backend_connect_failed"),
            }
        }
        joined
    }

    /// Spawn one worker per current pool member.
    pub fn start_workers(self: &Arc<Self>) {
        for backend in self.pool.snapshot() {
            spawn_worker(Arc::clone(self), backend);
        }
    }

    /// Stop idle workers and pending supervisors.
    pub fn shutdown(&self) {
        info!("dispatcher_shutdown");
        self.shutdown.cancel();
    }

    /// Forget per-run state before a new batch is split.
    pub fn reset_run(&self) {
        self.cache.clear();
        self.no_progress.lock().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn handle(&self, backend: &Arc<dyn Backend>, ticket: Ticket) -> Outcome {
        let job = ticket.job().clone();
        let key = *job.fingerprint();

        if self.cache.contains(&key) {
            debug!(backend = %backend.name(), key = %short_hex(&key), "fragment_already_translated");
            ticket.done();
            return Outcome::Continue;
        }

        if self.should_defer(backend) {
            debug!(backend = %backend.name(), key = %short_hex(&key), "job_deferred");
            ticket.requeue();
            tokio::time::sleep(self.settings.defer_backoff).await;
            return Outcome::Continue;
        }

        let span = self.metrics.span(metric_names::BACKEND_COMPLETE);
        let raw = match backend.complete(&job).await {
            Ok(raw) => raw,
            Err(e) => return Outcome::Disconnected(ticket, e),
        };
        span.finish();

        let translated = PostProcess {
            strict: job.strict,
            chat_style: backend.kind().is_chat_style(),
            overlength_limit: self.settings.overlength_limit,
        }
        .apply(&job.fragment, &raw);

        if raw.trim() == &*job.fragment || translated == *job.fragment {
            let echoes = {
                let mut seen = self.no_progress.lock();
                let count = seen.entry(key).or_insert(0);
                *count += 1;
                *count
            };
            if echoes <= self.settings.max_no_progress_retries {
                warn!(backend = %backend.name(), fragment = %job.fragment, echoes, "no_progress_requeued");
                ticket.requeue();
                tokio::time::sleep(self.settings.no_progress_backoff).await;
                return Outcome::Continue;
            }
            warn!(backend = %backend.name(), fragment = %job.fragment, echoes, "no_progress_accepted");
        }
        self.no_progress.lock().remove(&key);

        info!(
            backend = %backend.name(),
            remaining = self.queue.len(),
            source = %job.fragment,
            translated = %translated,
            "fragment_translated"
        );
        self.cache.put(key, translated);
        ticket.done();
        Outcome::Continue
    }

    /// Non-completion backends leave the last queued job to a completion
    /// backend when one is live.
    fn should_defer(&self, backend: &Arc<dyn Backend>) -> bool {
        let Some(threshold) = self.settings.defer_when_backends_at_least else {
            return false;
        };
        if backend.kind() == BackendKind::Completion || !self.queue.is_empty() {
            return false;
        }
        let members = self.pool.snapshot();
        members.len() >= threshold
            && members
                .iter()
                .any(|m| m.kind() == BackendKind::Completion && !Arc::ptr_eq(m, backend))
    }

    async fn disconnect(self: &Arc<Self>, backend: Arc<dyn Backend>, ticket: Ticket, err: TransportError) {
        error!(backend = %backend.name(), error = %err, "backend_transport_error");
        transition(backend.name(), WorkerState::Running, WorkerState::Disconnected);
        backend.close().await;
        self.pool.remove(&backend);
        warn!(backend = %backend.name(), fragment = %ticket.job().fragment, "in_flight_job_requeued");
        ticket.requeue();
        spawn_supervisor(Arc::clone(self), backend.config().clone());
    }
}

/// Spawn the worker loop for `backend`.
pub fn spawn_worker(ctx: Arc<Dispatcher>, backend: Arc<dyn Backend>) -> JoinHandle<()> {
    tokio::spawn(worker_loop(ctx, backend))
}

/// Spawn a supervisor that reconnects `config` and then hands off to a new worker.
pub fn spawn_supervisor(ctx: Arc<Dispatcher>, config: BackendConfig) -> JoinHandle<()> {
    tokio::spawn(supervise(ctx, config))
}

async fn worker_loop(ctx: Arc<Dispatcher>, backend: Arc<dyn Backend>) {
    info!(backend = %backend.name(), kind = %backend.kind(), "worker_started");

    loop {
        let ticket = tokio::select! {
            ticket = ctx.queue.pop() => ticket,
            _ = ctx.shutdown.cancelled() => {
                info!(backend = %backend.name(), "worker_stopped");
                backend.close().await;
                ctx.pool.remove(&backend);
                return;
            }
        };
        ctx.metrics.record_duration(metric_names::QUEUE_WAIT, ticket.waited());

        match ctx.handle(&backend, ticket).await {
            Outcome::Continue => {}
            Outcome::Disconnected(ticket, err) => {
                ctx.disconnect(backend, ticket, err).await;
                return;
            }
        }
    }
}

async fn supervise(ctx: Arc<Dispatcher>, config: BackendConfig) {
    transition(&config.name, WorkerState::Disconnected, WorkerState::Reconnecting);
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        match ctx.connector.connect(&config).await {
            Ok(backend) => match backend.ensure_model_loaded().await {
                Ok(_) => {
                    ctx.pool.add(Arc::clone(&backend));
                    transition(&config.name, WorkerState::Reconnecting, WorkerState::Running);
                    info!(backend = %config.name, attempt, "backend_reconnected");
                    spawn_worker(Arc::clone(&ctx), backend);
                    return;
                }
                Err(e) => {
                    warn!(backend = %config.name, attempt, error = %e, "model_load_failed_after_reconnect");
                    backend.close().await;
                }
            },
            Err(e) => debug!(backend = %config.name, attempt, error = %e, "reconnect_failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.settings.reconnect_interval) => {}
            _ = ctx.shutdown.cancelled() => {
                info!(backend = %config.name, "supervisor_stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockConnector, MockMode};
    use crate::translate::cache::fingerprint;
    use crate::translate::job::{render_ja_zh, Job};
    use std::time::Duration;

    fn config(name: &str, kind: BackendKind) -> BackendConfig {
        BackendConfig::new(name, "mock://", kind)
    }

    fn fast_settings() -> DispatchSettings {
        DispatchSettings {
            reconnect_interval: Duration::from_millis(10),
            defer_backoff: Duration::from_millis(5),
            no_progress_backoff: Duration::from_millis(1),
            ..DispatchSettings::default()
        }
    }

    fn job(text: &str) -> Job {
        Job::new(render_ja_zh, text, Vec::new(), false)
    }

    #[tokio::test]
    async fn drains_queue_into_cache() {
        let connector = Arc::new(MockConnector::always(MockMode::Suffix("_zh".into())));
        let ctx = Dispatcher::new(connector, fast_settings(), Arc::new(MetricsRegistry::new()));
        assert_eq!(ctx.connect_all(&[config("a", BackendKind::Completion)]).await, 1);
        ctx.start_workers();

        ctx.queue.push(job("一つ"));
        ctx.queue.push(job("二つ"));
        ctx.queue.join().await;

        assert_eq!(ctx.cache.get(&fingerprint("一つ")).as_deref(), Some("一つ_zh"));
        assert_eq!(ctx.cache.get(&fingerprint("二つ")).as_deref(), Some("二つ_zh"));
        ctx.shutdown();
    }

    #[tokio::test]
    async fn echo_is_retried_until_progress() {
        let connector = Arc::new(MockConnector::new().script(
            MockBackend::new(config("a", BackendKind::Completion), MockMode::Suffix("_zh".into())).echoing(2),
        ));
        let ctx = Dispatcher::new(connector.clone(), fast_settings(), Arc::new(MetricsRegistry::new()));
        ctx.connect_all(&[config("a", BackendKind::Completion)]).await;
        ctx.start_workers();

        ctx.queue.push(job("もう一度"));
        ctx.queue.join().await;

        assert_eq!(ctx.cache.get(&fingerprint("もう一度")).as_deref(), Some("もう一度_zh"));
        assert_eq!(connector.issued("a")[0].calls(), 3);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn persistent_echo_is_accepted_after_retries() {
        let connector = Arc::new(MockConnector::always(MockMode::Echo));
        let ctx = Dispatcher::new(connector.clone(), fast_settings(), Arc::new(MetricsRegistry::new()));
        ctx.connect_all(&[config("a", BackendKind::Completion)]).await;
        ctx.start_workers();

        ctx.queue.push(job("大学"));
        tokio::time::timeout(Duration::from_secs(2), ctx.queue.join())
            .await
            .expect("join returns once the echo is accepted");

        assert_eq!(ctx.cache.get(&fingerprint("大学")).as_deref(), Some("大学"));
        let limit = ctx.settings().max_no_progress_retries as usize;
        assert_eq!(connector.issued("a")[0].calls(), limit + 1);
        assert!(ctx.no_progress.lock().is_empty());
        ctx.shutdown();
    }

    #[tokio::test]
    async fn quoted_echo_from_chat_counts_as_no_progress() {
        let connector = Arc::new(MockConnector::new().script(
            MockBackend::new(config("a", BackendKind::Chat), MockMode::Fixed("「日本語」".into())),
        ));
        let settings = DispatchSettings {
            max_no_progress_retries: 1,
            ..fast_settings()
        };
        let ctx = Dispatcher::new(connector.clone(), settings, Arc::new(MetricsRegistry::new()));
        ctx.connect_all(&[config("a", BackendKind::Chat)]).await;
        ctx.start_workers();

        ctx.queue.push(job("日本語"));
        ctx.queue.join().await;

        assert_eq!(ctx.cache.get(&fingerprint("日本語")).as_deref(), Some("日本語"));
        assert_eq!(connector.issued("a")[0].calls(), 2);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn disconnect_hands_off_to_supervisor() {
        let connector = Arc::new(
            MockConnector::new()
                .script(MockBackend::new(config("a", BackendKind::Completion), MockMode::Fixed("好".into())).failing(1))
                .script(MockBackend::new(config("a", BackendKind::Completion), MockMode::Fixed("好".into()))),
        );
        let ctx = Dispatcher::new(connector.clone(), fast_settings(), Arc::new(MetricsRegistry::new()));
        ctx.connect_all(&[config("a", BackendKind::Completion)]).await;
        ctx.start_workers();

        ctx.queue.push(job("良い"));
        ctx.queue.join().await;

        let issued = connector.issued("a");
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0].closes(), 1);
        assert_eq!(issued[1].ensure_calls(), 1);
        assert_eq!(ctx.cache.get(&fingerprint("良い")).as_deref(), Some("好"));
        assert_eq!(ctx.pool.len(), 1);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn cached_fragment_skips_backend() {
        let connector = Arc::new(MockConnector::always(MockMode::Fixed("新".into())));
        let ctx = Dispatcher::new(connector.clone(), fast_settings(), Arc::new(MetricsRegistry::new()));
        ctx.connect_all(&[config("a", BackendKind::Completion)]).await;
        ctx.cache.put(fingerprint("古い"), "旧".into());
        ctx.start_workers();

        ctx.queue.push(job("古い"));
        ctx.queue.join().await;

        assert_eq!(ctx.cache.get(&fingerprint("古い")).as_deref(), Some("旧"));
        assert_eq!(connector.issued("a")[0].calls(), 0);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn metered_defers_last_job_to_completion() {
        let connector = Arc::new(MockConnector::always(MockMode::Suffix("_zh".into())));
        let ctx = Dispatcher::new(connector, fast_settings(), Arc::new(MetricsRegistry::new()));
        ctx.connect_all(&[config("local", BackendKind::Completion), config("hosted", BackendKind::Metered)])
            .await;
        let hosted = ctx
            .pool
            .snapshot()
            .into_iter()
            .find(|b| b.kind() == BackendKind::Metered)
            .unwrap();

        assert!(ctx.queue.is_empty());
        assert!(ctx.should_defer(&hosted));
        ctx.queue.push(job("待つ"));
        assert!(!ctx.should_defer(&hosted));
    }

    #[tokio::test]
    async fn shutdown_stops_supervisor() {
        let connector = Arc::new(MockConnector::new());
        let ctx = Dispatcher::new(connector.clone(), fast_settings(), Arc::new(MetricsRegistry::new()));
        let handle = spawn_supervisor(Arc::clone(&ctx), config("gone", BackendKind::Chat));
        tokio::time::sleep(Duration::from_millis(35)).await;
        ctx.shutdown();
        handle.await.unwrap();
        assert!(connector.attempts() >= 2);
        assert!(ctx.is_shut_down());
    }
}
