//! In-process backends for tests and `--mock` dry runs.
//!
//! A [`MockBackend`] answers deterministically and can be scripted to fail
//! or echo its input a number of times before behaving. A [`MockConnector`]
//! hands out scripted instances per server name, so a reconnect after a
//! failure yields a fresh instance.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Backend, Connector, TransportError};
use crate::config::BackendConfig;
use crate::translate::job::Job;

#[derive(Debug, Clone)]
pub enum MockMode {
    /// Append a suffix: "はい" -> "はい_zh".
    Suffix(String),
    /// Fixed answers; unmapped fragments fall back to a `_zh` suffix.
    Mappings(HashMap<String, String>),
    /// Same answer for every fragment.
    Fixed(String),
    /// Return the fragment unchanged.
    Echo,
}

pub struct MockBackend {
    config: BackendConfig,
    mode: MockMode,
    delay: Duration,
    alive: AtomicBool,
    fail_next: AtomicUsize,
    echo_next: AtomicUsize,
    calls: AtomicUsize,
    ensure_calls: AtomicUsize,
    closes: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(config: BackendConfig, mode: MockMode) -> Self {
        Self {
            config,
            mode,
            delay: Duration::ZERO,
            alive: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            echo_next: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            ensure_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Simulated per-request latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `n` completions fail with a transport error.
    pub fn failing(self, n: usize) -> Self {
        self.fail_next.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` completions echo the fragment back.
    pub fn echoing(self, n: usize) -> Self {
        self.echo_next.store(n, Ordering::SeqCst);
        self
    }

    /// Probe result; a dead mock is refused by the connector.
    pub fn dead(self) -> Self {
        self.alive.store(false, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Fragments this instance was asked to translate, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    fn answer(&self, text: &str) -> String {
        match &self.mode {
            MockMode::Suffix(suffix) => format!("{text}{suffix}"),
            MockMode::Mappings(map) => map.get(text).cloned().unwrap_or_else(|| format!("{text}_zh")),
            MockMode::Fixed(answer) => answer.clone(),
            MockMode::Echo => text.to_string(),
        }
    }
}

/// Decrement `counter` if positive; true when a unit was taken.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Backend for MockBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn probe_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.closes() == 0
    }

    async fn ensure_model_loaded(&self) -> Result<bool, TransportError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn complete(&self, job: &Job) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(job.fragment.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if take_one(&self.fail_next) {
            return Err(TransportError::Connect(format!("{} dropped the connection", self.config.name)));
        }
        if take_one(&self.echo_next) {
            return Ok(job.fragment.to_string());
        }
        Ok(self.answer(&job.fragment))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out scripted [`MockBackend`]s by server name, falling back to a
/// fresh instance in `fallback` mode when the script runs out.
#[derive(Default)]
pub struct MockConnector {
    scripted: Mutex<HashMap<String, VecDeque<Arc<MockBackend>>>>,
    refusals: Mutex<HashMap<String, usize>>,
    fallback: Option<MockMode>,
    attempts: AtomicUsize,
    issued: Mutex<Vec<Arc<MockBackend>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect succeeds with a fresh backend in `mode`.
    pub fn always(mode: MockMode) -> Self {
        Self {
            fallback: Some(mode),
            ..Self::default()
        }
    }

    /// Queue an instance for the server its config names.
    pub fn script(self, backend: MockBackend) -> Self {
        self.scripted
            .lock()
            .entry(backend.config.name.clone())
            .or_default()
            .push_back(Arc::new(backend));
        self
    }

    /// Refuse the next `n` connects to `name` that find no scripted instance.
    pub fn refuse(self, name: &str, n: usize) -> Self {
        self.refusals.lock().insert(name.to_string(), n);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Instances handed out for `name`, oldest first.
    pub fn issued(&self, name: &str) -> Vec<Arc<MockBackend>> {
        self.issued
            .lock()
            .iter()
            .filter(|b| b.config.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .scripted
            .lock()
            .get_mut(&config.name)
            .and_then(VecDeque::pop_front);
        let backend = match scripted {
            Some(b) => b,
            None => {
                let mut refusals = self.refusals.lock();
                if let Some(left) = refusals.get_mut(&config.name).filter(|n| **n > 0) {
                    *left -= 1;
                    return Err(TransportError::Unreachable(config.name.clone()));
                }
                match &self.fallback {
                    Some(mode) => Arc::new(MockBackend::new(config.clone(), mode.clone())),
                    None => return Err(TransportError::Unreachable(config.name.clone())),
                }
            }
        };

        if !backend.probe_alive().await {
            return Err(TransportError::Unreachable(config.name.clone()));
        }
        self.issued.lock().push(Arc::clone(&backend));
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::translate::job::render_ja_zh;

    fn config(name: &str) -> BackendConfig {
        BackendConfig::new(name, "mock://", BackendKind::Completion)
    }

    #[tokio::test]
    async fn scripted_failures_then_answers() {
        let mock = MockBackend::new(config("a"), MockMode::Suffix("_zh".into())).failing(1).echoing(1);
        let job = Job::new(render_ja_zh, "はい", Vec::new(), false);
        assert!(mock.complete(&job).await.is_err());
        assert_eq!(mock.complete(&job).await.unwrap(), "はい");
        assert_eq!(mock.complete(&job).await.unwrap(), "はい_zh");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn connector_refuses_then_falls_back() {
        let connector = MockConnector::always(MockMode::Echo).refuse("a", 2);
        assert!(connector.connect(&config("a")).await.is_err());
        assert!(connector.connect(&config("a")).await.is_err());
        assert!(connector.connect(&config("a")).await.is_ok());
        assert_eq!(connector.attempts(), 3);
        assert_eq!(connector.issued("a").len(), 1);
    }

    #[tokio::test]
    async fn connector_without_script_or_fallback_fails() {
        let connector = MockConnector::new().script(MockBackend::new(config("a"), MockMode::Echo));
        assert!(connector.connect(&config("a")).await.is_ok());
        assert!(connector.connect(&config("a")).await.is_err());
        assert!(connector.connect(&config("b")).await.is_err());
    }
}
