//! Proxied, token-metered chat services.
//! Adds request pacing, retry on 429/5xx and token usage accounting on top of
//! the chat protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::chat::{chat_body, chat_content, CHAT_COMPLETIONS, MODELS};
use super::session::{expect_json, HttpSession};
use super::{Backend, TransportError};
use crate::config::BackendConfig;
use crate::translate::job::Job;

const MAX_429_RETRIES: u32 = 3;
const MAX_5XX_RETRIES: u32 = 2;

pub struct MeteredBackend {
    config: BackendConfig,
    session: HttpSession,
    /// Next instant a request may be sent.
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
    tokens_used: AtomicU64,
}

impl MeteredBackend {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let session = HttpSession::new(&config.address, config.credential.clone(), config.proxy.clone())?;
        Ok(Self {
            config,
            session,
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval: Duration::from_millis(100),
            tokens_used: AtomicU64::new(0),
        })
    }

    /// Total tokens billed to this connection so far.
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// 429: Retry-After or 1s/2s/4s (max 3). 5xx: exponential backoff
    /// (max 2). Timeout: one immediate retry.
    async fn send_with_retry(&self, body: &Value) -> Result<Value, TransportError> {
        let mut attempt: u32 = 0;
        let mut timeout_retried = false;

        loop {
            self.rate_limit_wait().await;
            let result = self
                .session
                .request(Method::POST, CHAT_COMPLETIONS)?
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() == 429 && attempt < MAX_429_RETRIES => {
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(backend = %self.config.name, attempt, wait_ms = wait.as_millis() as u64, "rate_limited_retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() && attempt < MAX_5XX_RETRIES => {
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        backend = %self.config.name,
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "server_error_retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) => return expect_json(resp).await,
                Err(e) if e.is_timeout() && !timeout_retried => {
                    warn!(backend = %self.config.name, "request_timeout_retrying");
                    timeout_retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Backend for MeteredBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn probe_alive(&self) -> bool {
        self.session.json(Method::GET, MODELS, None).await.is_ok()
    }

    async fn ensure_model_loaded(&self) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn complete(&self, job: &Job) -> Result<String, TransportError> {
        let body = chat_body(&self.config, job);
        let res = self.send_with_retry(&body).await?;

        if let Some(total) = res.pointer("/usage/total_tokens").and_then(Value::as_u64) {
            let sum = self.tokens_used.fetch_add(total, Ordering::Relaxed) + total;
            debug!(backend = %self.config.name, tokens = total, total_tokens = sum, "tokens_metered");
        }
        chat_content(&res)
    }

    async fn close(&self) {
        if self.session.close() {
            info!(backend = %self.config.name, total_tokens = self.tokens_used(), "backend_closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    #[tokio::test]
    async fn pacing_spaces_requests() {
        let backend =
            MeteredBackend::new(BackendConfig::new("m", "https://api.example.com", BackendKind::Metered)).unwrap();
        let start = Instant::now();
        backend.rate_limit_wait().await;
        backend.rate_limit_wait().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(backend.tokens_used(), 0);
    }
}
