//! OpenAI-compatible chat completion servers.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::session::HttpSession;
use super::{Backend, TransportError};
use crate::config::BackendConfig;
use crate::translate::job::Job;

pub(crate) const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
pub(crate) const MODELS: &str = "/v1/models";

pub struct ChatBackend {
    config: BackendConfig,
    session: HttpSession,
}

impl ChatBackend {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let session = HttpSession::new(&config.address, config.credential.clone(), config.proxy.clone())?;
        Ok(Self { config, session })
    }
}

/// Request body for `/v1/chat/completions`. `model` is omitted when the
/// server picks its own.
pub fn chat_body(config: &BackendConfig, job: &Job) -> Value {
    let mut body = json!({
        "messages": job.render().to_messages(),
        "max_tokens": 512,
        "temperature": 0.1,
    });
    if let Some(model) = &config.model {
        body["model"] = Value::String(model.clone());
    }
    body
}

pub fn chat_content(res: &Value) -> Result<String, TransportError> {
    res.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|t| t.trim().to_string())
        .ok_or_else(|| TransportError::Protocol("missing choices[0].message.content".into()))
}

#[async_trait]
impl Backend for ChatBackend {
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
        let res = self.session.json(Method::POST, CHAT_COMPLETIONS, Some(&body)).await?;
        chat_content(&res)
    }

    async fn close(&self) {
        if self.session.close() {
            info!(backend = %self.config.name, "backend_closed");
        }
    }
}
