//! Raw text-completion servers (text-generation-webui style API) that load
//! their own models on request.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::session::HttpSession;
use super::{Backend, TransportError};
use crate::config::BackendConfig;
use crate::translate::job::Job;

const STATE: &str = "/";
const COMPLETIONS: &str = "/v1/completions";
const MODEL_INFO: &str = "/v1/internal/model/info";
const MODEL_LIST: &str = "/v1/internal/model/list";
const MODEL_LOAD: &str = "/v1/internal/model/load";

/// The loader reports this name when no model is resident.
const NO_MODEL: &str = "None";

pub struct TextGenerationBackend {
    config: BackendConfig,
    session: HttpSession,
}

impl TextGenerationBackend {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let session = HttpSession::new(&config.address, config.credential.clone(), config.proxy.clone())?;
        Ok(Self { config, session })
    }

    pub async fn current_model(&self) -> Result<String, TransportError> {
        let info = self.session.json(Method::GET, MODEL_INFO, None).await?;
        info.get("model_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("model info without model_name".into()))
    }

    pub async fn model_list(&self) -> Result<Vec<String>, TransportError> {
        let list = self.session.json(Method::GET, MODEL_LIST, None).await?;
        let names = list
            .get("model_names")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Protocol("model list without model_names".into()))?;
        Ok(names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    pub async fn load_model(&self, model: &str) -> Result<bool, TransportError> {
        info!(backend = %self.config.name, model, "model_loading");
        let body = json!({
            "model_name": model,
            "args": Value::Object(self.config.model_args(model)),
        });
        let res = self.session.json(Method::POST, MODEL_LOAD, Some(&body)).await?;
        Ok(res == "OK")
    }
}

/// Request body for `/v1/completions`.
pub fn completion_body(prompt: &str) -> Value {
    json!({
        "prompt": prompt,
        "max_tokens": 512,
        "temperature": 0.1,
        "top_p": 0.3,
        "top_k": 40,
        "repetition_penalty": 1,
        "frequency_penalty": 0.05,
        "do_sample": true,
        "num_beams": 1,
    })
}

#[async_trait]
impl Backend for TextGenerationBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn probe_alive(&self) -> bool {
        match self.session.json(Method::OPTIONS, STATE, None).await {
            Ok(v) => v == "OK",
            Err(_) => false,
        }
    }

    async fn ensure_model_loaded(&self) -> Result<bool, TransportError> {
        let loaded = self.current_model().await?;
        match self.config.model.as_deref() {
            Some(wanted) if loaded == wanted => Ok(true),
            Some(wanted) => self.load_model(wanted).await,
            None if loaded != NO_MODEL => Ok(true),
            None => {
                let models = self.model_list().await?;
                match models.first() {
                    Some(first) => self.load_model(first).await,
                    None => {
                        warn!(backend = %self.config.name, "no_models_available");
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn complete(&self, job: &Job) -> Result<String, TransportError> {
        let body = completion_body(&job.render().to_chatml());
        let res = self.session.json(Method::POST, COMPLETIONS, Some(&body)).await?;
        res.pointer("/choices/0/text")
            .and_then(Value::as_str)
            .map(|t| t.trim().to_string())
            .ok_or_else(|| TransportError::Protocol("missing choices[0].text".into()))
    }

    async fn close(&self) {
        if self.session.close() {
            info!(backend = %self.config.name, "backend_closed");
        }
    }
}
