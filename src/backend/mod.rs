//! Backend connections: one implementation per server kind plus the
//! connector that builds them from static configuration.

pub mod chat;
pub mod completion;
pub mod metered;
pub mod mock;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::translate::job::Job;

/// Server flavour, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Raw text-completion server with its own model loader.
    Completion,
    /// OpenAI-compatible chat completion server.
    Chat,
    /// Proxied, token-metered chat service.
    Metered,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completion" | "textgen" | "text-generation" => Some(Self::Completion),
            "chat" => Some(Self::Chat),
            "metered" | "openai" => Some(Self::Metered),
            _ => None,
        }
    }

    /// Chat models tend to wrap answers in quotes.
    pub fn is_chat_style(self) -> bool {
        !matches!(self, Self::Completion)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completion => "completion",
            Self::Chat => "chat",
            Self::Metered => "metered",
        };
        f.write_str(name)
    }
}

/// Any failure talking to a backend. Workers treat every variant as a
/// disconnect.
#[derive(Debug)]
pub enum TransportError {
    Connect(String),
    InvalidUrl(String),
    Timeout,
    Status { status: u16, body: String },
    Protocol(String),
    Unreachable(String),
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "connection error: {msg}"),
            TransportError::InvalidUrl(msg) => write!(f, "invalid backend url: {msg}"),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Status { status, body } => {
                write!(f, "unexpected status {status}: {body}")
            }
            TransportError::Protocol(msg) => write!(f, "malformed response: {msg}"),
            TransportError::Unreachable(name) => write!(f, "backend {name} is not responding"),
            TransportError::Closed => write!(f, "connection already closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_builder() {
            TransportError::InvalidUrl(e.to_string())
        } else if e.is_decode() {
            TransportError::Protocol(e.to_string())
        } else {
            TransportError::Connect(e.to_string())
        }
    }
}

/// A live connection to one translation server.
#[async_trait]
pub trait Backend: Send + Sync {
    fn config(&self) -> &BackendConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn kind(&self) -> BackendKind {
        self.config().kind
    }

    /// Never errors; any failure reads as not alive.
    async fn probe_alive(&self) -> bool;

    /// Make sure a model is loaded. `Ok(false)` when nothing can be loaded.
    async fn ensure_model_loaded(&self) -> Result<bool, TransportError>;

    /// One request/response exchange; returns the trimmed raw answer.
    async fn complete(&self, job: &Job) -> Result<String, TransportError>;

    /// Release the underlying client. Idempotent.
    async fn close(&self);
}

/// Builds live connections from static configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>, TransportError>;
}

/// Connector for real HTTP servers; picks the implementation by kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>, TransportError> {
        let backend: Arc<dyn Backend> = match config.kind {
            BackendKind::Completion => Arc::new(completion::TextGenerationBackend::new(config.clone())?),
            BackendKind::Chat => Arc::new(chat::ChatBackend::new(config.clone())?),
            BackendKind::Metered => Arc::new(metered::MeteredBackend::new(config.clone())?),
        };

        if backend.probe_alive().await {
            debug!(backend = %config.name, kind = %config.kind, address = %config.address, "backend_probe_ok");
            Ok(backend)
        } else {
            warn!(backend = %config.name, address = %config.address, "backend_probe_failed");
            backend.close().await;
            Err(TransportError::Unreachable(config.name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!(BackendKind::parse("Completion"), Some(BackendKind::Completion));
        assert_eq!(BackendKind::parse(" chat "), Some(BackendKind::Chat));
        assert_eq!(BackendKind::parse("metered"), Some(BackendKind::Metered));
        assert_eq!(BackendKind::parse("grpc"), None);
        assert_eq!(BackendKind::Metered.to_string(), "metered");
        assert!(!BackendKind::Completion.is_chat_style());
    }

    #[tokio::test]
    async fn connector_rejects_unreachable_server() {
        // Port 9 (discard) on localhost is not an HTTP server.
        let config = BackendConfig::new("dead", "http://127.0.0.1:9", BackendKind::Chat);
        let err = HttpConnector.connect(&config).await.err().unwrap();
        assert!(matches!(err, TransportError::Unreachable(ref n) if n == "dead"));
    }
}
