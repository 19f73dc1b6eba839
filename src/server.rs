//! HTTP surface for game-side hooks: `POST /translateJP` translates a batch
//! of lines. Backends connect on the first request and stay connected.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, options, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::backend::Connector;
use crate::config::{BackendConfig, ConfigError, DispatchSettings};
use crate::metrics::MetricSummary;
use crate::translate::glossary::{Glossary, GlossaryEntry};
use crate::translate::{TranslateError, TranslateRequest, Translator};

#[derive(Debug, Deserialize)]
pub struct TranslateJpRequest {
    pub text_list: Option<Vec<String>>,
    pub target_out_file: Option<PathBuf>,
    pub tran_cache_file: Option<PathBuf>,
    #[serde(default)]
    pub is_strictest: bool,
    pub glossary_path: Option<PathBuf>,
    pub glossary: Option<Vec<GlossaryEntry>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

struct ServiceState {
    servers: Vec<BackendConfig>,
    connector: Arc<dyn Connector>,
    settings: DispatchSettings,
    translator: OnceCell<Translator>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<ServiceState>,
}

impl AppState {
    pub fn new(servers: Vec<BackendConfig>, connector: Arc<dyn Connector>, settings: DispatchSettings) -> Self {
        Self {
            inner: Arc::new(ServiceState {
                servers,
                connector,
                settings,
                translator: OnceCell::new(),
            }),
        }
    }

    async fn translator(&self) -> Result<&Translator, TranslateError> {
        let inner = &self.inner;
        inner
            .translator
            .get_or_try_init(|| {
                Translator::connect(&inner.servers, Arc::clone(&inner.connector), inner.settings.clone())
            })
            .await
    }

    pub fn shutdown(&self) {
        if let Some(translator) = self.inner.translator.get() {
            translator.shutdown();
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", options(health))
        .route("/translateJP", post(translate_jp))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server_listening");
    let shutdown_state = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("server_shutdown");
            shutdown_state.shutdown();
        })
        .await
}

async fn health() -> Json<&'static str> {
    Json("OK")
}

async fn translate_jp(
    State(state): State<AppState>,
    Json(request): Json<TranslateJpRequest>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    let lines = match request.text_list {
        Some(lines) if !lines.is_empty() => lines,
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "Missing text parameter")),
    };

    let glossary = match (request.glossary, &request.glossary_path) {
        (Some(entries), _) => Glossary::from_entries(entries),
        (None, Some(path)) => Glossary::load_from_file(path)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?,
        (None, None) => Glossary::empty(),
    };

    let translator = state.translator().await.map_err(|e| {
        error!(error = %e, "translator_unavailable");
        match e {
            TranslateError::Config(ConfigError::NoBackends) => {
                api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    })?;

    let translations = translator
        .translate(TranslateRequest {
            lines,
            strict: request.is_strictest,
            glossary,
            target_out_file: request.target_out_file,
            cache_file: request.tran_cache_file,
        })
        .await
        .map_err(|e| {
            error!(error = %e, "translate_failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(translations.to_json_map()))
}

async fn metrics(State(state): State<AppState>) -> Json<BTreeMap<String, MetricSummary>> {
    let summary = state
        .inner
        .translator
        .get()
        .map(Translator::metrics_summary)
        .unwrap_or_default();
    Json(summary)
}
