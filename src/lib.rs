//! honyaku: Japanese to Chinese game-text translation over a pool of LLM
//! backends, with fragment dedup, automatic reconnection and ordered
//! reassembly.

pub mod backend;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod server;
pub mod translate;
pub mod worker;

pub use backend::{Backend, BackendKind, Connector, HttpConnector, TransportError};
pub use config::{BackendConfig, ConfigError, DispatchSettings, ServerList, Workspace};
pub use translate::{TranslateError, TranslateRequest, Translations, Translator};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("honyaku=info,tower_http=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
