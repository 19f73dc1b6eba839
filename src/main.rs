use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use honyaku::backend::mock::{MockConnector, MockMode};
use honyaku::config::DEFAULT_SERVER_LIST;
use honyaku::server::{self, AppState};
use honyaku::translate::glossary::Glossary;
use honyaku::translate::store::{self, JsonJob};
use honyaku::{
    BackendConfig, Connector, DispatchSettings, HttpConnector, ServerList, TranslateRequest, Translator,
    Workspace,
};

#[derive(Parser)]
#[command(name = "honyaku", version, about = "Translate game text through a pool of LLM backends")]
struct Cli {
    /// Backend server list (INI).
    #[arg(long, global = true, env = "HONYAKU_SERVERS", default_value = DEFAULT_SERVER_LIST)]
    servers: PathBuf,

    /// Answer from in-process mock backends instead of the network.
    #[arg(long, global = true)]
    mock: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "HONYAKU_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate the pending lines of a game workspace's prepare_text.json.
    Translate {
        /// Game directory, its executable, or a directory holding Cache/.
        workspace: PathBuf,
        /// Translate Japanese spans only, leaving everything else untouched.
        #[arg(long)]
        strict: bool,
    },
    /// Translate the Japanese keys of an exported JSON object.
    TranslateJson {
        file: PathBuf,
        #[arg(long)]
        glossary: Option<PathBuf>,
        #[arg(long)]
        strict: bool,
    },
    /// Serve the HTTP API.
    Serve {
        /// Listen on all interfaces instead of loopback.
        #[arg(long)]
        public: bool,
        #[arg(long, default_value_t = 7680)]
        port: u16,
    },
}

fn connector(mock: bool) -> Arc<dyn Connector> {
    if mock {
        Arc::new(MockConnector::always(MockMode::Suffix("（译）".into())))
    } else {
        Arc::new(HttpConnector)
    }
}

fn load_servers(path: &Path, mock: bool) -> Result<Vec<BackendConfig>, Box<dyn std::error::Error>> {
    if mock && !path.exists() {
        return Ok(vec![BackendConfig::new("mock", "mock://local", honyaku::BackendKind::Completion)]);
    }
    let list = ServerList::load(path)?;
    for entry in list.entries.iter().filter(|e| !e.enabled) {
        info!(backend = %entry.name, "backend_disabled");
    }
    Ok(list.enabled())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    honyaku::init_tracing(cli.log_json);

    let servers = load_servers(&cli.servers, cli.mock)?;
    let connector = connector(cli.mock);
    let settings = DispatchSettings::default();

    match cli.command {
        Command::Translate { workspace, strict } => {
            let ws = Workspace::locate(&workspace)?;
            let glossary = Glossary::load_from_file(&ws.glossary_path())?;
            let lines = store::pending_lines(&ws.prepare_text)?;
            info!(workspace = %ws.root.display(), pending = lines.len(), "workspace_loaded");

            let translator = Translator::connect(&servers, connector, settings).await?;
            let out = translator
                .translate(TranslateRequest {
                    lines,
                    strict: strict || ws.strict_marker(),
                    glossary,
                    target_out_file: Some(ws.prepare_text.clone()),
                    cache_file: None,
                })
                .await?;
            translator.shutdown();
            info!(lines = out.len(), "translation_complete");
        }
        Command::TranslateJson { file, glossary, strict } => {
            let job = JsonJob::prepare(&file)?;
            let root = file.parent().unwrap_or_else(|| Path::new("."));
            let ws = Workspace::at(root, &job.pending);
            let glossary_path = glossary.unwrap_or_else(|| ws.glossary_path());
            let glossary = Glossary::load_from_file(&glossary_path)?;
            let lines = store::pending_lines(&job.pending)?;

            let translator = Translator::connect(&servers, connector, settings).await?;
            let out = translator
                .translate(TranslateRequest {
                    lines,
                    strict: strict || ws.strict_marker(),
                    glossary,
                    target_out_file: Some(job.pending.clone()),
                    cache_file: Some(job.translated.clone()),
                })
                .await?;
            translator.shutdown();
            info!(lines = out.len(), output = %job.translated.display(), "translation_complete");
        }
        Command::Serve { public, port } => {
            let ip = if public {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            };
            let state = AppState::new(servers, connector, settings);
            server::serve(state, SocketAddr::new(ip, port)).await?;
        }
    }

    Ok(())
}
