//! Run configuration: backend server list, per-model load arguments,
//! workspace discovery and dispatch tunables.
//!
//! The server list is an INI file with one section per backend:
//!
//! ```ini
//! [local]
//! server_name = local-sakura
//! api_url = http://127.0.0.1:5000
//! api_key = ERIN
//! model_config_path = models.yaml
//! description = local llama.cpp box,
//!     13b model
//!
//! [hosted]
//! enable = no
//! kind = metered
//! address = https://api.example.com
//! credential = sk-...
//! model = gpt-4o-mini
//! proxy = http://127.0.0.1:7890
//! ```
//!
//! A `[DEFAULT]` section supplies fallback values to every other section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use configparser::ini::Ini;
use serde_json::{Map, Value};

use crate::backend::BackendKind;
use crate::translate::glossary::GlossaryError;

pub const DEFAULT_SERVER_LIST: &str = "server-list.ini";
pub const PREPARE_TEXT_FILE: &str = "prepare_text.json";
pub const GLOSSARY_FILE: &str = "glossary.txt";
pub const STRICT_MARKER_FILE: &str = "strictest.txt";
/// Server list section whose keys apply to every backend section.
pub const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Syntax { message: String },
    MissingKey { section: String, key: &'static str },
    UnknownKind { section: String, kind: String },
    ModelConfig { path: PathBuf, message: String },
    Glossary(GlossaryError),
    WorkspaceNotFound(PathBuf),
    NoBackends,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read {}: {source}", path.display())
            }
            ConfigError::Syntax { message } => write!(f, "server list: {message}"),
            ConfigError::MissingKey { section, key } => {
                write!(f, "server [{section}] is missing `{key}`")
            }
            ConfigError::UnknownKind { section, kind } => {
                write!(f, "server [{section}] has unknown kind `{kind}`")
            }
            ConfigError::ModelConfig { path, message } => {
                write!(f, "model config {}: {message}", path.display())
            }
            ConfigError::Glossary(e) => write!(f, "{e}"),
            ConfigError::WorkspaceNotFound(path) => write!(
                f,
                "{} not found under {}, extract the text first",
                PREPARE_TEXT_FILE,
                path.display()
            ),
            ConfigError::NoBackends => write!(
                f,
                "no usable backend servers, check the server list configuration"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<GlossaryError> for ConfigError {
    fn from(e: GlossaryError) -> Self {
        ConfigError::Glossary(e)
    }
}

/// Static configuration of one backend, kept for reconnection.
#[derive(Clone)]
pub struct BackendConfig {
    pub enabled: bool,
    pub name: String,
    pub address: String,
    pub credential: Option<String>,
    pub kind: BackendKind,
    pub model: Option<String>,
    pub model_config_path: Option<PathBuf>,
    /// Load arguments keyed by `"<model name>$"`.
    pub model_config: Map<String, Value>,
    pub proxy: Option<String>,
    pub description: String,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            enabled: true,
            name: name.into(),
            address: address.into(),
            credential: None,
            kind,
            model: None,
            model_config_path: None,
            model_config: Map::new(),
            proxy: None,
            description: String::new(),
        }
    }

    /// Extra load arguments configured for `model`.
    pub fn model_args(&self, model: &str) -> Map<String, Value> {
        self.model_config
            .get(&format!("{model}$"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("enabled", &self.enabled)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// `false`, `no`, `n` and `0` (any case) switch an entry off.
pub fn is_disabled_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "no" | "n" | "0"
    )
}

/// One `[section]` of an INI file with its key/value pairs in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    /// First value among `keys`, keys compared case-insensitively.
    pub fn get(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| {
            self.entries
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        })
    }
}

/// Read an INI server list. Section names keep their case, values may
/// continue on indented lines, and `[DEFAULT]` entries are appended to every
/// other section as fallbacks instead of forming a section of their own.
pub fn parse_ini(content: &str) -> Result<Vec<IniSection>, ConfigError> {
    let mut ini = Ini::new_cs();
    ini.set_default_section(DEFAULT_SECTION);
    ini.set_multiline(true);
    let map = ini
        .read(content.to_string())
        .map_err(|message| ConfigError::Syntax { message })?;

    let fallback = map.get(DEFAULT_SECTION).map(collect_entries).unwrap_or_default();
    Ok(map
        .iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .map(|(name, values)| {
            let mut entries = collect_entries(values);
            entries.extend(fallback.iter().cloned());
            IniSection {
                name: name.clone(),
                entries,
            }
        })
        .collect())
}

/// Keys without a value read as empty strings.
fn collect_entries<'a>(
    values: impl IntoIterator<Item = (&'a String, &'a Option<String>)>,
) -> Vec<(String, String)> {
    values
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
        .collect()
}

/// All backend entries of a server list, disabled ones included.
#[derive(Debug, Clone, Default)]
pub struct ServerList {
    pub entries: Vec<BackendConfig>,
}

impl ServerList {
    /// Read and parse a server list. Relative model config paths resolve
    /// against the server list's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base)
    }

    pub fn parse(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let entries = parse_ini(content)?
            .iter()
            .map(|section| backend_from_section(section, base_dir))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn enabled(&self) -> Vec<BackendConfig> {
        self.entries.iter().filter(|e| e.enabled).cloned().collect()
    }
}

fn backend_from_section(section: &IniSection, base_dir: &Path) -> Result<BackendConfig, ConfigError> {
    let enabled = section
        .get(&["enable", "enabled"])
        .map(|v| !is_disabled_flag(v))
        .unwrap_or(true);

    let kind = match section.get(&["kind"]) {
        None | Some("") => BackendKind::Completion,
        Some(k) => BackendKind::parse(k).ok_or_else(|| ConfigError::UnknownKind {
            section: section.name.clone(),
            kind: k.to_string(),
        })?,
    };

    let address = section
        .get(&["api_url", "address"])
        .ok_or_else(|| ConfigError::MissingKey {
            section: section.name.clone(),
            key: "api_url",
        })?
        .trim_end_matches('/')
        .to_string();

    let non_empty = |keys: &[&str]| {
        section
            .get(keys)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let model_config_path = non_empty(&["model_config_path"]).map(|p| {
        let p = PathBuf::from(p);
        if p.is_absolute() {
            p
        } else {
            base_dir.join(p)
        }
    });
    // Disabled entries never connect, so their model config is not required.
    let model_config = match (&model_config_path, enabled) {
        (Some(path), true) => load_model_config(path)?,
        _ => Map::new(),
    };

    Ok(BackendConfig {
        enabled,
        name: non_empty(&["server_name", "name"]).unwrap_or_else(|| section.name.clone()),
        address,
        credential: non_empty(&["api_key", "credential"]),
        kind,
        model: non_empty(&["model", "model_name"]),
        model_config_path,
        model_config,
        proxy: non_empty(&["proxy"]),
        description: section.get(&["description"]).unwrap_or_default().to_string(),
    })
}

/// Load per-model load arguments. The file is YAML unless it has a `.json`
/// extension; either way the root must be a mapping.
pub fn load_model_config(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let model_config_error = |message: String| ConfigError::ModelConfig {
        path: path.to_path_buf(),
        message,
    };

    let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str::<Value>(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<Value>(&content).map_err(|e| e.to_string())
    };
    match parsed.map_err(model_config_error)? {
        Value::Object(map) => Ok(map),
        // An empty YAML document.
        Value::Null => Ok(Map::new()),
        _ => Err(model_config_error("root must be a mapping".into())),
    }
}

/// Directory holding `prepare_text.json` plus the optional glossary and
/// strict-mode marker.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub prepare_text: PathBuf,
}

impl Workspace {
    /// Accepts the game directory or its executable; looks for the prepare
    /// file directly inside it, then under `Cache/`.
    pub fn locate(path: &Path) -> Result<Self, ConfigError> {
        let dir = if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("exe")) {
            path.parent().unwrap_or(path).to_path_buf()
        } else {
            path.to_path_buf()
        };

        [dir.join(PREPARE_TEXT_FILE), dir.join("Cache").join(PREPARE_TEXT_FILE)]
            .into_iter()
            .find(|p| p.exists())
            .map(|prepare_text| Self {
                root: prepare_text.parent().unwrap_or(&dir).to_path_buf(),
                prepare_text,
            })
            .ok_or(ConfigError::WorkspaceNotFound(dir))
    }

    /// A workspace rooted at an arbitrary directory, for JSON-file runs.
    pub fn at(root: &Path, prepare_text: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            prepare_text: prepare_text.to_path_buf(),
        }
    }

    pub fn glossary_path(&self) -> PathBuf {
        self.root.join(GLOSSARY_FILE)
    }

    pub fn strict_marker(&self) -> bool {
        self.root.join(STRICT_MARKER_FILE).exists()
    }
}

/// Dispatch tunables. Defaults match the production behaviour.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Pause between reconnection attempts for a dead backend.
    pub reconnect_interval: Duration,
    /// Responses longer than this many chars are truncated.
    pub overlength_limit: usize,
    /// Non-completion backends leave the last queued job to a completion
    /// backend when at least this many backends are connected. `None`
    /// disables the deferral.
    pub defer_when_backends_at_least: Option<usize>,
    /// Pause after deferring a job, so the deferring worker does not spin.
    pub defer_backoff: Duration,
    /// Requeues allowed for a fragment whose answer equals the source. The
    /// next echo is accepted as the translation.
    pub max_no_progress_retries: u32,
    /// Pause after requeueing an echoed answer.
    pub no_progress_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            overlength_limit: crate::translate::postprocess::DEFAULT_OVERLENGTH_LIMIT,
            defer_when_backends_at_least: Some(2),
            defer_backoff: Duration::from_millis(200),
            max_no_progress_retries: 3,
            no_progress_backoff: Duration::from_millis(200),
        }
    }
}
