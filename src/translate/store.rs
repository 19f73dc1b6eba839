//! JSON files on disk: the prepare-text file listing lines to translate,
//! and the persisted translation cache that accumulates across runs.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::script::has_japanese;

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: std::io::Error },
    Json { path: PathBuf, source: serde_json::Error },
    NotAnObject(PathBuf),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            StoreError::Json { path, source } => write!(f, "{}: invalid JSON: {source}", path.display()),
            StoreError::NotAnObject(path) => write!(f, "{}: expected a JSON object", path.display()),
        }
    }
}

impl std::error::Error for StoreError {}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a JSON object. A missing file reads as empty.
pub fn load_map(path: &Path) -> Result<Map<String, Value>, StoreError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let content = std::fs::read_to_string(path).map_err(io_err(path))?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::NotAnObject(path.to_path_buf())),
        Err(source) => Err(StoreError::Json {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write a JSON object with 4-space indentation, non-ASCII kept as is.
pub fn save_map(path: &Path, map: &Map<String, Value>) -> Result<(), StoreError> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    map.serialize(&mut ser).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, out).map_err(io_err(path))?;
    debug!(path = %path.display(), entries = map.len(), "json_saved");
    Ok(())
}

/// Insert `pairs` into the object stored at `path`, keeping existing keys.
pub fn merge_into<'a>(
    path: &Path,
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<usize, StoreError> {
    let mut map = load_map(path)?;
    let mut written = 0;
    for (source, translated) in pairs {
        map.insert(source.to_string(), Value::String(translated.to_string()));
        written += 1;
    }
    save_map(path, &map)?;
    Ok(written)
}

/// Keys still waiting for a translation (empty string values).
pub fn pending_lines(path: &Path) -> Result<Vec<String>, StoreError> {
    Ok(load_map(path)?
        .into_iter()
        .filter(|(_, v)| v.as_str() == Some(""))
        .map(|(k, _)| k)
        .collect())
}

/// Companion files of an exported JSON translated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonJob {
    /// `<stem>_Translated_Cache.<ext>`: working copy that receives results.
    pub pending: PathBuf,
    /// `<stem>_Translated.<ext>`: persisted translation cache.
    pub translated: PathBuf,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("text");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

impl JsonJob {
    pub fn for_source(source: &Path) -> Self {
        Self {
            pending: sibling(source, "_Translated_Cache"),
            translated: sibling(source, "_Translated"),
        }
    }

    /// Create the working copy on first use: Japanese keys get their cached
    /// translation or `""`, every other key keeps its value. An existing
    /// working copy is resumed untouched.
    pub fn prepare(source: &Path) -> Result<Self, StoreError> {
        let job = Self::for_source(source);
        if job.pending.exists() {
            info!(pending = %job.pending.display(), "resuming_pending_file");
            return Ok(job);
        }

        let data = load_map(source)?;
        let cached = load_map(&job.translated)?;
        let pending: Map<String, Value> = data
            .into_iter()
            .map(|(key, value)| {
                if has_japanese(&key) {
                    let v = cached.get(&key).cloned().unwrap_or_else(|| Value::String(String::new()));
                    (key, v)
                } else {
                    (key, value)
                }
            })
            .collect();
        save_map(&job.pending, &pending)?;
        info!(pending = %job.pending.display(), entries = pending.len(), "pending_file_created");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_map(&dir.path().join("none.json")).unwrap().is_empty());
    }

    #[test]
    fn saves_with_four_space_indent_and_raw_unicode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut map = Map::new();
        map.insert("はい".into(), Value::String("是".into()));
        save_map(&path, &map).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\n    \"はい\": \"是\"\n}");
    }

    #[test]
    fn merge_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        merge_into(&path, [("一", "1")]).unwrap();
        merge_into(&path, [("二", "2"), ("一", "壹")]).unwrap();
        let map = load_map(&path).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["一"], "壹");
    }

    #[test]
    fn pending_lines_are_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepare_text.json");
        std::fs::write(&path, r#"{"はい": "", "いいえ": "不", "ok": ""}"#).unwrap();
        assert_eq!(pending_lines(&path).unwrap(), vec!["はい", "ok"]);
    }

    #[test]
    fn non_object_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(load_map(&path), Err(StoreError::NotAnObject(_))));
    }

    #[test]
    fn json_job_prepares_pending_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("menu.json");
        std::fs::write(&source, r#"{"開始": "start", "終了": "quit", "Options": "opts"}"#).unwrap();
        std::fs::write(dir.path().join("menu_Translated.json"), r#"{"終了": "退出"}"#).unwrap();

        let job = JsonJob::prepare(&source).unwrap();
        assert_eq!(job.pending, dir.path().join("menu_Translated_Cache.json"));

        let pending = load_map(&job.pending).unwrap();
        assert_eq!(pending["開始"], "");
        assert_eq!(pending["終了"], "退出");
        assert_eq!(pending["Options"], "opts");
        assert_eq!(pending_lines(&job.pending).unwrap(), vec!["開始"]);
    }
}
