//! Glossary loading and matching.
//! Loads term pairs from a plain-text file (source and target on alternating
//! lines), answers exact-match lookups and returns the entries contained in a
//! span for prompt injection.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single glossary term pair, optionally annotated for disambiguation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    #[serde(alias = "source")]
    pub src: String,
    #[serde(alias = "target")]
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl GlossaryEntry {
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            info: None,
        }
    }
}

/// Ordered, immutable term list for one run.
#[derive(Debug, Clone, Default)]
pub struct Glossary {
    entries: Vec<GlossaryEntry>,
}

#[derive(Debug)]
pub enum GlossaryError {
    Io(std::io::Error),
    OddLineCount(usize),
}

impl std::fmt::Display for GlossaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlossaryError::Io(e) => write!(f, "glossary IO error: {e}"),
            GlossaryError::OddLineCount(n) => {
                write!(f, "glossary file format error: {n} lines, expected source/target pairs")
            }
        }
    }
}

impl std::error::Error for GlossaryError {}

impl From<std::io::Error> for GlossaryError {
    fn from(e: std::io::Error) -> Self {
        GlossaryError::Io(e)
    }
}

impl Glossary {
    /// Load a glossary file. A missing file yields an empty glossary.
    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse alternating source/target lines.
    pub fn parse(content: &str) -> Result<Self, GlossaryError> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() % 2 != 0 {
            return Err(GlossaryError::OddLineCount(lines.len()));
        }
        let entries = lines
            .chunks_exact(2)
            .map(|pair| GlossaryEntry::new(pair[0], pair[1]))
            .collect();
        Ok(Self::from_entries(entries))
    }

    /// Later duplicates of a source term replace earlier ones in place.
    pub fn from_entries(entries: Vec<GlossaryEntry>) -> Self {
        let mut deduped: Vec<GlossaryEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.iter_mut().find(|e| e.src == entry.src) {
                Some(existing) => *existing = entry,
                None => deduped.push(entry),
            }
        }
        Self { entries: deduped }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Target term for an exact source match.
    pub fn exact(&self, text: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.src == text)
            .map(|e| e.dst.as_str())
    }

    /// Return entries whose source term occurs inside `text`.
    pub fn match_entries(&self, text: &str) -> Vec<GlossaryEntry> {
        self.entries
            .iter()
            .filter(|e| !e.src.is_empty() && text.contains(&e.src))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_alternating_lines() {
        let g = Glossary::parse("勇者\n勇者大人\n魔王\n魔王\n").unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.exact("勇者"), Some("勇者大人"));
        assert_eq!(g.exact("勇"), None);
    }

    #[test]
    fn odd_line_count_is_an_error() {
        let err = Glossary::parse("勇者\n勇者大人\n魔王").unwrap_err();
        assert!(matches!(err, GlossaryError::OddLineCount(3)));
    }

    #[test]
    fn missing_file_is_empty() {
        let g = Glossary::load_from_file(Path::new("/nonexistent/glossary.txt")).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn match_entries_finds_contained_terms_in_order() {
        let g = Glossary::parse("勇者\n勇者大人\n魔王\n魔王\n剣\n剑\n").unwrap();
        let hits = g.match_entries("勇者は魔王を倒した");
        let srcs: Vec<_> = hits.iter().map(|e| e.src.as_str()).collect();
        assert_eq!(srcs, vec!["勇者", "魔王"]);
    }

    #[test]
    fn later_duplicates_win() {
        let g = Glossary::parse("猫\n猫\n猫\n喵\n").unwrap();
        assert_eq!(g.len(), 1);
        assert_eq!(g.exact("猫"), Some("喵"));
    }

    #[test]
    fn entries_deserialize_from_request_json() {
        let entries: Vec<GlossaryEntry> = serde_json::from_str(
            r#"[{"src":"勇者","dst":"勇者大人","info":"主角"},{"source":"剣","target":"剑"}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].info.as_deref(), Some("主角"));
        assert_eq!(entries[1].dst, "剑");
    }
}
