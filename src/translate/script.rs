//! Source-script detection.
//! A character counts as Japanese when its NFKC form contains kana or CJK
//! ideographs, so half-width katakana and compatibility forms are caught too.
//! Span offsets always refer to the original, non-normalized text.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static JAPANESE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\u{3040}-\u{30ff}\u{3400}-\u{4dbf}\u{4e00}-\u{9fff}]")
        .expect("static regex is valid")
});

/// Whether a single character belongs to the source script.
pub fn is_japanese_char(c: char) -> bool {
    let mut buf = [0u8; 4];
    if JAPANESE.is_match(c.encode_utf8(&mut buf)) {
        return true;
    }
    let normalized: String = std::iter::once(c).nfkc().collect();
    JAPANESE.is_match(&normalized)
}

/// Whether `text` contains any source-script character.
pub fn has_japanese(text: &str) -> bool {
    text.chars().any(is_japanese_char)
}

/// Contiguous source-script runs of `text`, in order of appearance.
pub fn japanese_spans(text: &str) -> Vec<&str> {
    japanese_span_ranges(text)
        .into_iter()
        .map(|range| &text[range])
        .collect()
}

/// Byte ranges of the source-script runs of `text`.
pub fn japanese_span_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, c) in text.char_indices() {
        match (is_japanese_char(c), start) {
            (true, None) => start = Some(idx),
            (false, Some(s)) => {
                ranges.push(s..idx);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        ranges.push(s..text.len());
    }
    ranges
}

/// Trailing characters of `text` up to (not including) the last source-script
/// character. Used to recover punctuation or romaji after truncation.
pub fn trailing_non_japanese(text: &str) -> &str {
    let cut = text
        .char_indices()
        .rev()
        .find(|&(_, c)| is_japanese_char(c))
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(0);
    &text[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_kana_and_kanji() {
        assert!(has_japanese("こんにちは"));
        assert!(has_japanese("カタカナ"));
        assert!(has_japanese("日本"));
        assert!(!has_japanese("hello, world!"));
        assert!(!has_japanese("123 !?"));
    }

    #[test]
    fn half_width_katakana_counts_after_nfkc() {
        assert!(has_japanese("ｶﾀｶﾅ"));
    }

    #[test]
    fn spans_split_mixed_script_runs() {
        assert_eq!(japanese_spans("日本語test"), vec!["日本語"]);
        assert_eq!(
            japanese_spans("HP: 回復 / MP: 魔力です"),
            vec!["回復", "魔力です"]
        );
        assert!(japanese_spans("plain").is_empty());
        assert_eq!(japanese_span_ranges("a日本 語"), vec![1..7, 8..11]);
    }

    #[test]
    fn trailing_tail_stops_at_last_japanese_char() {
        assert_eq!(trailing_non_japanese("はい!?"), "!?");
        assert_eq!(trailing_non_japanese("はい"), "");
        assert_eq!(trailing_non_japanese("abc"), "abc");
        assert_eq!(trailing_non_japanese("魔法 lv.3"), " lv.3");
    }
}
