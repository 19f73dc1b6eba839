//! Response clean-up applied by workers before a result is cached.

use super::script::trailing_non_japanese;

/// Terminators trimmed from strict-mode span translations.
pub const STRICT_TERMINATORS: [char; 6] = ['。', '？', '！', '，', '—', '…'];

const QUOTE_GLYPHS: [char; 8] = ['"', '\'', '“', '”', '「', '」', '『', '』'];

/// Response length (in chars) above which the overlength guard kicks in.
pub const DEFAULT_OVERLENGTH_LIMIT: usize = 500;

/// Options that depend on the job and the backend that served it.
#[derive(Debug, Clone, Copy)]
pub struct PostProcess {
    pub strict: bool,
    pub chat_style: bool,
    pub overlength_limit: usize,
}

impl PostProcess {
    pub fn apply(&self, source: &str, raw: &str) -> String {
        let mut text = raw.trim().to_string();

        // Quotes and preamble lines go first so the terminator checks see
        // the actual closing character.
        if self.chat_style {
            text = strip_stray_quotes(source, &text);
        }
        text = keep_last_line(source, &text);
        if self.strict {
            text = trim_strict_terminator(&text);
        }
        text = suppress_full_stop(source, &text);

        guard_overlength(source, text, self.overlength_limit)
    }
}

/// Strip the trailing run of the first terminator that closes `text`.
pub fn trim_strict_terminator(text: &str) -> String {
    for end in STRICT_TERMINATORS {
        if text.ends_with(end) {
            return text.trim_end_matches(end).to_string();
        }
    }
    text.to_string()
}

/// Drop a closing `。` the source line never had.
pub fn suppress_full_stop(source: &str, text: &str) -> String {
    if text.ends_with('。') && !source.trim_end().ends_with('。') {
        return text.strip_suffix('。').unwrap_or(text).to_string();
    }
    text.to_string()
}

/// Remove quotation glyphs wrapped around the answer by chat models unless
/// the source itself starts or ends with that glyph.
pub fn strip_stray_quotes(source: &str, text: &str) -> String {
    let mut out = text;
    if let Some(first) = out.chars().next() {
        if QUOTE_GLYPHS.contains(&first) && !source.starts_with(first) {
            out = &out[first.len_utf8()..];
        }
    }
    if let Some(last) = out.chars().last() {
        if QUOTE_GLYPHS.contains(&last) && !source.ends_with(last) {
            out = &out[..out.len() - last.len_utf8()];
        }
    }
    out.trim().to_string()
}

/// A single-line source answered with several lines keeps only the last one.
pub fn keep_last_line(source: &str, text: &str) -> String {
    if source.contains('\n') || !text.contains('\n') {
        return text.to_string();
    }
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}

/// Bound runaway generations: truncate to the source length and re-append the
/// source's trailing non-Japanese characters.
pub fn guard_overlength(source: &str, text: String, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text;
    }
    let mut truncated: String = text.chars().take(source.chars().count()).collect();
    truncated.push_str(trailing_non_japanese(source));
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> PostProcess {
        PostProcess {
            strict: true,
            chat_style: false,
            overlength_limit: DEFAULT_OVERLENGTH_LIMIT,
        }
    }

    #[test]
    fn strict_trims_one_terminator_kind() {
        assert_eq!(trim_strict_terminator("你好。"), "你好");
        assert_eq!(trim_strict_terminator("等等……"), "等等");
        assert_eq!(trim_strict_terminator("真的？！"), "真的？");
        assert_eq!(trim_strict_terminator("你好"), "你好");
    }

    #[test]
    fn full_stop_kept_when_source_has_one() {
        assert_eq!(suppress_full_stop("行く。", "走。"), "走。");
        assert_eq!(suppress_full_stop("行く", "走。"), "走");
    }

    #[test]
    fn chat_quotes_stripped_unless_in_source() {
        assert_eq!(strip_stray_quotes("はい", "“是的”"), "是的");
        assert_eq!(strip_stray_quotes("「はい」", "「是的」"), "「是的」");
    }

    #[test]
    fn multi_line_answer_keeps_last_line() {
        assert_eq!(keep_last_line("はい", "翻译如下：\n是的\n"), "是的");
        assert_eq!(keep_last_line("は\nい", "是\n的"), "是\n的");
    }

    #[test]
    fn overlength_truncates_and_restores_tail() {
        let source = "こんにちは";
        let runaway = "你".repeat(600);
        let out = guard_overlength(source, runaway, DEFAULT_OVERLENGTH_LIMIT);
        assert_eq!(out, "你".repeat(5));

        let out = guard_overlength("はいはい!?", "啊".repeat(501), 500);
        assert_eq!(out, format!("{}!?", "啊".repeat(6)));
    }

    #[test]
    fn short_answers_are_untouched_by_guard() {
        assert_eq!(guard_overlength("はい", "是".into(), 500), "是");
    }

    #[test]
    fn apply_runs_the_pipeline() {
        assert_eq!(strict().apply("日本語", " 日语。 "), "日语");
        let chat = PostProcess {
            strict: false,
            chat_style: true,
            overlength_limit: 500,
        };
        assert_eq!(chat.apply("はい", "\"好的。\""), "好的");
        assert_eq!(chat.apply("はい。", "译文：\n好的。"), "好的。");
    }
}
