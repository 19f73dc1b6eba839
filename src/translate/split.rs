//! Line splitting into jobs and reassembly from the fingerprint cache.
//!
//! Each input line is broken on newlines. Sub-lines without Japanese pass
//! through untouched. Normal mode translates whole sub-lines; strict mode
//! translates each contiguous Japanese span and substitutes the results
//! back into the original sub-line.

use serde_json::{Map, Value};

use super::cache::{fingerprint, FingerprintCache};
use super::glossary::Glossary;
use super::job::{Job, Renderer};
use super::script::{has_japanese, japanese_span_ranges, japanese_spans};

enum Segment {
    SubLine(String),
    /// Closes input line `n`.
    EndOfLine(usize),
}

/// Result of splitting one batch: the jobs to dispatch plus what reassembly
/// needs once the queue has drained.
pub struct Plan {
    strict: bool,
    segments: Vec<Segment>,
    jobs: Vec<Job>,
    glossary_hits: usize,
}

impl Plan {
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn take_jobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }

    /// Spans answered straight from the glossary.
    pub fn glossary_hits(&self) -> usize {
        self.glossary_hits
    }

    /// Rebuild every input line from cached translations, in input order.
    /// Fragments missing from the cache fall back to their source text.
    pub fn reassemble(&self, lines: &[String], cache: &FingerprintCache) -> Translations {
        let mut pairs = Vec::with_capacity(lines.len());
        let mut current: Vec<String> = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::SubLine(sub) => current.push(self.translate_sub_line(sub, cache)),
                Segment::EndOfLine(n) => {
                    pairs.push((lines[*n].clone(), current.join("\n")));
                    current.clear();
                }
            }
        }
        Translations { pairs }
    }

    fn translate_sub_line(&self, sub: &str, cache: &FingerprintCache) -> String {
        if !has_japanese(sub) {
            return sub.to_string();
        }
        if !self.strict {
            return cache.get(&fingerprint(sub)).unwrap_or_else(|| sub.to_string());
        }
        // Rebuild left to right so a translation is never searched again.
        let mut out = String::with_capacity(sub.len());
        let mut last = 0;
        for range in japanese_span_ranges(sub) {
            let span = &sub[range.clone()];
            out.push_str(&sub[last..range.start]);
            match cache.get(&fingerprint(span)) {
                Some(translated) => out.push_str(&translated),
                None => out.push_str(span),
            }
            last = range.end;
        }
        out.push_str(&sub[last..]);
        out
    }
}

/// Turn input lines into jobs. In strict mode a span that exactly matches
/// a glossary term is written straight to `cache` instead of being queued.
pub fn split(
    lines: &[String],
    glossary: &Glossary,
    strict: bool,
    renderer: Renderer,
    cache: &FingerprintCache,
) -> Plan {
    let mut plan = Plan {
        strict,
        segments: Vec::new(),
        jobs: Vec::new(),
        glossary_hits: 0,
    };

    for (n, line) in lines.iter().enumerate() {
        for sub in line.lines() {
            plan.segments.push(Segment::SubLine(sub.to_string()));
            if !has_japanese(sub) {
                continue;
            }
            if !strict {
                plan.jobs.push(Job::new(renderer, sub, Vec::new(), false));
                continue;
            }
            for span in japanese_spans(sub) {
                if let Some(term) = glossary.exact(span) {
                    cache.put_if_absent(fingerprint(span), term.to_string());
                    plan.glossary_hits += 1;
                    continue;
                }
                plan.jobs.push(Job::new(renderer, span, glossary.match_entries(span), true));
            }
        }
        plan.segments.push(Segment::EndOfLine(n));
    }

    plan
}

/// Ordered `(source line, translated line)` pairs of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translations {
    pairs: Vec<(String, String)>,
}

impl Translations {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(s, _)| s == source)
            .map(|(_, t)| t.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    /// JSON object in input order; a repeated source line keeps its first
    /// position and its last value.
    pub fn to_json_map(&self) -> Map<String, Value> {
        self.pairs
            .iter()
            .map(|(s, t)| (s.clone(), Value::String(t.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::job::render_ja_zh;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn fill(cache: &FingerprintCache, pairs: &[(&str, &str)]) {
        for (s, t) in pairs {
            cache.put(fingerprint(s), t.to_string());
        }
    }

    #[test]
    fn normal_mode_queues_whole_sub_lines() {
        let cache = FingerprintCache::new();
        let input = lines(&["こんにちは\nHello", "123"]);
        let plan = split(&input, &Glossary::empty(), false, render_ja_zh, &cache);

        let queued: Vec<_> = plan.jobs().iter().map(|j| &*j.fragment).collect();
        assert_eq!(queued, vec!["こんにちは"]);

        fill(&cache, &[("こんにちは", "你好")]);
        let out = plan.reassemble(&input, &cache);
        assert_eq!(out.get("こんにちは\nHello"), Some("你好\nHello"));
        assert_eq!(out.get("123"), Some("123"));
    }

    #[test]
    fn strict_mode_substitutes_spans() {
        let cache = FingerprintCache::new();
        let input = lines(&["HP：回復する（小）"]);
        let plan = split(&input, &Glossary::empty(), true, render_ja_zh, &cache);

        let queued: Vec<_> = plan.jobs().iter().map(|j| &*j.fragment).collect();
        assert_eq!(queued, vec!["回復する", "小"]);
        assert!(plan.jobs().iter().all(|j| j.strict));

        fill(&cache, &[("回復する", "恢复"), ("小", "小型")]);
        let out = plan.reassemble(&input, &cache);
        assert_eq!(out.get("HP：回復する（小）"), Some("HP：恢复（小型）"));
    }

    #[test]
    fn span_translation_is_not_substituted_twice() {
        let cache = FingerprintCache::new();
        let input = lines(&["大小 小"]);
        let plan = split(&input, &Glossary::empty(), true, render_ja_zh, &cache);

        fill(&cache, &[("大小", "大小"), ("小", "小的")]);
        let out = plan.reassemble(&input, &cache);
        assert_eq!(out.get("大小 小"), Some("大小 小的"));
    }

    #[test]
    fn glossary_exact_match_skips_queue() {
        let cache = FingerprintCache::new();
        let glossary = Glossary::parse("勇者\n勇者大人\n魔王\n魔王大人\n").unwrap();
        let input = lines(&["勇者 vs 魔王の城"]);
        let mut plan = split(&input, &glossary, true, render_ja_zh, &cache);

        assert_eq!(plan.glossary_hits(), 1);
        let jobs = plan.take_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(&*jobs[0].fragment, "魔王の城");
        assert_eq!(jobs[0].hints[0].src, "魔王");
        assert_eq!(cache.get(&fingerprint("勇者")).as_deref(), Some("勇者大人"));
    }

    #[test]
    fn missing_translation_falls_back_to_source() {
        let cache = FingerprintCache::new();
        let input = lines(&["未訳"]);
        let plan = split(&input, &Glossary::empty(), false, render_ja_zh, &cache);
        assert_eq!(plan.reassemble(&input, &cache).get("未訳"), Some("未訳"));
    }

    #[test]
    fn order_and_empty_lines_preserved() {
        let cache = FingerprintCache::new();
        let input = lines(&["三", "", "一", "二"]);
        let plan = split(&input, &Glossary::empty(), false, render_ja_zh, &cache);
        fill(&cache, &[("一", "1"), ("二", "2"), ("三", "3")]);

        let out = plan.reassemble(&input, &cache);
        let pairs: Vec<_> = out.iter().collect();
        assert_eq!(pairs, vec![("三", "3"), ("", ""), ("一", "1"), ("二", "2")]);
        let keys: Vec<_> = out.to_json_map().keys().cloned().collect();
        assert_eq!(keys, vec!["三", "", "一", "二"]);
    }
}
