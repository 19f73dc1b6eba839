//! Dispatch jobs and prompt construction.
//! A job carries its renderer as a plain function pointer so whichever worker
//! dequeues it can build the prompt for its own backend kind.

use std::sync::Arc;

use super::cache::{fingerprint, Fingerprint};
use super::glossary::GlossaryEntry;

/// Prompt payload before backend-specific framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// ChatML framing for raw-completion servers.
    pub fn to_chatml(&self) -> String {
        format!(
            "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            self.system, self.user
        )
    }

    /// OpenAI-style message list for chat servers.
    pub fn to_messages(&self) -> serde_json::Value {
        serde_json::json!([
            {"role": "system", "content": self.system},
            {"role": "user", "content": self.user}
        ])
    }
}

/// Turns a fragment plus glossary hints into a prompt.
pub type Renderer = fn(&str, &[GlossaryEntry]) -> Prompt;

const SYSTEM_PROMPT: &str = "你是一个游戏文本翻译模型，将日文翻译成简体中文。\
只输出译文，不要添加解释，不要改动格式，不要擅自添加原文中没有的代词。\
遇到无法翻译的内容时直接输出原文。";

/// Default Japanese to Simplified Chinese renderer.
pub fn render_ja_zh(text: &str, hints: &[GlossaryEntry]) -> Prompt {
    let user = if hints.is_empty() {
        format!("将下面的日文文本翻译成中文：{text}")
    } else {
        format!(
            "根据以下术语表：\n{}\n将下面的日文文本根据上述术语表的对应关系和注释翻译成中文：{text}",
            format_hints(hints)
        )
    };
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// One `src->dst` line per hint, with `#info` appended when present.
pub fn format_hints(hints: &[GlossaryEntry]) -> String {
    hints
        .iter()
        .map(|h| match h.info.as_deref() {
            Some(info) if !info.is_empty() => format!("{}->{} #{}", h.src, h.dst, info),
            _ => format!("{}->{}", h.src, h.dst),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A queued unit of translation work.
#[derive(Clone)]
pub struct Job {
    pub renderer: Renderer,
    pub fragment: Arc<str>,
    pub hints: Arc<[GlossaryEntry]>,
    pub strict: bool,
    key: Fingerprint,
}

impl Job {
    pub fn new(renderer: Renderer, fragment: &str, hints: Vec<GlossaryEntry>, strict: bool) -> Self {
        Self {
            renderer,
            key: fingerprint(fragment),
            fragment: Arc::from(fragment),
            hints: Arc::from(hints),
            strict,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.key
    }

    pub fn render(&self) -> Prompt {
        (self.renderer)(&self.fragment, &self.hints)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("fragment", &self.fragment)
            .field("hints", &self.hints.len())
            .field("strict", &self.strict)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prompt_has_no_glossary_block() {
        let p = render_ja_zh("こんにちは", &[]);
        assert!(p.user.ends_with("こんにちは"));
        assert!(!p.user.contains("术语表"));
    }

    #[test]
    fn hints_are_rendered_with_info() {
        let mut hint = GlossaryEntry::new("勇者", "勇者大人");
        hint.info = Some("主角".into());
        let p = render_ja_zh("勇者が来た", &[hint, GlossaryEntry::new("剣", "剑")]);
        assert!(p.user.contains("勇者->勇者大人 #主角\n剣->剑"));
    }

    #[test]
    fn chatml_ends_with_open_assistant_turn() {
        let p = render_ja_zh("はい", &[]);
        assert!(p.to_chatml().ends_with("<|im_start|>assistant\n"));
        assert_eq!(p.to_messages()[1]["role"], "user");
    }

    #[test]
    fn job_fingerprint_matches_fragment() {
        let job = Job::new(render_ja_zh, "はい", Vec::new(), false);
        assert_eq!(job.fingerprint(), &fingerprint("はい"));
        assert_eq!(job.render().user, render_ja_zh("はい", &[]).user);
    }
}
