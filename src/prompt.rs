//! Prompt composition and thinking-tag suppression.
//!
//! The composer assembles a single prompt string from memory, retrieved
//! context, and conversation history. The filter removes model-private
//! `<think>…</think>` spans, either from a completed string or token by
//! token during streaming.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::store::models::{ChatMessage, Chunk, Role};

/// How many trailing messages form the recent-conversation window.
const RECENT_WINDOW: usize = 10;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

// ── Composer ─────────────────────────────────────────────────────────

/// Inputs for prompt composition.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Optional memory/recall block, already formatted.
    pub memory: Option<&'a str>,
    /// Retrieved knowledge-base chunks, rank order.
    pub chunks: &'a [Chunk],
    /// Semantically recalled past messages, oldest first.
    pub past: &'a [ChatMessage],
    /// Recent session messages, oldest first.
    pub recent: &'a [ChatMessage],
}

/// Build the final RAG prompt.
///
/// Sections, in order: memory, knowledge-base context, relevant past
/// conversation (deduplicated against the recent window, system messages
/// excluded), recent conversation (last 10), and the closing
/// `User:`/`Assistant:` turn unless the query already ends the window.
pub fn compose(query: &str, ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    if let Some(memory) = ctx.memory {
        if !memory.trim().is_empty() {
            prompt.push_str(memory.trim_end());
            prompt.push_str("\n\n");
        }
    }

    if !ctx.chunks.is_empty() {
        prompt.push_str("### Knowledge Base Context:\n");
        for (i, chunk) in ctx.chunks.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, chunk.content));
        }
        prompt.push('\n');
    }

    let recent_window: &[ChatMessage] = if ctx.recent.len() > RECENT_WINDOW {
        &ctx.recent[ctx.recent.len() - RECENT_WINDOW..]
    } else {
        ctx.recent
    };
    let recent_ids: HashSet<&str> = recent_window.iter().map(|m| m.id.as_str()).collect();

    let past: Vec<&ChatMessage> = ctx
        .past
        .iter()
        .filter(|m| m.role != Role::System && !recent_ids.contains(m.id.as_str()))
        .collect();
    if !past.is_empty() {
        prompt.push_str("### Relevant Past Conversation:\n");
        for message in past {
            prompt.push_str(&format_message(message));
        }
        prompt.push('\n');
    }

    if !recent_window.is_empty() {
        prompt.push_str("### Recent Conversation:\n");
        for message in recent_window {
            prompt.push_str(&format_message(message));
        }
        prompt.push('\n');
    }

    let query_is_last = recent_window
        .last()
        .is_some_and(|m| m.role == Role::User && m.content == query);
    if !query_is_last {
        prompt.push_str(&format!("User: {query}\nAssistant:"));
    } else {
        prompt.push_str("Assistant:");
    }

    prompt
}

fn format_message(message: &ChatMessage) -> String {
    let role = match message.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    };
    format!("{role}: {}\n", message.content)
}

// ── Thinking-tag handling ────────────────────────────────────────────

static THINK_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"));

/// Strip all `<think>…</think>` spans from a completed string, including
/// an unterminated trailing span.
pub fn strip_thinking(text: &str) -> String {
    let stripped = THINK_SPAN.replace_all(text, "");
    match stripped.find(THINK_OPEN) {
        Some(idx) => stripped[..idx].to_string(),
        None => stripped.into_owned(),
    }
}

/// Stateful streaming filter that forwards only text outside
/// `<think>…</think>` spans.
///
/// Tokens may split the markers at any byte position, so the filter holds
/// back any suffix that could still become a marker and releases it once
/// disambiguated. With `pass_through` the filter forwards everything
/// unchanged.
pub struct ThinkingTagFilter {
    pass_through: bool,
    inside: bool,
    buffer: String,
}

impl ThinkingTagFilter {
    pub fn new(pass_through: bool) -> Self {
        Self {
            pass_through,
            inside: false,
            buffer: String::new(),
        }
    }

    /// Feed one token; returns the text safe to emit now.
    pub fn feed(&mut self, token: &str) -> String {
        if self.pass_through {
            return token.to_string();
        }

        self.buffer.push_str(token);
        let mut output = String::new();

        loop {
            if self.inside {
                match self.buffer.find(THINK_CLOSE) {
                    Some(idx) => {
                        self.buffer.drain(..idx + THINK_CLOSE.len());
                        self.inside = false;
                    }
                    None => {
                        // Discard swallowed text, but keep any suffix that
                        // may grow into the close marker.
                        let keep = trailing_prefix_len(&self.buffer, THINK_CLOSE);
                        self.buffer.drain(..self.buffer.len() - keep);
                        break;
                    }
                }
            } else {
                match self.buffer.find(THINK_OPEN) {
                    Some(idx) => {
                        output.push_str(&self.buffer[..idx]);
                        self.buffer.drain(..idx + THINK_OPEN.len());
                        self.inside = true;
                    }
                    None => {
                        let keep = trailing_prefix_len(&self.buffer, THINK_OPEN);
                        let emit_to = self.buffer.len() - keep;
                        output.push_str(&self.buffer[..emit_to]);
                        self.buffer.drain(..emit_to);
                        break;
                    }
                }
            }
        }

        output
    }

    /// Release anything still buffered at end of stream. A dangling
    /// partial open marker is plain text; an unterminated think span is
    /// suppressed.
    pub fn flush(&mut self) -> String {
        if self.inside {
            self.buffer.clear();
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of
/// `pattern`.
fn trailing_prefix_len(text: &str, pattern: &str) -> usize {
    let max = pattern.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        if pattern.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}
