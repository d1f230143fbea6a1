//! Line classification for raw model-process output.
//!
//! The child process has no framing: responses, log records, status chatter
//! and input prompts all arrive as plain lines on stdout. [`classify_line`]
//! strips ANSI styling and sorts each line into one of four buckets so the
//! completion detector can decide what belongs to a response.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// Literal line printed by well-behaved children at the end of a response.
pub const COMPLETION_SENTINEL: &str = "COMMAND_COMPLETE";

/// Prefix on retrieval-augmentation output; stripped, the rest is content.
const RAG_PREFIX: &str = "[RAG]";

/// Plain-text prefixes that never carry response content.
const NOISE_PREFIXES: &[&str] = &["System:"];

/// Status chatter some children print while generating.
const STATUS_LINES: &[&str] = &["Bot is thinking..."];

static ANSI_SGR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ANSI SGR regex"));

/// Trailing prompts meaning "ready for the next input".
static PROMPT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"You:\s*$", r"^\s*>\s*$", r"Human:\s*$", r"User:\s*$"]
        .iter()
        .map(|p| Regex::new(p).expect("valid prompt regex"))
        .collect()
});

/// `| INFO |`-style severity columns emitted by the child's logger.
static LOG_SEVERITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|\s*(?:INFO|WARNING|WARN|ERROR|DEBUG|CRITICAL|TRACE)\s*\|")
        .expect("valid log severity regex")
});

/// Bracketed system tags at the start of a line, e.g. `[System]`, `[DEBUG]`.
static SYSTEM_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[(?i:system|info|warn|warning|error|debug|log|trace)\]")
        .expect("valid system tag regex")
});

/// What a single output line means to the command protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKind {
    /// The explicit completion sentinel.
    Marker,
    /// An input prompt; implicit end of response.
    Prompt,
    /// Log records and status chatter.
    Noise,
    /// Anything else: part of the response body.
    Content,
}

/// A cleaned output line tagged with its [`LineKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub kind: LineKind,
    pub text: String,
}

impl OutputLine {
    pub fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Content lines that are empty or whitespace-only.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Remove ANSI color/style sequences (`ESC [ params m`).
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_SGR.replace_all(line, "")
}

/// `true` if `text` (already ANSI-free) matches one of the trailing prompt
/// patterns.
pub fn is_prompt(text: &str) -> bool {
    PROMPT_PATTERNS.iter().any(|p| p.is_match(text))
}

/// `true` if `text` (already ANSI-free) is a log record or status line.
pub fn is_noise(text: &str) -> bool {
    let trimmed = text.trim();
    LOG_SEVERITY.is_match(text)
        || SYSTEM_TAG.is_match(text)
        || NOISE_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || STATUS_LINES.iter().any(|s| trimmed == *s)
}

/// Classify one raw line of child output.
///
/// ANSI escapes are stripped before any check, and the returned text is the
/// stripped form. `[RAG]`-prefixed lines keep their payload as content.
pub fn classify_line(raw: &str) -> OutputLine {
    let clean = strip_ansi(raw);
    let text = clean.trim_end_matches(['\r', '\n']);

    if text.trim() == COMPLETION_SENTINEL {
        return OutputLine::new(LineKind::Marker, text);
    }
    if is_prompt(text) {
        return OutputLine::new(LineKind::Prompt, text);
    }
    if is_noise(text) {
        return OutputLine::new(LineKind::Noise, text);
    }
    if let Some(rest) = text.strip_prefix(RAG_PREFIX) {
        return OutputLine::new(LineKind::Content, rest.trim_start());
    }
    OutputLine::new(LineKind::Content, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(line: &str) -> LineKind {
        classify_line(line).kind
    }

    #[test]
    fn sentinel_is_marker() {
        assert_eq!(kind("COMMAND_COMPLETE"), LineKind::Marker);
        assert_eq!(kind("COMMAND_COMPLETE\r"), LineKind::Marker);
        assert_eq!(kind("\x1b[0mCOMMAND_COMPLETE"), LineKind::Marker);
    }

    #[test]
    fn sentinel_inside_text_is_content() {
        assert_eq!(kind("print COMMAND_COMPLETE when done"), LineKind::Content);
    }

    #[test]
    fn prompt_patterns() {
        assert_eq!(kind("You: "), LineKind::Prompt);
        assert_eq!(kind("You:"), LineKind::Prompt);
        assert_eq!(kind(">"), LineKind::Prompt);
        assert_eq!(kind("> "), LineKind::Prompt);
        assert_eq!(kind("Human:   "), LineKind::Prompt);
        assert_eq!(kind("User:"), LineKind::Prompt);
    }

    #[test]
    fn prompt_must_be_trailing() {
        assert_eq!(kind("You: hello"), LineKind::Content);
        assert_eq!(kind("User: what is rust?"), LineKind::Content);
        assert_eq!(kind("a -> b"), LineKind::Content);
    }

    #[test]
    fn log_lines_are_noise() {
        assert_eq!(kind("| INFO | ts | Loading model..."), LineKind::Noise);
        assert_eq!(kind("2024-01-01 | WARNING | low memory"), LineKind::Noise);
        assert_eq!(kind("x |ERROR| boom"), LineKind::Noise);
        assert_eq!(kind("| DEBUG | tokens=12"), LineKind::Noise);
    }

    #[test]
    fn system_tags_and_prefixes_are_noise() {
        assert_eq!(kind("[System] model loaded"), LineKind::Noise);
        assert_eq!(kind("[debug] cache warm"), LineKind::Noise);
        assert_eq!(kind("System: adapter attached"), LineKind::Noise);
        assert_eq!(kind("\x1b[93mBot is thinking...\x1b[0m"), LineKind::Noise);
    }

    #[test]
    fn bare_severity_words_are_content() {
        assert_eq!(kind("INFO is short for information"), LineKind::Content);
        assert_eq!(kind("[1] first reference"), LineKind::Content);
    }

    #[test]
    fn plain_text_is_content() {
        let line = classify_line("Hello, world!");
        assert_eq!(line.kind, LineKind::Content);
        assert_eq!(line.text, "Hello, world!");
    }

    #[test]
    fn ansi_is_stripped_from_content() {
        let line = classify_line("\x1b[92mHello\x1b[0m, \x1b[1;31mworld\x1b[0m!");
        assert_eq!(line.kind, LineKind::Content);
        assert_eq!(line.text, "Hello, world!");
        assert!(!line.text.contains('\x1b'));
    }

    #[test]
    fn strip_ansi_borrows_when_clean() {
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn rag_prefix_is_removed() {
        let line = classify_line("[RAG] Found 3 relevant passages");
        assert_eq!(line.kind, LineKind::Content);
        assert_eq!(line.text, "Found 3 relevant passages");
    }

    #[test]
    fn blank_line_is_blank_content() {
        let line = classify_line("   ");
        assert_eq!(line.kind, LineKind::Content);
        assert!(line.is_blank());
    }
}
