//! Cleans a raw streamed response before it reaches the user.
//!
//! Chat children usually print the whole transcript turn: an echo of the
//! user's line, an `Assistant:` marker, the answer, and a fresh prompt.
//! [`ResponseStreamFilter`] keeps only the assistant's turn, drops log
//! noise and ANSI styling, and coalesces tiny fragments into readable
//! chunks. When a child never prints a turn marker, the filter falls back
//! to passing everything through with role prefixes removed.

use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use tracing::{debug, trace};

use crate::classify::{is_noise, is_prompt, strip_ansi};
use crate::error::BridgeError;
use crate::session::FragmentStream;

const OPENING_MARKERS: &[&str] = &["Assistant:", "Bot:"];
const CLOSING_MARKERS: &[&str] = &["User:", "Human:", "You:"];
const ROLE_PREFIXES: &[&str] = &["Assistant:", "Bot:", "Human:", "User:"];
const CHUNK_BOUNDARY: &[char] = &['.', '!', '?', ',', ':', ';'];

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Longest gap allowed between fragments once streaming has started.
    pub fragment_timeout: Duration,
    /// Emit buffered text once it reaches this many characters.
    pub min_chunk_chars: usize,
    /// Fragments held while looking for an opening marker before falling
    /// back to passthrough.
    pub holdback_fragments: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            fragment_timeout: Duration::from_secs(30),
            min_chunk_chars: 20,
            holdback_fragments: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// No opening marker seen yet; fragments are held back.
    Searching,
    /// Inside the assistant's turn.
    InTurn,
    /// No marker appeared; everything non-noise is forwarded.
    Passthrough,
    /// The turn closed; remaining fragments are ignored.
    Done,
}

#[derive(Debug, Clone)]
pub struct ResponseStreamFilter {
    config: FilterConfig,
    mode: Mode,
    holdback: Vec<String>,
    /// Non-blank fragments in `holdback`.
    held_content: usize,
    pending: String,
    emitted: bool,
}

impl ResponseStreamFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            mode: Mode::Searching,
            holdback: Vec::new(),
            held_content: 0,
            pending: String::new(),
            emitted: false,
        }
    }

    pub fn in_assistant_turn(&self) -> bool {
        self.mode == Mode::InTurn
    }

    /// `true` once a closing marker ended the turn.
    pub fn is_done(&self) -> bool {
        self.mode == Mode::Done
    }

    /// Feed one raw fragment and return the chunks now ready to emit.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.mode == Mode::Done {
            return out;
        }

        let text = strip_ansi(fragment);
        let trimmed = text.trim();

        if trimmed.is_empty() {
            // Keep interior blank lines, drop leading ones.
            if self.is_emitting() && (self.emitted || !self.pending.is_empty()) {
                self.accept(&text, &mut out);
            } else if self.mode == Mode::Searching && self.held_content > 0 {
                self.holdback.push(text.into_owned());
            }
            return out;
        }
        if is_noise(trimmed) {
            trace!(fragment = %trimmed, "dropping noise fragment");
            return out;
        }

        match self.mode {
            Mode::Searching => {
                if let Some(rest) = after_opening_marker(&text) {
                    if !self.holdback.is_empty() {
                        debug!(
                            discarded = self.holdback.len(),
                            "assistant turn opened; dropping echoed fragments"
                        );
                        self.holdback.clear();
                        self.held_content = 0;
                    }
                    self.mode = Mode::InTurn;
                    self.accept_after_marker(rest, &mut out);
                } else if is_turn_closing(trimmed) {
                    trace!(fragment = %trimmed, "dropping echoed user turn");
                } else {
                    self.holdback.push(text.into_owned());
                    self.held_content += 1;
                    if self.held_content > self.config.holdback_fragments {
                        debug!("no assistant marker; passing output through");
                        self.mode = Mode::Passthrough;
                        self.release_holdback(&mut out);
                    }
                }
            }
            Mode::InTurn | Mode::Passthrough => {
                if is_turn_closing(trimmed) {
                    debug!("assistant turn closed");
                    self.mode = Mode::Done;
                    self.flush(&mut out);
                } else if let Some(rest) = after_opening_marker(&text) {
                    self.mode = Mode::InTurn;
                    self.accept_after_marker(rest, &mut out);
                } else {
                    self.accept(strip_role_prefix(&text), &mut out);
                }
            }
            Mode::Done => {}
        }
        out
    }

    /// The source ended: release held fragments and flush buffered text.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.mode == Mode::Searching && !self.holdback.is_empty() {
            debug!(
                held = self.holdback.len(),
                "stream ended without assistant marker; passing output through"
            );
            self.release_holdback(&mut out);
        }
        self.flush(&mut out);
        self.mode = Mode::Done;
        out
    }

    /// Filter `source`, enforcing the per-fragment timeout after the first
    /// fragment arrives. Dropping the returned stream drops `source`.
    pub fn apply(mut self, source: FragmentStream) -> FragmentStream {
        let timeout = self.config.fragment_timeout;
        Box::pin(stream! {
            let mut source = source;
            let mut started = false;
            loop {
                let next = if started {
                    match tokio::time::timeout(timeout, source.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            for chunk in self.finish() {
                                yield Ok(chunk);
                            }
                            yield Err(BridgeError::StreamTimeout(timeout));
                            return;
                        }
                    }
                } else {
                    source.next().await
                };
                started = true;

                match next {
                    Some(Ok(fragment)) => {
                        for chunk in self.push(&fragment) {
                            yield Ok(chunk);
                        }
                        if self.is_done() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        for chunk in self.finish() {
                            yield Ok(chunk);
                        }
                        yield Err(err);
                        return;
                    }
                    None => break,
                }
            }
            for chunk in self.finish() {
                yield Ok(chunk);
            }
        })
    }

    fn is_emitting(&self) -> bool {
        matches!(self.mode, Mode::InTurn | Mode::Passthrough)
    }

    fn accept(&mut self, text: &str, out: &mut Vec<String>) {
        if text.is_empty() {
            return;
        }
        self.pending.push_str(text);
        let long_enough = self.pending.chars().count() >= self.config.min_chunk_chars;
        let at_boundary = self
            .pending
            .chars()
            .last()
            .is_some_and(|c| c.is_whitespace() || CHUNK_BOUNDARY.contains(&c));
        if long_enough || at_boundary {
            self.flush(out);
        }
    }

    /// A bare marker line contributes nothing, not even its newline.
    fn accept_after_marker(&mut self, rest: &str, out: &mut Vec<String>) {
        if !rest.trim().is_empty() {
            self.accept(rest, out);
        }
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        if !self.pending.is_empty() {
            out.push(std::mem::take(&mut self.pending));
            self.emitted = true;
        }
    }

    fn release_holdback(&mut self, out: &mut Vec<String>) {
        self.held_content = 0;
        for held in std::mem::take(&mut self.holdback) {
            self.accept(strip_role_prefix(&held), out);
        }
    }
}

impl Default for ResponseStreamFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

/// Text after an opening marker that starts the fragment or follows
/// whitespace. `None` if there is no such marker.
fn after_opening_marker(text: &str) -> Option<&str> {
    OPENING_MARKERS.iter().find_map(|marker| {
        text.match_indices(*marker)
            .find(|(i, _)| {
                text[..*i]
                    .chars()
                    .next_back()
                    .is_none_or(char::is_whitespace)
            })
            .map(|(i, _)| text[i + marker.len()..].trim_start_matches([' ', '\t']))
    })
}

fn is_turn_closing(trimmed: &str) -> bool {
    CLOSING_MARKERS.iter().any(|m| trimmed.starts_with(m)) || is_prompt(trimmed)
}

fn strip_role_prefix(text: &str) -> &str {
    let lead = text.trim_start();
    ROLE_PREFIXES
        .iter()
        .find_map(|p| lead.strip_prefix(p))
        .map_or(text, str::trim_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fragments: &[&str]) -> String {
        let mut filter = ResponseStreamFilter::default();
        let mut out: Vec<String> = Vec::new();
        for f in fragments {
            out.extend(filter.push(f));
        }
        out.extend(filter.finish());
        out.concat()
    }

    #[test]
    fn keeps_only_the_assistant_turn() {
        let out = run(&[
            "User: what is rust?\n",
            "Assistant: A systems language.\n",
            "It is memory safe.\n",
            "You: \n",
            "late output\n",
        ]);
        assert_eq!(out, "A systems language.\nIt is memory safe.\n");
    }

    #[test]
    fn marker_on_its_own_fragment() {
        let out = run(&["Assistant:\n", "Hello there.\n", "Human: \n"]);
        assert_eq!(out, "Hello there.\n");
    }

    #[test]
    fn bot_marker_opens_turn() {
        let out = run(&["some echo\n", "Bot: hi!\n"]);
        assert_eq!(out, "hi!\n");
    }

    #[test]
    fn marker_inside_word_does_not_open_turn() {
        assert_eq!(after_opening_marker("RoBot: beep"), None);
        assert_eq!(after_opening_marker("  Bot: beep"), Some("beep"));
    }

    #[test]
    fn unmarked_output_passes_through_at_end() {
        let out = run(&["You said: hello\n"]);
        assert_eq!(out, "You said: hello\n");
    }

    #[test]
    fn holdback_overflow_switches_to_passthrough() {
        let mut filter = ResponseStreamFilter::default();
        assert!(filter.push("one\n").is_empty());
        assert!(filter.push("two\n").is_empty());
        assert!(filter.push("three\n").is_empty());
        let released = filter.push("four\n");
        assert_eq!(released.concat(), "one\ntwo\nthree\nfour\n");
        assert_eq!(filter.push("five\n").concat(), "five\n");
    }

    #[test]
    fn passthrough_strips_role_prefixes() {
        let out = run(&["Human: echo\n", "plain\n", "Assistant answer\n"]);
        assert_eq!(out, "plain\nAssistant answer\n");
        assert_eq!(strip_role_prefix("Assistant: hi\n"), "hi\n");
        assert_eq!(strip_role_prefix("hi\n"), "hi\n");
    }

    #[test]
    fn noise_and_ansi_are_removed() {
        let out = run(&[
            "Assistant:\n",
            "| INFO | generating\n",
            "\x1b[92mGreen text.\x1b[0m\n",
            "[System] tokens=42\n",
        ]);
        assert_eq!(out, "Green text.\n");
    }

    #[test]
    fn small_fragments_coalesce_until_boundary() {
        let mut filter = ResponseStreamFilter::default();
        filter.push("Assistant:");
        assert!(filter.push("Hel").is_empty());
        assert!(filter.push("lo").is_empty());
        assert!(filter.push(" wor").is_empty());
        assert_eq!(filter.push("ld."), vec!["Hello world.".to_string()]);
    }

    #[test]
    fn long_pending_text_is_emitted() {
        let mut filter = ResponseStreamFilter::default();
        filter.push("Assistant:");
        assert!(filter.push("abcdefghij").is_empty());
        assert_eq!(
            filter.push("klmnopqrstu"),
            vec!["abcdefghijklmnopqrstu".to_string()]
        );
    }

    #[test]
    fn partial_fragment_is_flushed_on_finish() {
        let mut filter = ResponseStreamFilter::default();
        filter.push("Assistant:");
        assert!(filter.push("tail").is_empty());
        assert_eq!(filter.finish(), vec!["tail".to_string()]);
        assert!(filter.is_done());
    }

    #[test]
    fn interior_blank_lines_survive() {
        let out = run(&["Assistant:\n", "\n", "para one\n", "\n", "para two\n"]);
        assert_eq!(out, "para one\n\npara two\n");
    }

    #[test]
    fn blank_lines_match_with_or_without_marker() {
        let body = ["\n", "first line\n", "\n", "third line\n"];
        let unmarked = run(&body);
        let mut marked = vec!["Assistant:\n"];
        marked.extend(body);
        assert_eq!(unmarked, "first line\n\nthird line\n");
        assert_eq!(unmarked, run(&marked));
    }

    #[test]
    fn blank_lines_do_not_count_toward_holdback() {
        let mut filter = ResponseStreamFilter::default();
        for fragment in ["one\n", "\n", "two\n", "\n", "three\n"] {
            assert!(filter.push(fragment).is_empty());
        }
        assert_eq!(filter.push("four\n").concat(), "one\n\ntwo\n\nthree\nfour\n");
    }

    #[test]
    fn turn_state_is_reported() {
        let mut filter = ResponseStreamFilter::default();
        assert!(!filter.in_assistant_turn());
        filter.push("Assistant: hi\n");
        assert!(filter.in_assistant_turn());
        filter.push("You:\n");
        assert!(!filter.in_assistant_turn());
        assert!(filter.is_done());
    }

    fn source(items: Vec<crate::error::Result<String>>) -> FragmentStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn apply_stops_at_closing_marker() {
        let filtered = ResponseStreamFilter::default().apply(source(vec![
            Ok("Assistant: Hi.\n".into()),
            Ok("You: \n".into()),
            Ok("never seen\n".into()),
        ]));
        let chunks: Vec<String> = filtered.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), "Hi.\n");
    }

    #[tokio::test]
    async fn apply_flushes_then_forwards_errors() {
        let filtered = ResponseStreamFilter::default().apply(source(vec![
            Ok("Assistant:".into()),
            Ok("partial".into()),
            Err(BridgeError::ProcessExited),
        ]));
        let items: Vec<_> = filtered.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(BridgeError::ProcessExited)));
    }

    #[tokio::test]
    async fn apply_times_out_between_fragments() {
        let config = FilterConfig {
            fragment_timeout: Duration::from_millis(50),
            ..FilterConfig::default()
        };
        let stalled: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok("Assistant: waiting".to_string())])
                .chain(futures::stream::pending()),
        );
        let items: Vec<_> = ResponseStreamFilter::new(config)
            .apply(stalled)
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "waiting");
        assert!(matches!(items[1], Err(BridgeError::StreamTimeout(_))));
    }
}
