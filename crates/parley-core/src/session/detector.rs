//! Decides when a command's response is finished.
//!
//! The detector is a pure state machine over classified lines and instants.
//! The command session feeds it lines from the output queue and asks it for
//! the next deadline to sleep until; no I/O happens here.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::SessionConfig;
use crate::classify::{LineKind, OutputLine};
use crate::error::{BridgeError, Result};

/// Progress of a single command's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// Command written, no content yet.
    AwaitingOutput,
    /// At least one content line accepted.
    ResponseStarted,
    /// Finished by marker, prompt, inactivity, or partial timeout.
    Completed,
    /// Idle or hard deadline hit with nothing collected.
    TimedOut,
}

/// What to do with an observed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Append this text to the response.
    Accept(String),
    /// Discard the line and keep waiting.
    Skip,
    /// The response is complete; this line is not part of it.
    Finish,
}

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    state: CompletionState,
    response_timeout: Duration,
    inactivity_window: Duration,
    hard_limit: Duration,
    started: Instant,
    last_line: Instant,
    last_content: Option<Instant>,
}

impl CompletionDetector {
    /// A detector for a command written at `now`.
    pub fn new(config: &SessionConfig, now: Instant) -> Self {
        Self {
            state: CompletionState::AwaitingOutput,
            response_timeout: config.response_timeout,
            inactivity_window: config.inactivity_window,
            hard_limit: config.hard_deadline,
            started: now,
            last_line: now,
            last_content: None,
        }
    }

    pub fn state(&self) -> CompletionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            CompletionState::Completed | CompletionState::TimedOut
        )
    }

    /// Feed one line received at `now`.
    ///
    /// Any line, noise included, proves the child is alive and resets the
    /// idle timer. Only accepted content resets the inactivity window.
    pub fn observe(&mut self, line: OutputLine, now: Instant) -> Step {
        if self.is_finished() {
            return Step::Finish;
        }
        self.last_line = now;

        match line.kind {
            LineKind::Marker | LineKind::Prompt => {
                debug!(kind = ?line.kind, "response terminated by child");
                self.state = CompletionState::Completed;
                Step::Finish
            }
            LineKind::Noise => Step::Skip,
            LineKind::Content
                if line.is_blank() && self.state == CompletionState::AwaitingOutput =>
            {
                Step::Skip
            }
            LineKind::Content => {
                self.state = CompletionState::ResponseStarted;
                self.last_content = Some(now);
                Step::Accept(line.text)
            }
        }
    }

    /// Earliest instant at which [`check_timers`](Self::check_timers) can
    /// change the outcome.
    pub fn next_deadline(&self) -> Instant {
        let hard = self.started + self.hard_limit;
        let idle = self.last_line + self.response_timeout;
        let mut deadline = hard.min(idle);
        if let Some(content) = self.last_content {
            deadline = deadline.min(content + self.inactivity_window);
        }
        deadline
    }

    /// Apply whichever timers have expired by `now`.
    ///
    /// Returns `Ok(true)` when the response is complete, `Ok(false)` to keep
    /// waiting, and `ResponseTimeout` when time ran out before any content.
    /// Content collected before a timeout is kept as a successful response.
    pub fn check_timers(&mut self, now: Instant) -> Result<bool> {
        if self.is_finished() {
            return Ok(self.state == CompletionState::Completed);
        }

        if let Some(content) = self.last_content {
            if now >= content + self.inactivity_window {
                debug!(
                    window = ?self.inactivity_window,
                    "response complete after inactivity"
                );
                self.state = CompletionState::Completed;
                return Ok(true);
            }
        }

        let idle_expired = now >= self.last_line + self.response_timeout;
        let hard_expired = now >= self.started + self.hard_limit;
        if !idle_expired && !hard_expired {
            return Ok(false);
        }

        let limit = if hard_expired {
            self.hard_limit
        } else {
            self.response_timeout
        };
        if self.state == CompletionState::ResponseStarted {
            warn!(limit = ?limit, "response timed out; returning partial output");
            self.state = CompletionState::Completed;
            Ok(true)
        } else {
            self.state = CompletionState::TimedOut;
            Err(BridgeError::ResponseTimeout(limit))
        }
    }

    /// The output queue closed because the child went away.
    pub fn on_closed(&mut self) -> Result<()> {
        match self.state {
            CompletionState::ResponseStarted | CompletionState::Completed => {
                self.state = CompletionState::Completed;
                Ok(())
            }
            CompletionState::AwaitingOutput | CompletionState::TimedOut => {
                self.state = CompletionState::TimedOut;
                Err(BridgeError::ProcessExited)
            }
        }
    }
}
