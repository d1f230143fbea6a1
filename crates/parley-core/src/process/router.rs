//! Routes raw child output into the readiness signal, the raw event
//! broadcast, and the classified output queue.

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use super::types::{OutputQueue, ProcessEvent, Readiness};
use crate::classify::{OutputLine, classify_line};

/// Substring on stderr that fails initialization while readiness is pending.
const STDERR_INIT_FAILURE: &str = "Error";

/// Which of the child's streams a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Demultiplexes lines read from the child.
///
/// One router is shared by the stdout and stderr reader tasks of a single
/// process. Every line is broadcast as a [`ProcessEvent`]. Stdout lines are
/// classified and queued in arrival order, except for the first line carrying
/// the ready marker, which only flips readiness.
#[derive(Debug)]
pub struct OutputRouter {
    ready_marker: String,
    queue: mpsc::UnboundedSender<OutputLine>,
    events: broadcast::Sender<ProcessEvent>,
    readiness: watch::Sender<Readiness>,
}

impl OutputRouter {
    pub fn new(
        ready_marker: impl Into<String>,
        events: broadcast::Sender<ProcessEvent>,
    ) -> (Self, OutputQueue, watch::Receiver<Readiness>) {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (readiness, readiness_rx) = watch::channel(Readiness::Pending);
        let router = Self {
            ready_marker: ready_marker.into(),
            queue,
            events,
            readiness,
        };
        (router, queue_rx, readiness_rx)
    }

    pub fn route(&self, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => self.route_stdout(line),
            StreamKind::Stderr => self.route_stderr(line),
        }
    }

    pub fn route_stdout(&self, line: &str) {
        // No subscribers is fine.
        let _ = self.events.send(ProcessEvent::Stdout(line.to_string()));

        if line.contains(self.ready_marker.as_str()) && self.mark(Readiness::Ready) {
            debug!("model process signalled readiness");
            return;
        }

        let classified = classify_line(line);
        trace!(kind = ?classified.kind, text = %classified.text, "stdout line");
        if self.queue.send(classified).is_err() {
            trace!("output queue closed; dropping line");
        }
    }

    pub fn route_stderr(&self, line: &str) {
        let _ = self.events.send(ProcessEvent::Stderr(line.to_string()));
        trace!(text = %line, "stderr line");

        if line.contains(STDERR_INIT_FAILURE)
            && self.mark(Readiness::Failed(line.trim().to_string()))
        {
            warn!(line = %line.trim(), "model process reported an error during initialization");
        }
    }

    /// Called by a reader task when its stream reaches end-of-file.
    pub fn closed(&self, stream: StreamKind) {
        debug!(?stream, "model process stream closed");
        if stream == StreamKind::Stdout {
            self.mark(Readiness::Failed(
                "process exited before signalling readiness".to_string(),
            ));
        }
    }

    /// Transition out of `Pending`. Later transitions are ignored.
    fn mark(&self, next: Readiness) -> bool {
        self.readiness.send_if_modified(|current| {
            if *current == Readiness::Pending {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}
