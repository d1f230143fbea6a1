//! One-command-at-a-time conversation with the model process.
//!
//! [`CommandSession`] serializes commands through a FIFO gate that also owns
//! the output queue, so only the command holding the gate can read output.
//! Each command drains leftovers from earlier commands, writes one line, and
//! collects output until the [`CompletionDetector`] says the response is done.

pub mod bridge;
pub mod detector;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use bridge::{FragmentStream, ProcessBridge};
pub use detector::{CompletionDetector, CompletionState, Step};

use crate::error::{BridgeError, Result};
use crate::process::{LaunchSpec, OutputQueue, ProcessEvent, ProcessSupervisor, SupervisorConfig};

/// Timing knobs for response collection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Give up if no line at all arrives for this long.
    pub response_timeout: Duration,
    /// Treat the response as complete after this long without new content.
    pub inactivity_window: Duration,
    /// Absolute limit on a single command, measured from the write.
    pub hard_deadline: Duration,
    /// Fragments buffered between the collector task and a streaming reader.
    pub stream_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            inactivity_window: Duration::from_secs(3),
            hard_deadline: Duration::from_secs(120),
            stream_buffer: 32,
        }
    }
}

/// The gate: whoever holds it owns the output queue.
type Gate = Arc<Mutex<Option<OutputQueue>>>;

pub struct CommandSession {
    supervisor: ProcessSupervisor,
    gate: Gate,
    config: SessionConfig,
}

impl CommandSession {
    pub fn new(supervisor: SupervisorConfig, config: SessionConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(supervisor),
            gate: Arc::new(Mutex::new(None)),
            config,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start the child and take ownership of its output queue.
    pub async fn start(&self, launch: &LaunchSpec) -> Result<()> {
        if self.supervisor.is_running().await {
            return Err(BridgeError::AlreadyRunning);
        }
        let mut gate = self.gate.lock().await;
        let queue = self.supervisor.start(launch).await?;
        *gate = Some(queue);
        Ok(())
    }

    /// Send one command and wait for its complete response.
    ///
    /// Accepted lines are joined with `\n`; trailing whitespace is trimmed.
    pub async fn send(&self, command: &str, cancel: &CancellationToken) -> Result<String> {
        let mut gate = self.acquire(cancel).await?;
        let queue = self.prepare(&mut gate, command).await?;

        let detector = CompletionDetector::new(&self.config, Instant::now());
        let mut collector = Collector { queue, detector };
        let mut lines = Vec::new();
        while let Some(line) = collector.next(cancel).await? {
            lines.push(line);
        }

        let response = lines.join("\n").trim_end().to_string();
        info!(
            lines = lines.len(),
            chars = response.len(),
            "command completed"
        );
        Ok(response)
    }

    /// Send one command and stream its response line by line.
    ///
    /// Each fragment is one accepted line with a trailing `\n`. The gate is
    /// held until the response completes, errors, is cancelled, or the
    /// returned stream is dropped.
    pub async fn send_streaming(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream> {
        let mut gate = self.acquire(cancel).await?;
        self.prepare(&mut gate, command).await?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let detector = CompletionDetector::new(&self.config, Instant::now());
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut gate = gate;
            let Some(queue) = gate.as_mut() else {
                return;
            };
            let mut collector = Collector { queue, detector };
            loop {
                let next = tokio::select! {
                    next = collector.next(&cancel) => next,
                    () = tx.closed() => {
                        debug!("stream reader went away; releasing command gate");
                        break;
                    }
                };
                match next {
                    Ok(Some(line)) => {
                        if tx.send(Ok(format!("{line}\n"))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("streamed command completed");
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.is_running().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.supervisor.subscribe()
    }

    /// Wait for the gate in FIFO order, or give up on cancellation.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedMutexGuard<Option<OutputQueue>>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BridgeError::Cancelled),
            guard = Arc::clone(&self.gate).lock_owned() => Ok(guard),
        }
    }

    /// With the gate held: check readiness, drop stale output, write.
    async fn prepare<'g>(
        &self,
        gate: &'g mut OwnedMutexGuard<Option<OutputQueue>>,
        command: &str,
    ) -> Result<&'g mut OutputQueue> {
        if !self.supervisor.is_ready().await {
            return Err(BridgeError::NotRunning);
        }
        let queue = gate.as_mut().ok_or(BridgeError::NotRunning)?;

        let mut stale = 0usize;
        while queue.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "discarded output left over from an earlier command");
        }

        self.supervisor.write_line(command).await?;
        debug!(command_len = command.len(), "command sent");
        Ok(queue)
    }
}

/// Pulls accepted lines for one command off the queue.
struct Collector<'q> {
    queue: &'q mut OutputQueue,
    detector: CompletionDetector,
}

impl Collector<'_> {
    /// Next accepted line, `None` when the response is complete.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<String>> {
        loop {
            if self.detector.is_finished() || self.detector.check_timers(Instant::now())? {
                return Ok(None);
            }
            let deadline = self.detector.next_deadline();

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("command cancelled; discarding partial response");
                    return Err(BridgeError::Cancelled);
                }
                line = self.queue.recv() => match line {
                    Some(line) => match self.detector.observe(line, Instant::now()) {
                        Step::Accept(text) => return Ok(Some(text)),
                        Step::Skip => {}
                        Step::Finish => return Ok(None),
                    },
                    None => {
                        warn!("output queue closed while awaiting a response");
                        self.detector.on_closed()?;
                        return Ok(None);
                    }
                },
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

#[async_trait]
impl ProcessBridge for CommandSession {
    async fn start(&self, launch: &LaunchSpec) -> Result<()> {
        CommandSession::start(self, launch).await
    }

    async fn send(&self, command: &str, cancel: &CancellationToken) -> Result<String> {
        CommandSession::send(self, command, cancel).await
    }

    async fn send_streaming(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream> {
        CommandSession::send_streaming(self, command, cancel).await
    }

    async fn stop(&self) -> Result<()> {
        CommandSession::stop(self).await
    }

    async fn is_running(&self) -> bool {
        CommandSession::is_running(self).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        CommandSession::subscribe(self)
    }
}
