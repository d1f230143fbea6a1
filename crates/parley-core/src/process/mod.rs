//! Lifecycle of the single chat-mode child process.
//!
//! [`ProcessSupervisor`] owns at most one child at a time. It launches the
//! child with piped stdio in its own process group, feeds both output streams
//! through an [`OutputRouter`], waits for the ready marker, and tears the
//! whole group down on [`stop`](ProcessSupervisor::stop) or drop.

pub mod router;
pub mod types;

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use router::{OutputRouter, StreamKind};
pub use types::{LaunchSpec, OutputQueue, ProcessEvent, Readiness, SupervisorConfig};

use crate::error::{BridgeError, Result};

/// Owns the child process and its stdin.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    handle: Mutex<Option<ProcessHandle>>,
    /// Serializes launches; the readiness wait runs outside `handle`.
    launching: Mutex<()>,
    /// Aborts a launch still waiting for readiness.
    pending: StdMutex<Option<CancellationToken>>,
    events: broadcast::Sender<ProcessEvent>,
}

/// Everything held for a live child. Dropped as a unit.
struct ProcessHandle {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    readiness: watch::Receiver<Readiness>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            handle: Mutex::new(None),
            launching: Mutex::new(()),
            pending: StdMutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Receive every raw stdout/stderr line from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// Launch `launch` and wait until it prints the ready marker.
    ///
    /// Returns the classified output queue for the new process. On any
    /// failure the partially started child is killed before returning. The
    /// readiness wait does not block [`is_running`](Self::is_running) or
    /// [`stop`](Self::stop); a `stop` during the wait aborts the launch with
    /// [`BridgeError::Cancelled`].
    pub async fn start(&self, launch: &LaunchSpec) -> Result<OutputQueue> {
        let _launching = self.launching.lock().await;

        {
            let mut slot = self.handle.lock().await;
            if let Some(existing) = slot.as_mut() {
                if existing.is_alive() {
                    return Err(BridgeError::AlreadyRunning);
                }
                debug!(pid = existing.pid, "releasing exited model process");
                if let Some(stale) = slot.take() {
                    stale.release();
                }
            }
        }

        if !launch.executable.exists() {
            return Err(BridgeError::not_found(
                "executable",
                launch.executable.clone(),
            ));
        }
        if !launch.script.exists() {
            return Err(BridgeError::not_found("script", launch.script.clone()));
        }

        let mut cmd = Command::new(&launch.executable);
        cmd.arg(&launch.script)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so stop can reach grandchildren.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(BridgeError::ProcessStart)?;
        let pid = child.id().unwrap_or_default();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (router, queue, readiness) =
            OutputRouter::new(self.config.ready_marker.clone(), self.events.clone());
        let router = Arc::new(router);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(stdout, Arc::clone(&router), StreamKind::Stdout));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(stderr, Arc::clone(&router), StreamKind::Stderr));
        }
        drop(router);

        let mut handle = ProcessHandle {
            child,
            pid,
            stdin,
            readers,
            readiness,
        };

        if handle.stdin.is_none() || handle.readers.len() < 2 {
            handle.force_kill().await;
            handle.release();
            return Err(BridgeError::ProcessStart(std::io::Error::other(
                "child stdio was not captured",
            )));
        }

        info!(
            pid,
            executable = %launch.executable.display(),
            script = %launch.script.display(),
            "model process started; waiting for readiness"
        );

        let abort = CancellationToken::new();
        *self.pending_launch() = Some(abort.clone());

        let init_timeout = self.config.init_timeout;
        let outcome = tokio::select! {
            biased;
            () = abort.cancelled() => Err(BridgeError::Cancelled),
            waited = tokio::time::timeout(init_timeout, handle.wait_ready()) => match waited {
                Ok(ready) => ready,
                Err(_) => Err(BridgeError::InitializationTimeout(init_timeout)),
            },
        };

        // Holding the slot while retiring the abort token means a concurrent
        // stop either cancels this launch or finds the stored handle.
        let mut slot = self.handle.lock().await;
        let aborted = self.pending_launch().take().is_none_or(|t| t.is_cancelled());
        let outcome = match outcome {
            Ok(()) if aborted => Err(BridgeError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(()) => {
                info!(pid, "model process ready");
                *slot = Some(handle);
                Ok(queue)
            }
            Err(err) => {
                match &err {
                    BridgeError::InitializationTimeout(timeout) => warn!(
                        pid,
                        ?timeout,
                        "model process did not become ready in time"
                    ),
                    BridgeError::Cancelled => info!(pid, "model launch aborted by stop"),
                    other => warn!(pid, error = %other, "model process failed to initialize"),
                }
                handle.force_kill().await;
                handle.release();
                Err(err)
            }
        }
    }

    /// `true` while a child is owned and has not exited.
    pub async fn is_running(&self) -> bool {
        let mut slot = self.handle.lock().await;
        slot.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    /// `true` while a child is running and has signalled readiness.
    pub async fn is_ready(&self) -> bool {
        let mut slot = self.handle.lock().await;
        slot.as_mut()
            .is_some_and(|h| h.is_alive() && *h.readiness.borrow() == Readiness::Ready)
    }

    /// Write one line (newline appended) to the child's stdin and flush.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut slot = self.handle.lock().await;
        let handle = slot.as_mut().ok_or(BridgeError::NotRunning)?;
        let stdin = handle.stdin.as_mut().ok_or(BridgeError::NotRunning)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        debug!(pid = handle.pid, bytes = line.len() + 1, "wrote command to model process");
        Ok(())
    }

    /// Ask the child to exit, then kill its process group if it lingers.
    ///
    /// Calling `stop` with nothing running is a no-op. After `stop` returns
    /// the supervisor owns no process, even when an error is reported.
    pub async fn stop(&self) -> Result<()> {
        if let Some(launch) = self.pending_launch().take() {
            debug!("aborting launch waiting for readiness");
            launch.cancel();
        }
        let mut slot = self.handle.lock().await;
        let Some(mut handle) = slot.take() else {
            return Ok(());
        };
        let result = handle.shutdown(&self.config).await;
        handle.release();
        result
    }
}

impl ProcessSupervisor {
    fn pending_launch(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.get_mut().take() {
            debug!(pid = handle.pid, "supervisor dropped; killing model process");
            handle.kill_now();
            handle.release();
        }
    }
}

impl ProcessHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait_ready(&mut self) -> Result<()> {
        let state = match self
            .readiness
            .wait_for(|r| *r != Readiness::Pending)
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => Readiness::Failed("output readers terminated".to_string()),
        };
        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(BridgeError::InitializationFailed(reason)),
            Readiness::Pending => Err(BridgeError::InitializationFailed(
                "readiness unresolved".to_string(),
            )),
        }
    }

    async fn shutdown(&mut self, config: &SupervisorConfig) -> Result<()> {
        let pid = self.pid;

        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(pid, ?status, "model process already exited");
            return Ok(());
        }

        let mut failure = None;
        if let Some(mut stdin) = self.stdin.take() {
            let sent = async {
                stdin.write_all(config.exit_command.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = sent {
                debug!(pid, error = %e, "could not send exit command");
            }
            // Dropping stdin delivers EOF to children blocked on read.
        }

        match tokio::time::timeout(config.shutdown_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, ?status, "model process exited");
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "failed waiting for model process; killing");
                self.force_kill().await;
                failure = Some(format!("wait failed: {e}"));
            }
            Err(_) => {
                warn!(
                    pid,
                    grace = ?config.shutdown_grace,
                    "model process ignored exit command; killing"
                );
                self.force_kill().await;
                failure = Some(format!(
                    "did not exit within {:?}",
                    config.shutdown_grace
                ));
            }
        }

        match failure {
            Some(reason) => Err(BridgeError::Shutdown(reason)),
            None => Ok(()),
        }
    }

    /// SIGKILL the whole group, then reap the child.
    async fn force_kill(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            debug!(pid = self.pid, error = %e, "kill after group signal");
        }
    }

    /// Synchronous best-effort kill for drop paths.
    fn kill_now(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "start_kill during drop");
        }
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        {
            if self.pid == 0 {
                return;
            }
            // SAFETY: pid is the leader of the process group created at spawn.
            let ret = unsafe { libc::kill(-(self.pid as i32), libc::SIGKILL) };
            if ret != 0 {
                debug!(pid = self.pid, "process group already gone");
            }
        }
    }

    /// Abort the reader tasks. Closes the output queue once both are gone.
    fn release(self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Read `reader` line by line into `router` until EOF.
///
/// Invalid UTF-8 is replaced rather than ending the stream.
fn spawn_reader<R>(reader: R, router: Arc<OutputRouter>, stream: StreamKind) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    router.route(stream, line.trim_end_matches(['\n', '\r']));
                }
                Err(e) => {
                    warn!(?stream, error = %e, "error reading model process output");
                    break;
                }
            }
        }
        router.closed(stream);
    })
}
