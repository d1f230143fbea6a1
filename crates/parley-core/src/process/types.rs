//! Types shared between the supervisor, the output router, and callers.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::classify::OutputLine;

/// Ordered queue of classified stdout lines, consumed by the command session.
pub type OutputQueue = mpsc::UnboundedReceiver<OutputLine>;

/// A raw line observed on one of the child's output streams.
///
/// Fired for every line regardless of classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
}

impl ProcessEvent {
    pub fn line(&self) -> &str {
        match self {
            Self::Stdout(line) | Self::Stderr(line) => line,
        }
    }
}

/// Readiness of the child as observed by the output router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// What to launch: `executable script args...`.
///
/// Arguments are passed through unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub script: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments, in order.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Substring on stdout that means the child accepts commands.
    pub ready_marker: String,
    /// How long `start` waits for `ready_marker`.
    pub init_timeout: Duration,
    /// How long `stop` waits for a natural exit before killing.
    pub shutdown_grace: Duration,
    /// Line written to stdin to request a graceful exit.
    pub exit_command: String,
    /// Capacity of the raw line broadcast channel.
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_marker: "Entering chat mode".to_string(),
            init_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(3),
            exit_command: "exit".to_string(),
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_keeps_argument_order() {
        let spec = LaunchSpec::new("/usr/bin/python3", "main.py")
            .args(["--mode", "chat"])
            .arg("--config")
            .arg("cfg.yaml");
        assert_eq!(spec.args, vec!["--mode", "chat", "--config", "cfg.yaml"]);
        assert_eq!(spec.script, PathBuf::from("main.py"));
    }

    #[test]
    fn supervisor_defaults() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.ready_marker, "Entering chat mode");
        assert_eq!(cfg.init_timeout, Duration::from_secs(30));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(3));
        assert_eq!(cfg.exit_command, "exit");
    }

    #[test]
    fn event_line_accessor() {
        assert_eq!(ProcessEvent::Stdout("a".into()).line(), "a");
        assert_eq!(ProcessEvent::Stderr("b".into()).line(), "b");
    }
}
