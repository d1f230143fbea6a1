//! Error taxonomy for the process bridge.

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the supervisor, the command session, and the layers
/// built on top of them.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{what} not found at {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("model process is already running")]
    AlreadyRunning,

    #[error("model process is not running or not initialized")]
    NotRunning,

    #[error("timed out after {0:?} waiting for the model process to become ready")]
    InitializationTimeout(Duration),

    #[error("model process failed to initialize: {0}")]
    InitializationFailed(String),

    #[error("failed to start model process: {0}")]
    ProcessStart(#[source] std::io::Error),

    #[error("no response from model process within {0:?}")]
    ResponseTimeout(Duration),

    #[error("response stream stalled for {0:?} between fragments")]
    StreamTimeout(Duration),

    #[error("model process exited before producing a response")]
    ProcessExited,

    #[error("model process did not shut down cleanly and was killed: {0}")]
    Shutdown(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::NotFound`].
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            what,
            path: path.into(),
        }
    }

    /// `true` for errors caused by the caller cancelling the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` for the timeout family (readiness, response, stream).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::InitializationTimeout(_) | Self::ResponseTimeout(_) | Self::StreamTimeout(_)
        )
    }
}

/// Result alias used throughout `parley-core`.
pub type Result<T> = std::result::Result<T, BridgeError>;
