//! Model service: adapter-aware startup and chat operations on top of a
//! [`ProcessBridge`].
//!
//! [`ChatService`] renders a per-launch config pointing the model at the
//! chosen adapter, starts the child in chat mode, and exposes
//! send-and-wait, filtered streaming, and slash commands.

pub mod config_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config_file::{TempModelConfig, render_adapter_config};

use crate::adapter::AdapterInfo;
use crate::error::{BridgeError, Result};
use crate::filter::{FilterConfig, ResponseStreamFilter};
use crate::process::{LaunchSpec, ProcessEvent};
use crate::session::{FragmentStream, ProcessBridge};

pub const CLEAR_COMMAND: &str = "/clear";
pub const LOAD_RAG_COMMAND: &str = "/loadrag";
pub const RAG_STATUS_COMMAND: &str = "/ragstatus";
pub const HELP_COMMAND: &str = "/help";

/// Where the model runtime lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub python: PathBuf,
    pub script: PathBuf,
    pub base_config: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            python: PathBuf::from("llm_training-main/venv/bin/python"),
            script: PathBuf::from("llm_training-main/main.py"),
            base_config: PathBuf::from("llm_training-main/config.yaml"),
        }
    }
}

/// Service-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Status(String),
    Error(String),
}

/// A slash command understood by the model's chat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialCommand {
    Clear,
    LoadRag(String),
    RagStatus,
    Help,
    Other(String),
}

impl SpecialCommand {
    /// Parse `input` if it is a slash command.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if !input.starts_with('/') {
            return None;
        }
        let (head, rest) = input
            .split_once(char::is_whitespace)
            .map_or((input, ""), |(h, r)| (h, r.trim()));
        let command = match head.to_ascii_lowercase().as_str() {
            CLEAR_COMMAND => Self::Clear,
            LOAD_RAG_COMMAND => Self::LoadRag(rest.to_string()),
            RAG_STATUS_COMMAND => Self::RagStatus,
            HELP_COMMAND => Self::Help,
            _ => Self::Other(input.to_string()),
        };
        Some(command)
    }

    /// The line written to the child.
    pub fn to_line(&self) -> String {
        match self {
            Self::Clear => CLEAR_COMMAND.to_string(),
            Self::LoadRag(path) => format!("{LOAD_RAG_COMMAND} {path}"),
            Self::RagStatus => RAG_STATUS_COMMAND.to_string(),
            Self::Help => HELP_COMMAND.to_string(),
            Self::Other(line) => line.clone(),
        }
    }
}

pub struct ChatService {
    bridge: Arc<dyn ProcessBridge>,
    paths: ModelPaths,
    filter: FilterConfig,
    /// Current adapter; the lock also serializes initialization.
    adapter: Mutex<Option<AdapterInfo>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl ChatService {
    pub fn new(bridge: Arc<dyn ProcessBridge>, paths: ModelPaths, filter: FilterConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            bridge,
            paths,
            filter,
            adapter: Mutex::new(None),
            events,
        }
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Raw child output, straight from the bridge.
    pub fn process_events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.bridge.subscribe()
    }

    /// Start the model with `adapter`, replacing any running instance.
    ///
    /// `base_config` overrides [`ModelPaths::base_config`]. The rendered
    /// temporary config is removed once startup finishes, whether or not
    /// it succeeded.
    pub async fn initialize(&self, adapter: AdapterInfo, base_config: Option<&Path>) -> Result<()> {
        let mut current = self.adapter.lock().await;
        let result = self.launch(&adapter, base_config).await;
        match result {
            Ok(()) => {
                info!(adapter = %adapter.name, "model initialized");
                self.status(format!("Model initialized with adapter: {}", adapter.name));
                *current = Some(adapter);
                Ok(())
            }
            Err(err) => {
                *current = None;
                self.error(format!("Failed to initialize model: {err}"));
                Err(err)
            }
        }
    }

    async fn launch(&self, adapter: &AdapterInfo, base_config: Option<&Path>) -> Result<()> {
        if self.bridge.is_running().await {
            if let Err(err) = self.bridge.stop().await {
                warn!(error = %err, "previous model process did not stop cleanly");
            }
        }

        if !adapter.path.is_dir() {
            return Err(BridgeError::not_found("adapter directory", adapter.path.clone()));
        }
        let base = base_config.unwrap_or(self.paths.base_config.as_path());
        if !base.is_file() {
            return Err(BridgeError::not_found("config file", base));
        }

        let temp = TempModelConfig::write(base, &adapter.path).await?;
        let launch = LaunchSpec::new(&self.paths.python, &self.paths.script)
            .args(["--mode", "chat", "--config"])
            .arg(temp.path().display().to_string());
        self.bridge.start(&launch).await
    }

    pub async fn is_initialized(&self) -> bool {
        let current = self.adapter.lock().await;
        current.is_some() && self.bridge.is_running().await
    }

    pub async fn current_adapter(&self) -> Option<AdapterInfo> {
        self.adapter.lock().await.clone()
    }

    /// Send `prompt` and wait for the full response.
    pub async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        self.ensure_initialized().await?;
        self.bridge
            .send(prompt, cancel)
            .await
            .inspect_err(|e| self.report(e, "generating response"))
    }

    /// Send `prompt` and stream the cleaned assistant turn.
    pub async fn generate_streaming(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream> {
        self.ensure_initialized().await?;
        let raw = self
            .bridge
            .send_streaming(prompt, cancel)
            .await
            .inspect_err(|e| self.report(e, "streaming response"))?;

        let events = self.events.clone();
        let filtered = ResponseStreamFilter::new(self.filter.clone())
            .apply(raw)
            .inspect(move |item| {
                if let Err(e) = item {
                    if !e.is_cancelled() {
                        let _ = events.send(ServiceEvent::Error(format!(
                            "Error streaming response: {e}"
                        )));
                    }
                }
            });
        Ok(Box::pin(filtered))
    }

    /// Run a slash command and return the child's reply.
    pub async fn execute_special(
        &self,
        command: &SpecialCommand,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.ensure_initialized().await?;
        match command {
            SpecialCommand::LoadRag(path) if path.is_empty() => {
                return Err(BridgeError::InvalidCommand(format!(
                    "{LOAD_RAG_COMMAND} requires a document path"
                )));
            }
            SpecialCommand::Other(line) if line.trim_start_matches('/').trim().is_empty() => {
                return Err(BridgeError::InvalidCommand(
                    "empty command after '/'".to_string(),
                ));
            }
            SpecialCommand::LoadRag(_) => self.status("Loading RAG documents...".to_string()),
            _ => {}
        }

        let response = self
            .bridge
            .send(&command.to_line(), cancel)
            .await
            .inspect_err(|e| self.report(e, "executing command"))?;
        if !response.is_empty() {
            self.status(response.clone());
        }
        Ok(response)
    }

    /// Stop the model process. A no-op when nothing is running.
    pub async fn shutdown(&self) -> Result<()> {
        let mut current = self.adapter.lock().await;
        *current = None;
        self.bridge.stop().await
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized().await {
            Ok(())
        } else {
            Err(BridgeError::NotRunning)
        }
    }

    fn report(&self, err: &BridgeError, during: &str) {
        if err.is_cancelled() {
            return;
        }
        warn!(error = %err, "error {during}");
        self.error(format!("Error {during}: {err}"));
    }

    fn status(&self, message: String) {
        let _ = self.events.send(ServiceEvent::Status(message));
    }

    fn error(&self, message: String) {
        let _ = self.events.send(ServiceEvent::Error(message));
    }
}
