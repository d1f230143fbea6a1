//! Configuration file management for parley.
//!
//! Provides a TOML-based config file at `~/.config/parley/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use parley_core::{FilterConfig, ModelPaths, SessionConfig, SupervisorConfig};

pub const ENV_PYTHON: &str = "PARLEY_PYTHON";
pub const ENV_SCRIPT: &str = "PARLEY_SCRIPT";
pub const ENV_BASE_CONFIG: &str = "PARLEY_BASE_CONFIG";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub process: ProcessSection,
    pub timeouts: TimeoutSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    /// Python interpreter inside the model's virtualenv.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<PathBuf>,
    /// Entry script of the model runtime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Base YAML config the adapter path is injected into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_config: Option<PathBuf>,
}

/// All values in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub init: u64,
    pub response: u64,
    pub inactivity: u64,
    pub command: u64,
    pub shutdown: u64,
    pub fragment: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            init: 30,
            response: 30,
            inactivity: 3,
            command: 120,
            shutdown: 3,
            fragment: 30,
        }
    }
}

impl TimeoutSection {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("init", self.init),
            ("response", self.response),
            ("inactivity", self.inactivity),
            ("command", self.command),
            ("shutdown", self.shutdown),
            ("fragment", self.fragment),
        ];
        for (name, secs) in fields {
            if secs == 0 {
                bail!("timeouts.{name} must be at least 1 second");
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the parley config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/parley` or `~/.config/parley`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("parley");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("parley")
}

/// Return the path to the parley config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file to `path`, creating parent dirs.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// Load the config file if present. A malformed file is logged and ignored.
fn load_optional(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        return None;
    }
    match load_config_from(path) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring unreadable config file");
            None
        }
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Paths given on the command line.
#[derive(Debug, Default, Clone)]
pub struct PathOverrides {
    pub python: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub base_config: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ParleyConfig {
    pub paths: ModelPaths,
    pub supervisor: SupervisorConfig,
    pub session: SessionConfig,
    pub filter: FilterConfig,
}

impl ParleyConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli: &PathOverrides) -> Result<Self> {
        Self::resolve_with(cli, load_optional(&config_path()))
    }

    fn resolve_with(cli: &PathOverrides, file: Option<ConfigFile>) -> Result<Self> {
        let file = file.unwrap_or_default();
        let defaults = ModelPaths::default();

        let paths = ModelPaths {
            python: pick(
                cli.python.as_ref(),
                ENV_PYTHON,
                file.process.python,
                defaults.python,
            ),
            script: pick(
                cli.script.as_ref(),
                ENV_SCRIPT,
                file.process.script,
                defaults.script,
            ),
            base_config: pick(
                cli.base_config.as_ref(),
                ENV_BASE_CONFIG,
                file.process.base_config,
                defaults.base_config,
            ),
        };

        let t = &file.timeouts;
        t.validate()?;

        Ok(Self {
            paths,
            supervisor: SupervisorConfig {
                init_timeout: Duration::from_secs(t.init),
                shutdown_grace: Duration::from_secs(t.shutdown),
                ..SupervisorConfig::default()
            },
            session: SessionConfig {
                response_timeout: Duration::from_secs(t.response),
                inactivity_window: Duration::from_secs(t.inactivity),
                hard_deadline: Duration::from_secs(t.command),
                ..SessionConfig::default()
            },
            filter: FilterConfig {
                fragment_timeout: Duration::from_secs(t.fragment),
                ..FilterConfig::default()
            },
        })
    }
}

fn pick(cli: Option<&PathBuf>, env: &str, file: Option<PathBuf>, default: PathBuf) -> PathBuf {
    if let Some(path) = cli {
        return path.clone();
    }
    if let Some(path) = std::env::var_os(env).filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }
    file.unwrap_or(default)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
