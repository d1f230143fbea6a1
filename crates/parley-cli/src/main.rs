mod chat_cmd;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::{ConfigFile, PathOverrides, ProcessSection};

#[derive(Parser)]
#[command(name = "parley", about = "Chat with a fine-tuned model running as a local process")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Model runtime locations shared by commands that launch the model.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProcessArgs {
    /// Python interpreter (overrides PARLEY_PYTHON env var)
    #[arg(long)]
    python: Option<PathBuf>,
    /// Model entry script (overrides PARLEY_SCRIPT env var)
    #[arg(long)]
    script: Option<PathBuf>,
    /// Base model config YAML (overrides PARLEY_BASE_CONFIG env var)
    #[arg(long = "config")]
    base_config: Option<PathBuf>,
}

impl From<ProcessArgs> for PathOverrides {
    fn from(args: ProcessArgs) -> Self {
        Self {
            python: args.python,
            script: args.script,
            base_config: args.base_config,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a parley config file
    Init {
        #[command(flatten)]
        process: ProcessArgs,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start an interactive chat with an adapter
    Chat {
        /// Adapter directory to load
        #[arg(long)]
        adapter: PathBuf,
        #[command(flatten)]
        process: ProcessArgs,
        /// Echo raw model process output to stderr
        #[arg(long)]
        show_process_output: bool,
    },
    /// Send a single prompt and print the response
    Ask {
        /// Adapter directory to load
        #[arg(long)]
        adapter: PathBuf,
        #[command(flatten)]
        process: ProcessArgs,
        /// Prompt text
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Chat output owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { process, force } => {
            cmd_init(process, force)?;
        }
        Commands::Chat {
            adapter,
            process,
            show_process_output,
        } => {
            chat_cmd::run_chat(&adapter, process.into(), show_process_output).await?;
        }
        Commands::Ask {
            adapter,
            process,
            prompt,
        } => {
            chat_cmd::run_ask(&adapter, process.into(), &prompt).await?;
        }
    }

    Ok(())
}

/// Execute the `parley init` command: write the config file.
fn cmd_init(process: ProcessArgs, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let resolved = config::ParleyConfig::resolve(&PathOverrides::from(process))?;
    let cfg = ConfigFile {
        process: ProcessSection {
            python: Some(resolved.paths.python.clone()),
            script: Some(resolved.paths.script.clone()),
            base_config: Some(resolved.paths.base_config.clone()),
        },
        ..ConfigFile::default()
    };

    config::save_config_to(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  process.python      = {}", resolved.paths.python.display());
    println!("  process.script      = {}", resolved.paths.script.display());
    println!("  process.base_config = {}", resolved.paths.base_config.display());
    println!();
    println!("Next: run `parley chat --adapter <dir>` to start chatting.");

    Ok(())
}
