//! `parley chat` and `parley ask`.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_core::{
    AdapterInfo, ChatService, CommandSession, ProcessEvent, ServiceEvent, SpecialCommand,
};

use crate::config::{ParleyConfig, PathOverrides};

const HELP: &str = "\
Commands:
  /help               Show this help
  /clear              Clear the conversation history
  /loadrag <path>     Load documents for retrieval
  /ragstatus          Show retrieval status
  /exit, /quit        End the session
Anything else is sent to the model. Ctrl+C cancels a response.";

/// Resolve config, describe the adapter, and start the model.
async fn start_service(adapter_dir: &Path, overrides: PathOverrides) -> Result<ChatService> {
    let config = ParleyConfig::resolve(&overrides)?;
    let adapter = AdapterInfo::from_dir(adapter_dir)
        .await
        .with_context(|| format!("failed to load adapter at {}", adapter_dir.display()))?;

    let session = CommandSession::new(config.supervisor, config.session);
    let service = ChatService::new(Arc::new(session), config.paths, config.filter);

    info!(adapter = %adapter.name, "starting model");
    service
        .initialize(adapter, None)
        .await
        .context("failed to start the model process")?;
    Ok(service)
}

/// Execute the `parley ask` command: one prompt, one response.
pub async fn run_ask(adapter_dir: &Path, overrides: PathOverrides, prompt: &str) -> Result<()> {
    let service = start_service(adapter_dir, overrides).await?;

    let result = service.generate(prompt, &CancellationToken::new()).await;
    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "model process did not shut down cleanly");
    }

    let response = result.context("model did not answer")?;
    println!("{response}");
    Ok(())
}

/// Tracks the in-flight response so Ctrl+C can cancel it.
///
/// First Ctrl+C cancels the current response; a second one before the next
/// response starts exits the process.
#[derive(Default)]
struct Interrupts {
    current: Mutex<CancellationToken>,
    pending: AtomicBool,
}

impl Interrupts {
    /// Fresh token for a new response.
    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        self.pending.store(false, Ordering::SeqCst);
        token
    }

    /// Returns `false` when this is the second interrupt in a row.
    fn interrupt(&self) -> bool {
        if self.pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        true
    }
}

/// Execute the `parley chat` command: interactive loop over stdin.
pub async fn run_chat(
    adapter_dir: &Path,
    overrides: PathOverrides,
    show_process_output: bool,
) -> Result<()> {
    let service = start_service(adapter_dir, overrides).await?;
    if let Some(adapter) = service.current_adapter().await {
        println!("Loaded adapter: {}", adapter.name);
    }
    println!("{HELP}\n");

    spawn_service_logger(&service);
    if show_process_output {
        spawn_process_echo(&service);
    }

    let interrupts = Arc::new(Interrupts::default());
    {
        let interrupts = Arc::clone(&interrupts);
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if !interrupts.interrupt() {
                    eprintln!("\nForce exit.");
                    std::process::exit(130);
                }
                eprintln!("\nCancelled (Ctrl+C again to exit).");
            }
        });
    }

    let result = chat_loop(&service, &interrupts).await;

    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "model process did not shut down cleanly");
    }
    println!("Goodbye.");
    result
}

async fn chat_loop(service: &ChatService, interrupts: &Interrupts) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            println!();
            return Ok(());
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.to_ascii_lowercase().as_str() {
            "/exit" | "/quit" => return Ok(()),
            "/help" => {
                println!("{HELP}");
                continue;
            }
            _ => {}
        }

        if let Some(command) = SpecialCommand::parse(input) {
            match service.execute_special(&command, &interrupts.begin()).await {
                Ok(reply) => println!("{reply}"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => eprintln!("Error: {e}"),
            }
            continue;
        }

        let cancel = interrupts.begin();
        if !stream_response(service, input, &cancel).await? {
            recover(service, &interrupts.begin()).await;
        }
    }
}

/// Print one streamed response. Returns `false` if it failed.
async fn stream_response(
    service: &ChatService,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    print!("Assistant: ");
    std::io::stdout().flush()?;

    let mut stream = match service.generate_streaming(prompt, cancel).await {
        Ok(stream) => stream,
        Err(e) if e.is_cancelled() => {
            println!();
            return Ok(true);
        }
        Err(e) => {
            println!();
            eprintln!("Error: {e}");
            return Ok(false);
        }
    };

    let mut ok = true;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                print!("{chunk}");
                std::io::stdout().flush()?;
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                eprintln!("\nError: {e}");
                ok = false;
                break;
            }
        }
    }
    println!();
    Ok(ok)
}

/// Clear the model's history after a failed response.
async fn recover(service: &ChatService, cancel: &CancellationToken) {
    match service.execute_special(&SpecialCommand::Clear, cancel).await {
        Ok(_) => info!("cleared conversation after failed response"),
        Err(e) if e.is_cancelled() => info!("recovery command cancelled"),
        Err(e) => warn!(error = %e, "recovery command failed"),
    }
}

fn spawn_service_logger(service: &ChatService) {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::Status(message)) => info!(%message, "model service"),
                Ok(ServiceEvent::Error(message)) => warn!(%message, "model service"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "service events dropped"),
                Err(RecvError::Closed) => return,
            }
        }
    });
}

fn spawn_process_echo(service: &ChatService) {
    let mut events = service.process_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProcessEvent::Stdout(line)) => eprintln!("[model] {line}"),
                Ok(ProcessEvent::Stderr(line)) => eprintln!("[model:err] {line}"),
                Err(RecvError::Lagged(skipped)) => eprintln!("[model] ... {skipped} lines skipped"),
                Err(RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interrupt_cancels_current_response() {
        let interrupts = Interrupts::default();
        let token = interrupts.begin();
        assert!(interrupts.interrupt());
        assert!(token.is_cancelled());
    }

    #[test]
    fn second_interrupt_requests_exit() {
        let interrupts = Interrupts::default();
        interrupts.begin();
        assert!(interrupts.interrupt());
        assert!(!interrupts.interrupt());
    }

    #[test]
    fn new_response_resets_interrupts() {
        let interrupts = Interrupts::default();
        let first = interrupts.begin();
        assert!(interrupts.interrupt());

        let second = interrupts.begin();
        assert!(!second.is_cancelled());
        assert!(interrupts.interrupt());
        assert!(first.is_cancelled() && second.is_cancelled());
    }
}
