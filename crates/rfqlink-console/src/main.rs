//! rfqlink operator console
//!
//! Opens a link to the controller, prints every frame it sends and forwards
//! typed lines as commands. Logs go to stderr so stdout carries only data.

mod commands;

use anyhow::Context;
use clap::Parser;
use rfqlink_core::prelude::*;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use commands::ConsoleCommand;

/// How often queued link events are drained
const PUMP_INTERVAL_MS: u64 = 20;

#[derive(Parser, Debug)]
#[command(name = "rfqlink-console", version, about = "Serial console for the RFQ test controller")]
struct Args {
    /// Serial device path (e.g. /dev/ttyUSB0 or COM3)
    #[arg(short, long, required_unless_present = "demo")]
    port: Option<String>,

    /// Human readable name for the port
    #[arg(short, long, default_value = "")]
    description: String,

    /// Link configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Talk to a simulated controller instead of a serial device
    #[arg(long)]
    demo: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

/// Default config location: <config dir>/rfqlink/link.json
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rfqlink").join("link.json"))
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<LinkConfig> {
    if let Some(path) = explicit {
        return LinkConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            tracing::info!("Using config {}", path.display());
            LinkConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))
        }
        _ => Ok(LinkConfig::default()),
    }
}

/// Renders link events on the terminal
struct EventPrinter {
    json: bool,
}

impl Dispatcher for EventPrinter {
    fn dispatch(&mut self, event: LinkEvent) {
        if self.json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("Failed to encode event: {}", e),
            }
            return;
        }

        match event {
            LinkEvent::FrameReceived(frame) => println!("{}", frame.to_text()),
            LinkEvent::ConnectSucceeded(port) => tracing::info!("Connected to {}", port),
            LinkEvent::Disconnected(port) => tracing::info!("Disconnected from {}", port),
            LinkEvent::ConnectError(reason) => tracing::error!("Connection failed: {}", reason),
            LinkEvent::ReaderError(reason) => tracing::error!("Link lost: {}", reason),
            LinkEvent::ReaderStarted | LinkEvent::ReaderStopped => {
                tracing::debug!("{}", event.kind())
            }
        }
    }
}

/// Forward stdin lines on a plain thread so a pending read never holds up shutdown
fn spawn_stdin_reader(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
}

/// Open/close block for up to the close timeout; keep them off the async workers
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    tokio::task::block_in_place(f)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("rfqlink-console {}", rfqlink_core::VERSION);
    let config = load_config(args.config.as_deref())?;

    let port = match &args.port {
        Some(path) => PortDescriptor::new(path.clone(), args.description.clone()),
        None => PortDescriptor::new("demo", "Simulated RFQ controller"),
    };

    let mut manager = if args.demo {
        ConnectionManager::with_opener(config, Box::new(DemoOpener::new()))
    } else {
        ConnectionManager::new(config)
    };
    let mut printer = EventPrinter { json: args.json };

    // Failures surface as a ConnectError event; the operator can retry with :open
    let _ = blocking(|| manager.open(port.clone()));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    spawn_stdin_reader(line_tx);

    let mut ticker = tokio::time::interval(Duration::from_millis(PUMP_INTERVAL_MS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.pump(&mut printer, Duration::ZERO);
            }
            line = line_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                match ConsoleCommand::parse(&line) {
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Empty => {}
                    ConsoleCommand::Open => {
                        let _ = blocking(|| manager.open(port.clone()));
                    }
                    ConsoleCommand::Close => {
                        blocking(|| manager.close())?;
                    }
                    ConsoleCommand::Status => {
                        tracing::info!("State: {:?}", manager.state());
                    }
                    ConsoleCommand::Unknown(directive) => {
                        tracing::warn!("Unknown directive :{}", directive);
                    }
                    ConsoleCommand::Send(command) => {
                        if let Err(e) = manager.send(&command) {
                            tracing::warn!("{}", e);
                        }
                    }
                }
            }
        }
    }

    blocking(|| manager.close())?;
    manager.pump(&mut printer, Duration::from_millis(PUMP_INTERVAL_MS));
    Ok(())
}
