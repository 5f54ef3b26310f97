//! tidewaterd — the Tidewater daemon.
//!
//! # Usage
//!
//! ```text
//! tidewaterd standalone --data-dir /var/lib/tidewater --fleet fleet.toml < events.ndjson
//! tidewaterd default-config > tidewater.toml
//! ```
//!
//! Standalone mode reads control events from stdin, one JSON object per
//! line, and writes one JSON reply per line to stdout. Once stdin closes
//! the daemon exits after in-flight watchers settle, or on Ctrl-C.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use tidewater_core::ControllerConfig;
use tidewater_platform::MemoryPlatform;
use tidewater_state::StateStore;
use tidewaterd::{Controller, FleetSeed};

#[derive(Parser)]
#[command(name = "tidewaterd", about = "Tidewater deployment and fleet controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against the in-memory platform, reading events from stdin.
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/tidewater")]
        data_dir: PathBuf,

        /// Controller configuration (tidewater.toml). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Fleet seed describing clusters, groups and workers.
        #[arg(long)]
        fleet: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,tidewater=debug,tidewaterd=debug")
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            config,
            fleet,
            log_json,
        } => {
            init_tracing(log_json);
            run_standalone(data_dir, config, fleet).await
        }
        Command::DefaultConfig => {
            print!("{}", ControllerConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_standalone(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    fleet_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Tidewater daemon starting in standalone mode");

    let config = match &config_path {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("tidewater.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let platform = MemoryPlatform::new();
    if let Some(path) = &fleet_path {
        FleetSeed::from_file(path)?
            .apply(&platform, &config.drain.lifecycle_transition)
            .await;
    }

    let controller = Controller::standalone(store, platform, &config);
    controller.resume().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let stdin_closed = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let reply = controller.handle_line(&line).await;
                        stdout.write_all(reply.as_bytes()).await?;
                        stdout.write_all(b"\n").await?;
                        stdout.flush().await?;
                    }
                    None => break true,
                }
            }
            signal = &mut shutdown => {
                signal.expect("failed to install CTRL+C handler");
                break false;
            }
        }
    };
    if stdin_closed {
        info!("stdin closed, waiting for in-flight watchers");
        tokio::select! {
            _ = controller.settle() => info!("all watchers settled"),
            signal = &mut shutdown => {
                signal.expect("failed to install CTRL+C handler");
                info!("shutdown signal received");
            }
        }
    } else {
        info!("shutdown signal received");
    }

    let active = controller.orchestrator().watchers().active().await.len()
        + controller.drain().watchers().active().await.len();
    if active > 0 {
        warn!(active, "shutting down with watchers in flight; they resume on next start");
    }
    info!("Tidewater daemon stopped");
    Ok(())
}
