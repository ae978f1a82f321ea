mod config;
mod credentials;
mod daemon;
mod error;
mod executor;
mod performer;
mod protocol;
mod session;
mod state;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::performer::LlmPerformer;
use crate::supervisor::ConnectionSupervisor;

#[derive(Parser)]
#[command(name = "market-connect", about = "Lobster Market agent connector", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Agent id to announce (default: inferred by the broker)
    #[arg(long, global = true)]
    agent_id: Option<String>,

    /// Maximum number of tasks executed at once
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and take tasks in the foreground (default)
    Serve,
    /// Start the connector in background
    Start,
    /// Stop the background connector
    Stop,
    /// Show connection state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start) => return daemon::daemonize(),
        Some(Commands::Stop) => return daemon::stop_daemon(),
        Some(Commands::Status) => return daemon::show_status(),
        Some(Commands::Serve) | None => {}
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout)
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let mut config = config::ConnectConfig::load_or_default(&config_path)?.with_env_overrides();
    if let Some(agent_id) = cli.agent_id {
        config.agent_id = Some(agent_id);
    }
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent = max;
    }
    config.validate()?;

    let performer = LlmPerformer::new(&config.performer);
    info!("Server: {}", config.ws_url);
    info!("Max concurrent tasks: {}", config.max_concurrent);
    info!("Work performer: {}", performer.backend_name());

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;

    daemon::write_pid_file()?;
    let result = ConnectionSupervisor::new(config, Arc::new(performer))
        .run(cancel)
        .await;
    daemon::remove_pid_file();
    result
}

/// Cancel on SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Shutting down...");
        cancel.cancel();
    });
    Ok(())
}
