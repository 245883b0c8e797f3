//! Tether hub server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use server::config::Config;
use server::hub::{Hub, HubEvent};
use server::registry::RegistryEvent;

/// Tether hub - routes envelopes between agents and viewers.
#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the hub
    Start,

    /// Print the password_sha256 value for an [[auth.users]] entry
    HashPassword {
        /// Plaintext password
        password: String,
    },

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::HashPassword { password } = &cli.command {
        println!("{}", protocol::messages::hash_password(password));
        return Ok(());
    }

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Start => {
            let _guard = server::logging::init(&config.logging, cli.verbose)?;
            tracing::info!("Tether hub starting...");
            if let Some(config_path) = &cli.config {
                tracing::info!("Using config file: {:?}", config_path);
            }

            let mut hub = Hub::new(config);
            run_headless(&mut hub).await?;
        }
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
        }
        Commands::HashPassword { .. } => {}
    }

    Ok(())
}

/// Run the hub until SIGTERM or SIGINT.
async fn run_headless(hub: &mut Hub) -> anyhow::Result<()> {
    hub.start().await?;

    // Subscribe to hub and registry events for logging
    let mut events = hub.subscribe();
    let mut registry_events = hub.registry().subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HubEvent::StateChanged(state) => {
                    tracing::info!("Hub state: {:?}", state);
                }
                HubEvent::Accepted { peer } => {
                    tracing::debug!("Connection from {}", peer);
                }
                HubEvent::HandshakeTimedOut { peer } => {
                    tracing::info!("Handshake timed out: {}", peer);
                }
                HubEvent::Error { message } => {
                    tracing::error!("Hub error: {}", message);
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match registry_events.recv().await {
                Ok(RegistryEvent::Registered { cvid, instance }) => {
                    tracing::info!("Instance online: {:#010x} ({:?})", cvid, instance);
                }
                Ok(RegistryEvent::Unregistered { cvid }) => {
                    tracing::info!("Instance offline: {:#010x}", cvid);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Registry event log skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    hub.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
