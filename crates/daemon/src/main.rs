//! Shellbridge Daemon
//!
//! Serves interactive shells over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::provision::{activation_script, Provisioner};
use daemon::server::{ServerSettings, ShellServer};
use tracing_subscriber::EnvFilter;

/// Shellbridge - interactive shells over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "shellbridge")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Provision the environment and accept connections
    Serve {
        /// Port to listen on (overrides TERMINAL_PORT)
        #[arg(long, short)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Directory shells start in and the environment lives under
        #[arg(long, value_name = "DIR")]
        work_dir: Option<PathBuf>,
    },

    /// Create the environment and activation script, then exit
    Provision {
        /// Directory the environment lives under
        #[arg(long, value_name = "DIR")]
        work_dir: Option<PathBuf>,

        /// Print the activation script after writing it
        #[arg(long)]
        print_script: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

impl Commands {
    /// Whether the command needs a runnable configuration.
    ///
    /// `config` only prints settings, so it works even when the shell
    /// cannot be resolved on this host.
    fn requires_valid_config(&self) -> bool {
        !matches!(self, Commands::Config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Command line flags win over both
    match &cli.command {
        Commands::Serve {
            port,
            host,
            work_dir,
        } => {
            if let Some(port) = port {
                config.network.port = *port;
            }
            if let Some(host) = host {
                config.network.host = host.clone();
            }
            if let Some(dir) = work_dir {
                config.daemon.work_dir = dir.clone();
            }
        }
        Commands::Provision { work_dir, .. } => {
            if let Some(dir) = work_dir {
                config.daemon.work_dir = dir.clone();
            }
        }
        Commands::Config => {}
    }
    config.daemon.work_dir = std::path::absolute(&config.daemon.work_dir)
        .with_context(|| format!("Invalid work dir: {}", config.daemon.work_dir.display()))?;

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    if cli.command.requires_valid_config() {
        config.validate()?;
    }

    match cli.command {
        Commands::Serve { .. } => serve(config).await?,
        Commands::Provision { print_script, .. } => provision(&config, print_script).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Provision the environment, then serve until SIGINT or SIGTERM.
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        work_dir = %config.daemon.work_dir.display(),
        shell = %config.session.shell,
        "Shellbridge starting"
    );

    // Provisioning failure is fatal: no connection is accepted without a sandbox
    let provisioner = Arc::new(Provisioner::from_config(&config));
    let environment = {
        let provisioner = Arc::clone(&provisioner);
        tokio::task::spawn_blocking(move || provisioner.ensure_environment())
            .await
            .context("Provisioning task failed")?
            .context("Failed to provision Python environment")?
    };
    tracing::info!(
        venv = %environment.root.display(),
        script = %environment.activation_script.display(),
        "Environment ready"
    );

    let server = ShellServer::bind(
        config.bind_addr()?,
        ServerSettings::from_config(&config),
        provisioner,
    )
    .await?;
    tracing::info!("Terminal server running on ws://{}", server.local_addr()?);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signals: {}", e),
        }
        shutdown.cancel();
    });

    server.run().await?;
    tracing::info!("Shellbridge stopped");

    Ok(())
}

/// Provision the environment and report where it lives.
async fn provision(config: &Config, print_script: bool) -> anyhow::Result<()> {
    let provisioner = Provisioner::from_config(config);
    let environment = tokio::task::spawn_blocking(move || provisioner.ensure_environment())
        .await
        .context("Provisioning task failed")?
        .context("Failed to provision Python environment")?;

    println!("Environment: {}", environment.root.display());
    println!("Activation script: {}", environment.activation_script.display());

    if print_script {
        println!();
        print!("{}", activation_script(&environment));
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
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
