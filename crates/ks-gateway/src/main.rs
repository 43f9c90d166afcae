//! kubeshell gateway daemon
//!
//! Provisions per-user environments in the cluster and relays interactive
//! SSH shells to WebSocket clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ks_core::config::{self, GatewayConfig};
use ks_gateway::auth::{hash_password, StaticUsers};
use ks_gateway::cluster::KubeClient;
use ks_gateway::ssh::RusshTransport;
use ks_gateway::GatewayState;

#[derive(Parser)]
#[command(name = "ks-gateway")]
#[command(about = "kubeshell gateway daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the password hash to put in the users table
    HashPassword {
        /// Password to hash
        password: String,
    },
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Some(Command::HashPassword { password }) => {
            println!("{}", hash_password(password));
            return Ok(());
        }
        Some(Command::InitConfig { force }) => {
            let path = args.config.clone().unwrap_or_else(config::default_config_path);
            if path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
            }
            config::save_config(&path, &GatewayConfig::default())
                .with_context(|| format!("Failed to write config to {:?}", path))?;
            println!("Wrote default configuration to {}", path.display());
            return Ok(());
        }
        None => {}
    }

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("kubeshell gateway starting...");

    // Load configuration
    let config: GatewayConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                GatewayConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            GatewayConfig::default()
        }
    };

    // Override bind address if specified
    let bind_addr = args.bind.clone().unwrap_or_else(|| config.bind_address.clone());

    let users = StaticUsers::from_entries(&config.users).context("Invalid users table")?;
    if users.is_empty() {
        tracing::warn!("No users configured - every login will be rejected");
    } else {
        tracing::info!("Loaded {} users", users.len());
    }

    let cluster = KubeClient::from_config(&config.cluster).context("Invalid cluster config")?;
    tracing::info!("Using cluster API at {}", config.cluster.api_url);
    if config.cluster.node_host.is_none() {
        tracing::warn!("No node host configured - endpoints will carry only the node port");
    }

    let transport = RusshTransport::new(config.connect_timeout, config.output_buffer);

    let state = Arc::new(GatewayState::new(
        config,
        Arc::new(users),
        Arc::new(cluster),
        Arc::new(transport),
    ));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    ks_gateway::server::serve(&bind_addr, state, cancel).await?;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}
