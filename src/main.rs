// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! simutraced — trace storage server
//!
//! Usage:
//!   simutraced serve --config simutrace.toml
//!   simutraced config-check --config simutrace.toml

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simutrace::config::ServerConfig;
use simutrace::server::{self, RootContext};

#[derive(Parser)]
#[command(name = "simutraced", about = "Trace storage server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server and serve configured bindings until shutdown.
    Serve {
        #[arg(short, long, default_value = "simutrace.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file without starting the server.
    ConfigCheck {
        #[arg(short, long, default_value = "simutrace.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve { config } => run_serve(config).await,
        Command::ConfigCheck { config } => run_config_check(config),
    };

    if let Err(e) = result {
        error!(error = %e, "fatal error");
        std::process::exit(-1);
    }
}

async fn run_serve(config_path: PathBuf) -> simutrace::error::Result<()> {
    let config = ServerConfig::from_file(&config_path)?;
    info!(path = ?config_path, "configuration loaded");

    let root = Arc::new(RootContext::new(config));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    server::run(root, shutdown).await
}

fn run_config_check(config_path: PathBuf) -> simutrace::error::Result<()> {
    let config = ServerConfig::from_file(&config_path)?;
    info!(bindings = %config.server.bindings, "configuration is valid");
    Ok(())
}
