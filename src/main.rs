// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use modeldock::config::{default_config_path, Config};
use modeldock::download::{DownloadManager, ManagerOptions};
use modeldock::library::ModelFolders;
use modeldock::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "modeldock")]
#[command(version = VERSION)]
#[command(about = "Resumable model downloads with live progress.")]
#[command(long_about = "modeldock - model file download manager\n\n\
    Start the server:    modeldock (or: modeldock serve)\n\
    Show config:         modeldock config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Port to listen on (overrides the config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Address to bind to (overrides the config file)
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Path to config.json (default: ~/.modeldock/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket server (default)
    ///
    /// Example:
    ///   modeldock serve --port 8787
    Serve,

    /// Inspect configuration
    ///
    /// Example:
    ///   modeldock config show
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with API keys masked
    Show,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "modeldock=debug" } else { "modeldock=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn show_config(config: &Config, path: Option<&PathBuf>) -> Result<()> {
    let location = match path {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    println!("# {}", location.display());
    println!("{}", serde_json::to_string_pretty(&config.masked())?);
    Ok(())
}

async fn start_server(config: Config) -> Result<()> {
    let options = ManagerOptions::from_config(&config)?;
    let resolver = Arc::new(ModelFolders::from_config(&config));
    if config.model_folders.is_empty() {
        tracing::warn!("No model_folders configured; every download will be rejected");
    }

    let port = config.port;
    let bind_address = config.bind_address.clone();
    let manager = DownloadManager::new(options, resolver, Arc::new(config))?;

    Server::new(manager, port)
        .with_bind_address(bind_address)
        .start()
        .await
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }

    match cli.command {
        Some(Commands::Config {
            command: ConfigCommands::Show,
        }) => show_config(&config, cli.config.as_ref()),
        Some(Commands::Serve) | None => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(start_server(config))
        }
    }
}
