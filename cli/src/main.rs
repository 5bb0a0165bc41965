// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # boxvol
//!
//! Mounts registry-managed volumes on a node: provisions the block image,
//! holds the mount lease, backs the filesystem up through the object-store
//! proxy and hands the lease back on shutdown.
//!
//! ## Commands
//!
//! - `boxvol volume create|open|serve|backup|restore|release|status` - Volume lifecycle
//! - `boxvol volume force-release|force-unlock` - Recover after a node died
//! - `boxvol scan [--watch]` - Reclaim orphaned block images
//! - `boxvol proxy <VOLUME_ID>` - Serve a volume's backup repository
//! - `boxvol config show|validate|generate` - Configuration management
//!
//! Commands that mount run in a private mount namespace entered before the
//! async runtime starts, so mounts vanish with the process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use boxvol_cli::commands::{self, ConfigCommand, ProxyCommand, ScanCommand, VolumeCommand};
use boxvol_cli::embedded;
use boxvol_core::domain::engine_config::EngineConfigManifest;
use boxvol_core::infrastructure::namespace::enter_private_mount_namespace;

/// boxvol - volume lifecycle, lease and backup engine
#[derive(Parser)]
#[command(name = "boxvol")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "BOXVOL_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the manifest's
    #[arg(long, global = true, env = "BOXVOL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json); defaults to the manifest's
    #[arg(long, global = true, env = "BOXVOL_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Volume lifecycle operations
    #[command(name = "volume")]
    Volume {
        #[command(subcommand)]
        command: VolumeCommand,
    },

    /// Reclaim block images no live process refers to
    #[command(name = "scan")]
    Scan {
        #[command(flatten)]
        command: ScanCommand,
    },

    /// Serve a volume's backup repository on a local port
    #[command(name = "proxy")]
    Proxy {
        #[command(flatten)]
        command: ProxyCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        // No command provided - show help
        eprintln!("{}", "No command specified. Use --help for usage.".yellow());
        std::process::exit(1);
    };

    // Config commands report load errors themselves
    if let Commands::Config { command } = command {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
        return build_runtime()?.block_on(commands::config::handle_command(command, cli.config));
    }

    let config = EngineConfigManifest::load_or_default(cli.config)
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    let logging = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.logging.as_ref());
    let level = cli
        .log_level
        .or_else(|| logging.map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = cli
        .log_format
        .or_else(|| logging.map(|l| l.format.clone()))
        .unwrap_or_else(|| "text".to_string());
    init_logging(&level, &format)?;

    if matches!(&command, Commands::Volume { command } if command.mounts()) {
        enter_private_mount_namespace()
            .context("Failed to enter a private mount namespace (requires CAP_SYS_ADMIN)")?;
    }

    build_runtime()?.block_on(async move {
        embedded::install_metrics_exporter(&config)?;
        info!(node = %config.metadata.name, "boxvol starting");

        match command {
            Commands::Volume { command } => commands::volume::handle_command(command, &config).await,
            Commands::Scan { command } => commands::scan::handle_command(command, &config).await,
            Commands::Proxy { command } => commands::proxy::handle_command(command, &config).await,
            Commands::Config { .. } => Ok(()),
        }
    })
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "text" | "compact" => builder.compact().init(),
        other => anyhow::bail!("Unknown log format '{}' (expected text or json)", other),
    }

    Ok(())
}
