// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use boxvol_core::domain::engine_config::EngineConfigManifest;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default filled in
    Generate {
        /// Output path (default: ./boxvol-config.yaml)
        #[arg(short, long, default_value = "./boxvol-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = EngineConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. BOXVOL_CONFIG_PATH: {}",
            std::env::var("BOXVOL_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./boxvol-config.yaml");
        println!("  4. ~/.boxvol/config.yaml");
        println!("  5. /etc/boxvol/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    let spec = &config.spec;
    println!("{}", "Registry:".bold());
    println!("  URL: {}", spec.registry.url);
    println!(
        "  Token: {}",
        if spec.registry.token.is_empty() {
            "(not set)".dimmed().to_string()
        } else {
            "<redacted>".to_string()
        }
    );
    if let Some(box_id) = &spec.registry.box_id {
        println!("  Box: {}", box_id);
    }
    println!();

    println!("{}", "Storage:".bold());
    println!("  Volumes root: {}", spec.storage.volumes_root.display());
    println!("  Size multiplier: {}", spec.storage.size_multiplier);
    println!();

    println!("{}", "Scheduler:".bold());
    println!("  Refresh every: {:?}", spec.scheduler.refresh_interval);
    println!("  Backup every: {:?}", spec.scheduler.backup_interval);
    println!("  Backup retry after: {:?}", spec.scheduler.backup_retry_interval);
    println!("  Final backup attempts: {}", spec.scheduler.final_backup_attempts);
    println!("  Release policy: {:?}", spec.scheduler.release_policy);
    println!();

    println!("{}", "Backup:".bold());
    println!("  restic: {}", spec.backup.restic_binary.display());
    println!("  Proxy bind: {}", spec.backup.proxy_bind);
    println!();

    println!("{}", "Orphan scanner:".bold());
    println!("  /proc root: {}", spec.scanner.proc_root.display());
    println!("  Minimum age: {:?}", spec.scanner.min_age);
    println!("  Interval: {:?}", spec.scanner.interval);

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = EngineConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", output.display());
    }

    let sample = serde_yaml::to_string(&EngineConfigManifest::default())
        .context("Failed to serialize default configuration")?;

    tokio::fs::write(&output, sample)
        .await
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boxvol-config.yaml");

        generate(path.clone(), false).await.unwrap();
        let config = EngineConfigManifest::from_yaml_file(&path).unwrap();
        config.validate().unwrap();

        assert!(generate(path.clone(), false).await.is_err());
        generate(path, true).await.unwrap();
    }
}
