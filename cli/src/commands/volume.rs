// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume lifecycle commands
//!
//! Commands: create, open, serve, backup, restore, release, status,
//! force-release, force-unlock

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::{error, info};

use boxvol_core::application::{LifecycleScheduler, MountLeaseClient, ShutdownReport};
use boxvol_core::domain::engine_config::EngineConfigManifest;
use boxvol_core::domain::lease::{MountState, ReleasePolicy};
use boxvol_core::domain::registry::VolumeRegistry;
use boxvol_core::domain::volume::VolumeId;
use boxvol_core::domain::local_state::StateError;
use boxvol_core::infrastructure::state_store::StateStore;

use crate::embedded::{self, VolumeRuntime};

#[derive(Args, Debug, Clone)]
pub struct VolumeArgs {
    /// Volume identifier in the registry
    #[arg(value_name = "VOLUME_ID")]
    pub volume_id: String,

    /// Volume directory (default: <volumes_root>/<VOLUME_ID>)
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// Acquire the lease and provision the block image, leaving it inactive
    Create(VolumeArgs),

    /// Attach and mount the image, confirm the lease, then detach keeping it
    Open(VolumeArgs),

    /// Serve the volume until SIGTERM, then back up and release it
    Serve {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Create the volume first if this directory has no local state
        #[arg(long)]
        create: bool,

        /// Skip replaying the latest snapshot on open
        #[arg(long)]
        no_restore: bool,
    },

    /// Take one backup and detach, keeping the lease
    Backup(VolumeArgs),

    /// Replay the latest snapshot into the volume and detach
    Restore(VolumeArgs),

    /// Final backup, release the lease and remove the volume directory
    Release {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Release even if the final backup fails
        #[arg(long)]
        best_effort: bool,
    },

    /// Show local state and the registry's lease record
    Status(VolumeArgs),

    /// Clear the lease of a node that died without releasing
    ForceRelease {
        #[arg(value_name = "VOLUME_ID")]
        volume_id: String,
    },

    /// Remove stale locks from the volume's backup repository
    ForceUnlock {
        #[arg(value_name = "VOLUME_ID")]
        volume_id: String,
    },
}

impl VolumeCommand {
    /// Whether the command mounts anything in this process
    pub fn mounts(&self) -> bool {
        !matches!(
            self,
            Self::Status(_) | Self::ForceRelease { .. } | Self::ForceUnlock { .. }
        )
    }
}

pub async fn handle_command(command: VolumeCommand, config: &EngineConfigManifest) -> Result<()> {
    match command {
        VolumeCommand::Create(args) => create(config, args).await,
        VolumeCommand::Open(args) => open(config, args).await,
        VolumeCommand::Serve {
            volume,
            create,
            no_restore,
        } => serve(config, volume, create, !no_restore).await,
        VolumeCommand::Backup(args) => backup(config, args).await,
        VolumeCommand::Restore(args) => restore(config, args).await,
        VolumeCommand::Release {
            volume,
            best_effort,
        } => release(config, volume, best_effort).await,
        VolumeCommand::Status(args) => status(config, args).await,
        VolumeCommand::ForceRelease { volume_id } => force_release(config, &volume_id).await,
        VolumeCommand::ForceUnlock { volume_id } => force_unlock(config, &volume_id).await,
    }
}

fn parse_volume_id(id: &str) -> Result<VolumeId> {
    VolumeId::new(id).with_context(|| format!("Invalid volume id '{}'", id))
}

async fn start(config: &EngineConfigManifest, args: VolumeArgs) -> Result<VolumeRuntime> {
    let volume_id = parse_volume_id(&args.volume_id)?;
    VolumeRuntime::start(config, volume_id, args.dir).await
}

/// Open the image and confirm the lease with the registry
async fn open_serving(client: &mut MountLeaseClient) -> Result<()> {
    client.open().await.context("Failed to open volume")?;
    client
        .refresh_mount()
        .await
        .context("Failed to refresh lease")?;
    Ok(())
}

/// Detach and report kernel-level leftovers
async fn detach(client: &mut MountLeaseClient) -> Result<()> {
    let errors = client.detach().await.context("Failed to detach volume")?;
    for e in &errors {
        println!("  {} {}", "⚠".yellow(), e);
    }
    Ok(())
}

async fn create(config: &EngineConfigManifest, args: VolumeArgs) -> Result<()> {
    let mut runtime = start(config, args).await?;
    let result = async {
        runtime
            .client
            .create()
            .await
            .context("Failed to create volume")?;
        // leave the image inactive until a process opens it
        detach(&mut runtime.client).await
    }
    .await;
    let dir = runtime.client.dir().to_path_buf();
    let mount = runtime.client.mount_id().map(|m| m.to_string());
    runtime.stop().await?;
    result?;

    println!("{}", "✓ Volume created".green());
    println!("  Directory: {}", dir.display());
    if let Some(mount) = mount {
        println!("  Lease:     {}", mount);
    }
    Ok(())
}

async fn open(config: &EngineConfigManifest, args: VolumeArgs) -> Result<()> {
    let mut runtime = start(config, args).await?;
    let result = async {
        open_serving(&mut runtime.client).await?;
        detach(&mut runtime.client).await
    }
    .await;
    runtime.stop().await?;
    result?;

    println!("{}", "✓ Volume opened and lease confirmed".green());
    Ok(())
}

async fn serve(
    config: &EngineConfigManifest,
    args: VolumeArgs,
    create: bool,
    restore: bool,
) -> Result<()> {
    let mut runtime = start(config, args).await?;
    let scheduler = LifecycleScheduler::new(config.spec.scheduler.clone());
    let signal = embedded::cancel_on_signal(scheduler.shutdown_token());

    let session = async {
        let client = &mut runtime.client;
        if client.state() == MountState::Unprovisioned {
            if !create {
                anyhow::bail!(
                    "No local state in {}; run `boxvol volume create` or pass --create",
                    client.dir().display()
                );
            }
            client.create().await.context("Failed to create volume")?;
        }
        client.open().await.context("Failed to open volume")?;
        if restore {
            if let Some(snapshot) = client
                .restore_from_latest_snapshot()
                .await
                .context("Failed to restore latest snapshot")?
            {
                info!(snapshot_id = %snapshot, "Restored latest snapshot");
            }
        }

        info!(volume_id = %client.volume_id(), "Serving volume");
        let stats = scheduler.run(client).await;
        match &stats {
            Ok(stats) => info!(
                refreshes = stats.refreshes,
                backups = stats.backups,
                backup_failures = stats.backup_failures,
                "Serving session ended"
            ),
            Err(e) => error!(error = %e, "Serving session failed"),
        }

        let report = client
            .shutdown(&scheduler.shutdown_options())
            .await
            .context("Shutdown failed")?;
        print_shutdown_report(&report);
        stats.context("Serving session failed")?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    scheduler.shutdown_token().cancel();
    let _ = signal.await;
    runtime.stop().await?;
    session
}

async fn backup(config: &EngineConfigManifest, args: VolumeArgs) -> Result<()> {
    let mut runtime = start(config, args).await?;
    let result = async {
        open_serving(&mut runtime.client).await?;
        let snapshot = runtime.client.backup().await.context("Backup failed");
        detach(&mut runtime.client).await?;
        snapshot
    }
    .await;
    runtime.stop().await?;

    let snapshot = result?;
    println!("{} {}", "✓ Snapshot created:".green(), snapshot);
    Ok(())
}

async fn restore(config: &EngineConfigManifest, args: VolumeArgs) -> Result<()> {
    let mut runtime = start(config, args).await?;
    let result = async {
        runtime.client.open().await.context("Failed to open volume")?;
        let restored = runtime
            .client
            .restore_from_latest_snapshot()
            .await
            .context("Restore failed");
        detach(&mut runtime.client).await?;
        restored
    }
    .await;
    runtime.stop().await?;

    match result? {
        Some(snapshot) => println!("{} {}", "✓ Restored snapshot".green(), snapshot),
        None => println!("{}", "Nothing to restore".yellow()),
    }
    Ok(())
}

async fn release(config: &EngineConfigManifest, args: VolumeArgs, best_effort: bool) -> Result<()> {
    let mut runtime = start(config, args).await?;
    let scheduler = LifecycleScheduler::new(config.spec.scheduler.clone());
    let mut options = scheduler.shutdown_options();
    if best_effort {
        options.release_policy = ReleasePolicy::BestEffort;
    }

    let result = async {
        open_serving(&mut runtime.client).await?;
        runtime
            .client
            .shutdown(&options)
            .await
            .context("Shutdown failed")
    }
    .await;
    runtime.stop().await?;

    let report = result?;
    print_shutdown_report(&report);
    if report.release_withheld {
        anyhow::bail!("Lease kept because the final backup failed; retry or pass --best-effort");
    }
    Ok(())
}

async fn status(config: &EngineConfigManifest, args: VolumeArgs) -> Result<()> {
    let volume_id = parse_volume_id(&args.volume_id)?;
    let dir = embedded::volume_dir(config, &volume_id, args.dir);
    let registry = embedded::registry(config)?;
    let record = registry
        .get_volume(&volume_id)
        .await
        .with_context(|| format!("Failed to fetch volume {}", volume_id))?;

    println!("{}", format!("Volume {}", volume_id).bold());
    println!("  Directory:    {}", dir.display());
    println!("  Declared:     {} bytes ({})", record.size_bytes, record.fs_type);
    match (&record.mount_id, record.lease_expires_at) {
        (Some(mount), Some(expires)) => println!("  Lease:        {} (expires {})", mount, expires),
        (Some(mount), None) => println!("  Lease:        {}", mount),
        _ => println!("  Lease:        {}", "(none)".dimmed()),
    }
    match &record.latest_snapshot_id {
        Some(snapshot) => println!("  Snapshot:     {}", snapshot),
        None => println!("  Snapshot:     {}", "(none)".dimmed()),
    }

    println!();
    match StateStore::new(&dir).load().await {
        Ok(local) => {
            println!("{}", "Local state:".bold());
            println!("  Image:        {}", local.image_id);
            match &local.mount_id {
                Some(mount) => println!("  Lease held:   {}", mount),
                None => println!("  Lease held:   {}", "(none)".dimmed()),
            }
            println!("  Restored:     {}", local.restore_done);
            println!("  Created:      {}", local.created_at);
        }
        Err(StateError::Missing(_)) => println!("Local state:  {}", "(none)".dimmed()),
        Err(e) => return Err(e).context("Failed to read local state"),
    }
    Ok(())
}

async fn force_release(config: &EngineConfigManifest, volume_id: &str) -> Result<()> {
    let volume_id = parse_volume_id(volume_id)?;
    let registry = embedded::registry(config)?;
    let record = registry
        .force_release_mount(&volume_id)
        .await
        .with_context(|| format!("Failed to force-release {}", volume_id))?;
    info!(volume_id = %volume_id, "Lease force-released");

    println!("{} {}", "✓ Lease cleared for".green(), record.id);
    Ok(())
}

async fn force_unlock(config: &EngineConfigManifest, volume_id: &str) -> Result<()> {
    let volume_id = parse_volume_id(volume_id)?;
    let registry = embedded::registry(config)?;
    registry
        .force_unlock(&volume_id)
        .await
        .with_context(|| format!("Failed to force-unlock {}", volume_id))?;
    info!(volume_id = %volume_id, "Backup repository unlocked");

    println!("{} {}", "✓ Repository locks removed for".green(), volume_id);
    Ok(())
}

fn print_shutdown_report(report: &ShutdownReport) {
    println!("{}", "Shutdown report:".bold());
    if let Some(at) = report.remounted_read_only_at {
        println!("  Remounted read-only: {}", at);
    }
    match (&report.final_backup, report.final_backup_at) {
        (Some(snapshot), Some(at)) => println!("  Final backup:        {} at {}", snapshot, at),
        (Some(snapshot), None) => println!("  Final backup:        {}", snapshot),
        _ if report.backup_attempts > 0 => println!(
            "  Final backup:        {} after {} attempts",
            "failed".red(),
            report.backup_attempts
        ),
        _ => println!("  Final backup:        {}", "not needed".dimmed()),
    }
    match report.released_at {
        Some(at) => println!("  Released:            {}", at),
        None if report.release_withheld => {
            println!("  Released:            {}", "withheld, lease kept".yellow())
        }
        None => println!("  Released:            {}", "no".red()),
    }
    if report.released_without_backup {
        println!("  {}", "Released without a final backup".yellow());
    }
    println!("  Directory removed:   {}", report.directory_removed);
    for e in &report.errors {
        println!("  {} {}", "⚠".yellow(), e);
    }
}
