// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Orphan scan command

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use tracing::info;

use boxvol_core::application::{OrphanScanner, ScanReport};
use boxvol_core::domain::engine_config::EngineConfigManifest;
use boxvol_core::infrastructure::block::{create_block_provider, BlockBackend};
use boxvol_core::infrastructure::command::SystemCommandRunner;
use boxvol_core::infrastructure::event_bus::EventBus;

use crate::embedded;

#[derive(Args, Debug)]
pub struct ScanCommand {
    /// Keep scanning on the configured interval until stopped
    #[arg(long)]
    pub watch: bool,
}

pub async fn handle_command(command: ScanCommand, config: &EngineConfigManifest) -> Result<()> {
    let provider = create_block_provider(
        BlockBackend::Lvm {
            proc_root: config.spec.scanner.proc_root.clone(),
        },
        Arc::new(SystemCommandRunner),
    );
    let events = EventBus::with_default_capacity();
    let logger = embedded::spawn_event_logger(&events);
    let scanner = Arc::new(OrphanScanner::new(
        provider,
        events,
        config.spec.scanner.clone(),
    ));

    if command.watch {
        let token = scanner.shutdown_token();
        let signal = embedded::cancel_on_signal(token);
        scanner.start().await.context("Orphan scanner task panicked")?;
        let _ = signal.await;
        info!("Orphan scanner stopped");
        logger.abort();
        return Ok(());
    }

    let report = scanner.scan().await.context("Orphan scan failed")?;
    drop(scanner);
    let _ = logger.await;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ScanReport) {
    println!("{}", "Orphan scan:".bold());
    println!("  Namespaces visited: {}", report.namespaces_visited);
    println!("  Images in use:      {}", report.in_use.len());
    println!("  Orphaned:           {}", report.orphaned.len());
    for image in &report.reclaimed {
        println!("  {} reclaimed {}", "✓".green(), image);
    }
    for image in &report.too_young {
        println!("  {} {} is within the grace period", "·".dimmed(), image);
    }
    for failure in &report.failures {
        println!("  {} {}", "⚠".yellow(), failure);
    }
}
