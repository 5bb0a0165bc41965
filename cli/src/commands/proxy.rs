// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Standalone object-store proxy
//!
//! Serves one volume's backup repository so restic can be pointed at it by
//! hand, e.g. `restic -r rest:http://127.0.0.1:8000/ snapshots`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use boxvol_core::domain::engine_config::EngineConfigManifest;
use boxvol_core::domain::volume::VolumeId;

use crate::embedded::{self, ProxyHandle};

#[derive(Args, Debug)]
pub struct ProxyCommand {
    /// Volume whose repository is served
    #[arg(value_name = "VOLUME_ID")]
    pub volume_id: String,

    /// Listen address (default: spec.backup.proxy_bind)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
}

pub async fn handle_command(command: ProxyCommand, config: &EngineConfigManifest) -> Result<()> {
    let volume_id = VolumeId::new(&command.volume_id)
        .with_context(|| format!("Invalid volume id '{}'", command.volume_id))?;
    let registry = embedded::registry(config)?;
    let bind = command
        .bind
        .unwrap_or_else(|| config.spec.backup.proxy_bind.clone());

    let proxy = ProxyHandle::bind(&bind, &registry, &volume_id).await?;
    println!(
        "{} rest:http://{}/ (Ctrl-C to stop)",
        "✓ Serving repository at".green(),
        proxy.addr
    );

    let stop = CancellationToken::new();
    let signal = embedded::cancel_on_signal(stop.clone());
    proxy.wait(stop).await?;
    let _ = signal.await;
    Ok(())
}
