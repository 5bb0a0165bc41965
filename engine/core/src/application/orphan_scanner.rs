// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Orphan Scanner - reclaims block images no live mount namespace refers to
//!
//! One sweep reads kernel state, computes the set of referenced images,
//! diffs it against every tagged image and deactivates the rest:
//!
//! 1. walk `/proc`, visiting each mount namespace once
//! 2. in each namespace, read the reference marker of every tmpfs mount
//!    through `/proc/<pid>/root`
//! 3. reclaim listed images that no marker names and that are older than
//!    the grace period
//!
//! A marker lives in a tmpfs mounted inside the owner's private namespace,
//! so it disappears with the namespace. No unregistration is needed.

use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::engine_config::ScannerConfig;
use crate::domain::events::VolumeEvent;
use crate::domain::image::{BlockError, BlockImageProvider};
use crate::domain::volume::ImageId;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::markers::{read_marker, MARKER_FILE};
use crate::infrastructure::procfs::ProcFs;
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub namespaces_visited: usize,
    pub in_use: BTreeSet<ImageId>,
    pub orphaned: Vec<ImageId>,
    pub reclaimed: Vec<ImageId>,
    /// Unreferenced but inside the grace period
    pub too_young: Vec<ImageId>,
    /// Entries skipped or images that could not be reclaimed
    pub failures: Vec<String>,
}

#[derive(Debug, Default)]
struct InUse {
    namespaces_visited: usize,
    images: BTreeSet<ImageId>,
    failures: Vec<String>,
}

/// Collect the images referenced from every live mount namespace. Processes
/// that exit mid-walk are skipped silently; other per-process read errors
/// are recorded and skipped.
fn collect_in_use(procfs: &ProcFs) -> std::io::Result<InUse> {
    let mut result = InUse::default();
    let mut visited = HashSet::new();

    for pid in procfs.list_pids()? {
        let namespace = match procfs.mount_namespace(&pid) {
            Ok(Some(ns)) => ns,
            Ok(None) => continue,
            Err(e) => {
                result.failures.push(format!("pid {}: namespace: {}", pid, e));
                continue;
            }
        };
        if visited.contains(&namespace) {
            continue;
        }

        let mounts = match procfs.mountinfo(&pid) {
            Ok(Some(mounts)) => mounts,
            Ok(None) => continue,
            Err(e) => {
                // another process in the same namespace may still be readable
                result.failures.push(format!("pid {}: mountinfo: {}", pid, e));
                continue;
            }
        };
        visited.insert(namespace);

        for mount in mounts.iter().filter(|m| m.fs_type == "tmpfs") {
            let dir = procfs.path_in_root(&pid, &mount.mount_point);
            match read_marker(&dir) {
                Some(image) => {
                    debug!(pid = %pid, image_id = %image, "Image referenced");
                    result.images.insert(image);
                }
                None if dir.join(MARKER_FILE).is_file() => {
                    warn!(
                        pid = %pid,
                        mount_point = %mount.mount_point.display(),
                        "Unreadable reference marker"
                    );
                    result.failures.push(format!(
                        "pid {}: unreadable marker under {}",
                        pid,
                        mount.mount_point.display()
                    ));
                }
                None => {}
            }
        }
    }

    result.namespaces_visited = visited.len();
    Ok(result)
}

pub struct OrphanScanner {
    provider: Arc<dyn BlockImageProvider>,
    procfs: ProcFs,
    events: EventBus,
    config: ScannerConfig,
    shutdown_token: CancellationToken,
}

impl OrphanScanner {
    pub fn new(provider: Arc<dyn BlockImageProvider>, events: EventBus, config: ScannerConfig) -> Self {
        Self {
            provider,
            procfs: ProcFs::new(config.proc_root.clone()),
            events,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// One reconciliation pass. Safe to repeat: reclaimed images are no
    /// longer listed on the next pass.
    pub async fn scan(&self) -> Result<ScanReport, BlockError> {
        let procfs = self.procfs.clone();
        let in_use = tokio::task::spawn_blocking(move || collect_in_use(&procfs))
            .await
            .map_err(|e| BlockError::Io(std::io::Error::other(e)))??;

        let mut report = ScanReport {
            namespaces_visited: in_use.namespaces_visited,
            in_use: in_use.images,
            failures: in_use.failures,
            ..Default::default()
        };

        let now = Utc::now();
        let min_age = chrono::Duration::from_std(self.config.min_age)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let listing = self.provider.list_images().await?;
        report.failures.extend(listing.skipped);

        for image in listing.images {
            if report.in_use.contains(&image.image_id) {
                continue;
            }
            // unknown age counts as old enough
            if image.created_at.is_some_and(|created| now - created < min_age) {
                debug!(image_id = %image.image_id, "Unreferenced image inside grace period");
                report.too_young.push(image.image_id);
                continue;
            }

            report.orphaned.push(image.image_id.clone());
            match self.provider.reclaim(&image).await {
                Ok(()) => {
                    info!(
                        image_id = %image.image_id,
                        volume_id = ?image.volume_id,
                        vg_name = %image.vg_name,
                        "Reclaimed orphaned image"
                    );
                    self.events.publish(VolumeEvent::OrphanReclaimed {
                        image_id: image.image_id.clone(),
                        volume_id: image.volume_id.clone(),
                        reclaimed_at: Utc::now(),
                    });
                    report.reclaimed.push(image.image_id);
                }
                Err(e) => {
                    warn!(image_id = %image.image_id, error = %e, "Failed to reclaim orphaned image");
                    report.failures.push(format!("reclaim {}: {}", image.image_id, e));
                }
            }
        }

        telemetry::record_orphans_reclaimed(report.reclaimed.len());
        Ok(report)
    }

    /// Start periodic scanning in the background
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval = ?self.config.interval,
            min_age = ?self.config.min_age,
            proc_root = %self.procfs.root().display(),
            "Starting orphan scanner background task"
        );

        let mut tick = interval(self.config.interval.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.scan().await {
                        Ok(report) => info!(
                            namespaces = report.namespaces_visited,
                            in_use = report.in_use.len(),
                            reclaimed = report.reclaimed.len(),
                            failures = report.failures.len(),
                            "Orphan scan completed"
                        ),
                        Err(e) => warn!("Orphan scan failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping orphan scanner");
                    break;
                }
            }
        }

        info!("Orphan scanner background task stopped");
    }
}
