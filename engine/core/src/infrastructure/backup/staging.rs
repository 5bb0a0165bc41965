// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Restore staging area
//!
//! A restore is written to `.boxvol-restore-<snapshot>` inside the target
//! mount and then renamed into place entry by entry. Both live on the same
//! filesystem, so promotion never copies data.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::backup::{BackupError, RestoreSummary};
use crate::domain::volume::SnapshotId;

pub const STAGING_PREFIX: &str = ".boxvol-restore-";

pub fn staging_dir(target: &Path, snapshot: &SnapshotId) -> PathBuf {
    target.join(format!("{}{}", STAGING_PREFIX, snapshot))
}

/// Fresh, empty staging directory; leftovers of an interrupted restore are
/// discarded
pub async fn prepare_staging(target: &Path, snapshot: &SnapshotId) -> Result<PathBuf, BackupError> {
    let staging = staging_dir(target, snapshot);
    match tokio::fs::remove_dir_all(&staging).await {
        Ok(()) => warn!(staging = %staging.display(), "Discarded stale restore staging area"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(&staging).await?;
    Ok(staging)
}

/// Move the staged entries into `target`. Entries already present in the
/// target are kept and counted as skipped.
pub async fn promote_staging(
    staging: &Path,
    target: &Path,
    delete_after: bool,
) -> Result<RestoreSummary, BackupError> {
    let mut summary = RestoreSummary::default();
    let mut entries = tokio::fs::read_dir(staging).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let dest = target.join(&name);
        if tokio::fs::symlink_metadata(&dest).await.is_ok() {
            debug!(entry = ?name, "Keeping existing entry");
            summary.entries_skipped += 1;
            continue;
        }
        tokio::fs::rename(entry.path(), &dest).await?;
        summary.entries_restored += 1;
    }

    if delete_after {
        tokio::fs::remove_dir_all(staging).await?;
        summary.staging_purged = true;
    }
    Ok(summary)
}

/// Whether a top-level entry name belongs to a staging area
pub fn is_staging_entry(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}
