// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backup Tool Trait
//!
//! The backup tool is an opaque content-addressed object store with a
//! snapshot / restore / forget API. Uploads are append-only: a failed
//! snapshot never touches previously stored snapshots, so a failure is always
//! retryable and never means data is gone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::volume::{MountId, SnapshotId, VolumeId};

/// What a backup tool needs to reach one volume's repository
#[derive(Clone)]
pub struct RepositoryAccess {
    pub volume_id: VolumeId,
    pub password: String,
}

impl std::fmt::Debug for RepositoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryAccess")
            .field("volume_id", &self.volume_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Provenance tags attached to every snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTags {
    pub volume_id: VolumeId,
    pub mount_id: Option<MountId>,
}

impl SnapshotTags {
    pub fn to_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("volume={}", self.volume_id)];
        if let Some(mount) = &self.mount_id {
            tags.push(format!("mount={}", mount));
        }
        tags
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Top-level entries moved from staging into the target
    pub entries_restored: usize,
    /// Entries left in staging because the target already had that name
    pub entries_skipped: usize,
    pub staging_purged: bool,
}

#[async_trait]
pub trait BackupTool: Send + Sync {
    /// Snapshot `source` and return the new snapshot's id
    async fn snapshot(
        &self,
        repo: &RepositoryAccess,
        source: &Path,
        tags: &SnapshotTags,
    ) -> Result<SnapshotId, BackupError>;

    /// Restore `snapshot` into `target` through a staging directory inside
    /// `target`; with `delete_after` the staging directory is removed once
    /// its content has been moved into place.
    async fn restore(
        &self,
        repo: &RepositoryAccess,
        snapshot: &SnapshotId,
        target: &Path,
        delete_after: bool,
    ) -> Result<RestoreSummary, BackupError>;

    async fn forget(&self, repo: &RepositoryAccess, snapshot: &SnapshotId)
        -> Result<(), BackupError>;

    async fn list_snapshots(&self, repo: &RepositoryAccess)
        -> Result<Vec<SnapshotInfo>, BackupError>;

    /// Remove stale repository locks
    async fn unlock(&self, repo: &RepositoryAccess) -> Result<(), BackupError>;
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("Backup tool failed (exit {code}): {stderr}")]
    ToolFailed { code: i32, stderr: String },

    #[error("Unexpected backup tool output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_include_mount_when_present() {
        let tags = SnapshotTags {
            volume_id: VolumeId::new("v1").unwrap(),
            mount_id: Some(MountId("m-7".to_string())),
        };
        assert_eq!(tags.to_tags(), vec!["volume=v1", "mount=m-7"]);

        let no_mount = SnapshotTags { mount_id: None, ..tags };
        assert_eq!(no_mount.to_tags(), vec!["volume=v1"]);
    }

    #[test]
    fn test_repository_access_debug_redacts_password() {
        let access = RepositoryAccess {
            volume_id: VolumeId::new("v1").unwrap(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", access);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }
}
