// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory [`BackupTool`] keeping each snapshot as a file tree

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::backup::{
    BackupError, BackupTool, RepositoryAccess, RestoreSummary, SnapshotInfo, SnapshotTags,
};
use crate::domain::volume::{SnapshotId, VolumeId};
use crate::infrastructure::backup::staging::{is_staging_entry, prepare_staging, promote_staging};

#[derive(Debug, Clone)]
struct StoredSnapshot {
    volume_id: VolumeId,
    info: SnapshotInfo,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct InMemoryBackupTool {
    snapshots: Arc<Mutex<Vec<StoredSnapshot>>>,
    failures_pending: Arc<AtomicU32>,
    restores: Arc<AtomicUsize>,
    snapshot_delay: Arc<Mutex<Option<Duration>>>,
    snapshots_started: Arc<AtomicUsize>,
}

impl InMemoryBackupTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` snapshot calls fail
    pub fn fail_next_snapshots(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Make every snapshot call take `delay` before reading the source
    pub fn delay_snapshots(&self, delay: Duration) {
        *self.snapshot_delay.lock() = Some(delay);
    }

    /// Snapshot calls entered, including those still in flight or failed
    pub fn snapshots_started(&self) -> usize {
        self.snapshots_started.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn snapshot_infos(&self) -> Vec<SnapshotInfo> {
        self.snapshots.lock().iter().map(|s| s.info.clone()).collect()
    }

    /// Content of `path` inside a stored snapshot
    pub fn file(&self, snapshot: &SnapshotId, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .iter()
            .find(|s| &s.info.id == snapshot)
            .and_then(|s| s.files.get(path.as_ref()).cloned())
    }
}

fn read_tree(root: &Path) -> std::io::Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1 && e.file_name().to_str().is_some_and(is_staging_entry))
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(std::io::Error::other)?
                .to_path_buf();
            files.insert(relative, std::fs::read(entry.path())?);
        }
    }
    Ok(files)
}

#[async_trait]
impl BackupTool for InMemoryBackupTool {
    async fn snapshot(
        &self,
        repo: &RepositoryAccess,
        source: &Path,
        tags: &SnapshotTags,
    ) -> Result<SnapshotId, BackupError> {
        self.snapshots_started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.snapshot_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let pending = self.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_pending.store(pending - 1, Ordering::SeqCst);
            return Err(BackupError::ToolFailed {
                code: 1,
                stderr: "injected failure".to_string(),
            });
        }

        let root = source.to_path_buf();
        let files = tokio::task::spawn_blocking(move || read_tree(&root))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        let id = SnapshotId(Uuid::new_v4().simple().to_string());
        self.snapshots.lock().push(StoredSnapshot {
            volume_id: repo.volume_id.clone(),
            info: SnapshotInfo {
                id: id.clone(),
                time: Utc::now(),
                paths: vec![source.to_path_buf()],
                tags: tags.to_tags(),
            },
            files,
        });
        Ok(id)
    }

    async fn restore(
        &self,
        repo: &RepositoryAccess,
        snapshot: &SnapshotId,
        target: &Path,
        delete_after: bool,
    ) -> Result<RestoreSummary, BackupError> {
        let files = self
            .snapshots
            .lock()
            .iter()
            .find(|s| &s.info.id == snapshot && s.volume_id == repo.volume_id)
            .map(|s| s.files.clone())
            .ok_or_else(|| BackupError::SnapshotNotFound(snapshot.clone()))?;

        let staging = prepare_staging(target, snapshot).await?;
        for (relative, content) in files {
            let path = staging.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await?;
        }
        let summary = promote_staging(&staging, target, delete_after).await?;
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(summary)
    }

    async fn forget(&self, repo: &RepositoryAccess, snapshot: &SnapshotId) -> Result<(), BackupError> {
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|s| !(&s.info.id == snapshot && s.volume_id == repo.volume_id));
        if snapshots.len() == before {
            return Err(BackupError::SnapshotNotFound(snapshot.clone()));
        }
        Ok(())
    }

    async fn list_snapshots(&self, repo: &RepositoryAccess) -> Result<Vec<SnapshotInfo>, BackupError> {
        Ok(self
            .snapshots
            .lock()
            .iter()
            .filter(|s| s.volume_id == repo.volume_id)
            .map(|s| s.info.clone())
            .collect())
    }

    async fn unlock(&self, _repo: &RepositoryAccess) -> Result<(), BackupError> {
        Ok(())
    }
}
