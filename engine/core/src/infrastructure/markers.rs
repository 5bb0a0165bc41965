// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reference markers
//!
//! A live block image is claimed by a small tmpfs mounted at
//! `<volume dir>/ref` holding `.boxvol-image`. The tmpfs only exists inside
//! the owning mount namespace, so the orphan scanner can tell from
//! `/proc/<pid>/root/...` whether any living namespace still claims an image.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::image::BlockError;
use crate::domain::volume::ImageId;
use crate::infrastructure::command::{CommandRunner, CommandSpec};

pub const MARKER_DIR: &str = "ref";
pub const MARKER_FILE: &str = ".boxvol-image";
const TMPFS_OPTIONS: &str = "size=64k,mode=0700";

pub fn marker_dir(volume_dir: &Path) -> PathBuf {
    volume_dir.join(MARKER_DIR)
}

#[async_trait]
pub trait ReferenceMarker: Send + Sync {
    /// Claim `image` from the current mount namespace
    async fn place(&self, volume_dir: &Path, image: &ImageId) -> Result<(), BlockError>;

    /// Drop the claim; succeeds when nothing is placed
    async fn remove(&self, volume_dir: &Path) -> Result<(), BlockError>;
}

/// Marker on a dedicated tmpfs mount
pub struct TmpfsMarker {
    runner: Arc<dyn CommandRunner>,
}

impl TmpfsMarker {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn is_mounted(&self, dir: &Path) -> Result<bool, BlockError> {
        let out = self
            .runner
            .run(&CommandSpec::new("mountpoint").arg("-q").arg(dir.display().to_string()))
            .await?;
        Ok(out.success())
    }
}

#[async_trait]
impl ReferenceMarker for TmpfsMarker {
    async fn place(&self, volume_dir: &Path, image: &ImageId) -> Result<(), BlockError> {
        let dir = marker_dir(volume_dir);
        tokio::fs::create_dir_all(&dir).await?;

        if !self.is_mounted(&dir).await? {
            let spec = CommandSpec::new("mount")
                .args(["-t", "tmpfs", "-o", TMPFS_OPTIONS, "boxvol-ref"])
                .arg(dir.display().to_string());
            let out = self.runner.run(&spec).await?;
            if !out.success() {
                return Err(BlockError::CommandFailed {
                    command: spec.display(),
                    code: out.code,
                    stderr: out.stderr,
                });
            }
        }

        tokio::fs::write(dir.join(MARKER_FILE), format!("{}\n", image)).await?;
        debug!(image_id = %image, dir = %dir.display(), "Placed reference marker");
        Ok(())
    }

    async fn remove(&self, volume_dir: &Path) -> Result<(), BlockError> {
        let dir = marker_dir(volume_dir);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(());
        }
        if self.is_mounted(&dir).await? {
            let spec = CommandSpec::new("umount").arg(dir.display().to_string());
            let out = self.runner.run(&spec).await?;
            if !out.success() {
                return Err(BlockError::CommandFailed {
                    command: spec.display(),
                    code: out.code,
                    stderr: out.stderr,
                });
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to remove marker directory");
        }
        Ok(())
    }
}

/// Marker as a plain directory, for hosts without mount privileges
#[derive(Debug, Clone, Default)]
pub struct DirectoryMarker;

#[async_trait]
impl ReferenceMarker for DirectoryMarker {
    async fn place(&self, volume_dir: &Path, image: &ImageId) -> Result<(), BlockError> {
        let dir = marker_dir(volume_dir);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(MARKER_FILE), format!("{}\n", image)).await?;
        Ok(())
    }

    async fn remove(&self, volume_dir: &Path) -> Result<(), BlockError> {
        match tokio::fs::remove_dir_all(marker_dir(volume_dir)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Image id named by the marker in `dir`, if one is there
pub fn read_marker(dir: &Path) -> Option<ImageId> {
    let content = std::fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
    ImageId::parse(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::VolumeId;
    use crate::infrastructure::command::{CommandOutput, ScriptedCommandRunner};

    #[tokio::test]
    async fn test_tmpfs_marker_mounts_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond("mountpoint", CommandOutput::failed(32, ""));
        let marker = TmpfsMarker::new(Arc::new(runner.clone()));
        let image = ImageId::generate(&VolumeId::new("v1").unwrap());

        marker.place(dir.path(), &image).await.unwrap();

        let lines = runner.command_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("mount -t tmpfs -o size=64k,mode=0700 boxvol-ref"));
        assert_eq!(read_marker(&marker_dir(dir.path())), Some(image));
    }

    #[tokio::test]
    async fn test_directory_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = ImageId::generate(&VolumeId::new("v1").unwrap());
        DirectoryMarker.place(dir.path(), &image).await.unwrap();
        assert_eq!(read_marker(&marker_dir(dir.path())), Some(image));

        DirectoryMarker.remove(dir.path()).await.unwrap();
        DirectoryMarker.remove(dir.path()).await.unwrap();
        assert_eq!(read_marker(&marker_dir(dir.path())), None);
    }
}
