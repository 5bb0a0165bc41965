// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Block Image Provider Trait
//!
//! A block image is a sparse backing file attached to a loop device, turned
//! into an LVM physical volume holding one volume group with a single data
//! logical volume and a filesystem on top. Loop devices and volume groups are
//! kernel-global: they outlive the process that created them, which is why
//! every image carries tags that let the orphan scanner find it again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::volume::{ImageId, ImageSpec, VolumeId};

/// Tag carried by every volume group this engine creates
pub const IMAGE_TAG: &str = "boxvol";

/// Prefix of the volume group name; the image id follows
pub const VG_PREFIX: &str = "boxvol-";

/// Name of the data logical volume inside each volume group
pub const DATA_LV: &str = "data";

/// Name of the copy-on-write snapshot LV used for consistent backups
pub const SNAPSHOT_LV: &str = "backup-view";

/// An attached image, owned by one engine instance
#[async_trait]
pub trait BlockImage: Send + Sync {
    fn image_id(&self) -> &ImageId;

    /// Device node of the data logical volume
    fn dev_path(&self) -> PathBuf;

    async fn mount(&self, dir: &Path, read_only: bool) -> Result<(), BlockError>;

    async fn unmount(&self, dir: &Path) -> Result<(), BlockError>;

    async fn remount_read_only(&self, dir: &Path) -> Result<(), BlockError>;

    /// Take a copy-on-write snapshot of the data LV and mount it read-only at
    /// `dir`. Removes a leftover snapshot from an interrupted run first.
    async fn mount_snapshot_view(&self, dir: &Path) -> Result<(), BlockError>;

    /// Unmount and drop the snapshot view. No-op when there is none.
    async fn drop_snapshot_view(&self, dir: &Path) -> Result<(), BlockError>;

    /// Deactivate the volume group and detach the loop device.
    ///
    /// Refuses while the data LV is mounted. Safe on a partially created or
    /// already inactive image.
    async fn deactivate(&self) -> Result<(), BlockError>;
}

/// Kernel-visible facts about an image, discovered from LVM tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub image_id: ImageId,
    pub volume_id: Option<VolumeId>,
    pub vg_name: String,
    /// Loop devices backing the volume group's physical volumes
    pub loop_devices: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Tagged images found on the host, plus listing entries that could not be
/// interpreted and were skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageListing {
    pub images: Vec<ImageInfo>,
    pub skipped: Vec<String>,
}

#[async_trait]
pub trait BlockImageProvider: Send + Sync {
    /// Allocate the backing file in `dir`, attach it and build a tagged VG,
    /// data LV and filesystem. Cleans up whatever it created on failure.
    async fn create(&self, dir: &Path, spec: &ImageSpec) -> Result<Arc<dyn BlockImage>, BlockError>;

    /// Re-attach an existing image without reformatting
    async fn open(&self, dir: &Path, image_id: &ImageId) -> Result<Arc<dyn BlockImage>, BlockError>;

    /// Every tagged image currently known to the kernel. A malformed entry
    /// is skipped and reported, never fatal to the whole listing.
    async fn list_images(&self) -> Result<ImageListing, BlockError>;

    /// Deactivate and detach an image found by `list_images`
    async fn reclaim(&self, image: &ImageInfo) -> Result<(), BlockError>;
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Backing image not found: {0}")]
    NotFound(String),

    #[error("Device {0} is still mounted")]
    Busy(String),

    #[error("Command `{command}` failed (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Unexpected tool output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
