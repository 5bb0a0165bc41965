// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Directory-backed block images
//!
//! Each image's "filesystem" is a directory under the provider root and a
//! mount is a symlink from the mount point to it, so the lease client and
//! the backup adapter can be exercised without root. Read-only mode is
//! tracked, not enforced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::image::{
    BlockError, BlockImage, BlockImageProvider, ImageInfo, ImageListing, VG_PREFIX,
};
use crate::domain::volume::{ImageId, ImageSpec, VolumeId};

#[derive(Debug, Default)]
struct ImageState {
    volume_id: Option<VolumeId>,
    created_at: Option<DateTime<Utc>>,
    active: bool,
    reclaimed: bool,
    /// mount point -> read-only
    mounts: HashMap<PathBuf, bool>,
}

#[derive(Clone)]
pub struct InMemoryBlockProvider {
    root: PathBuf,
    images: Arc<Mutex<HashMap<ImageId, Arc<Mutex<ImageState>>>>>,
}

impl InMemoryBlockProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            images: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn data_dir(&self, image_id: &ImageId) -> PathBuf {
        self.root.join(image_id.as_str()).join("fs")
    }

    fn handle(&self, image_id: &ImageId, state: Arc<Mutex<ImageState>>) -> Arc<dyn BlockImage> {
        Arc::new(InMemoryImage {
            image_id: image_id.clone(),
            data: self.data_dir(image_id),
            snapshot: self.root.join(image_id.as_str()).join("snapshot"),
            state,
        })
    }

    /// Register an active image without a volume directory, as a leftover
    /// from another process would appear
    pub fn register_image(
        &self,
        image_id: ImageId,
        volume_id: Option<VolumeId>,
        created_at: Option<DateTime<Utc>>,
    ) {
        let state = ImageState {
            volume_id,
            created_at,
            active: true,
            ..Default::default()
        };
        self.images.lock().insert(image_id, Arc::new(Mutex::new(state)));
    }

    pub fn is_active(&self, image_id: &ImageId) -> bool {
        self.images
            .lock()
            .get(image_id)
            .map(|s| s.lock().active)
            .unwrap_or(false)
    }

    pub fn was_reclaimed(&self, image_id: &ImageId) -> bool {
        self.images
            .lock()
            .get(image_id)
            .map(|s| s.lock().reclaimed)
            .unwrap_or(false)
    }

    /// Read-only flag of the mount at `dir`, `None` when nothing is mounted there
    pub fn mount_mode(&self, image_id: &ImageId, dir: &Path) -> Option<bool> {
        self.images
            .lock()
            .get(image_id)
            .and_then(|s| s.lock().mounts.get(dir).copied())
    }
}

#[async_trait]
impl BlockImageProvider for InMemoryBlockProvider {
    async fn create(&self, dir: &Path, spec: &ImageSpec) -> Result<Arc<dyn BlockImage>, BlockError> {
        tokio::fs::create_dir_all(dir).await?;
        let marker = dir.join(".image-id");
        if tokio::fs::try_exists(&marker).await? {
            return Err(BlockError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("image already exists in {}", dir.display()),
            )));
        }
        tokio::fs::create_dir_all(self.data_dir(&spec.image_id)).await?;
        tokio::fs::write(&marker, spec.image_id.as_str()).await?;

        let state = Arc::new(Mutex::new(ImageState {
            volume_id: Some(spec.volume_id.clone()),
            created_at: Some(Utc::now()),
            active: true,
            ..Default::default()
        }));
        self.images.lock().insert(spec.image_id.clone(), state.clone());
        Ok(self.handle(&spec.image_id, state))
    }

    async fn open(&self, dir: &Path, image_id: &ImageId) -> Result<Arc<dyn BlockImage>, BlockError> {
        if !tokio::fs::try_exists(dir.join(".image-id")).await? {
            return Err(BlockError::NotFound(dir.display().to_string()));
        }
        let state = self
            .images
            .lock()
            .get(image_id)
            .cloned()
            .ok_or_else(|| BlockError::NotFound(image_id.to_string()))?;
        state.lock().active = true;
        Ok(self.handle(image_id, state))
    }

    async fn list_images(&self) -> Result<ImageListing, BlockError> {
        let mut images: Vec<ImageInfo> = self
            .images
            .lock()
            .iter()
            .filter_map(|(id, state)| {
                let state = state.lock();
                state.active.then(|| ImageInfo {
                    image_id: id.clone(),
                    volume_id: state.volume_id.clone(),
                    vg_name: format!("{}{}", VG_PREFIX, id),
                    loop_devices: Vec::new(),
                    created_at: state.created_at,
                })
            })
            .collect();
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(ImageListing {
            images,
            skipped: Vec::new(),
        })
    }

    async fn reclaim(&self, image: &ImageInfo) -> Result<(), BlockError> {
        let images = self.images.lock();
        let state = images
            .get(&image.image_id)
            .ok_or_else(|| BlockError::NotFound(image.image_id.to_string()))?;
        let mut state = state.lock();
        state.active = false;
        state.reclaimed = true;
        Ok(())
    }
}

struct InMemoryImage {
    image_id: ImageId,
    data: PathBuf,
    snapshot: PathBuf,
    state: Arc<Mutex<ImageState>>,
}

impl InMemoryImage {
    async fn link(&self, target: &Path, dir: &Path) -> Result<(), BlockError> {
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::symlink_metadata(dir).await {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(()),
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(dir).await?,
            Ok(_) => {
                return Err(BlockError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} is not a directory", dir.display()),
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::symlink(target, dir).await?;
        Ok(())
    }

    async fn unlink(dir: &Path) -> Result<bool, BlockError> {
        match tokio::fs::symlink_metadata(dir).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                tokio::fs::remove_file(dir).await?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlockImage for InMemoryImage {
    fn image_id(&self) -> &ImageId {
        &self.image_id
    }

    fn dev_path(&self) -> PathBuf {
        self.data.clone()
    }

    async fn mount(&self, dir: &Path, read_only: bool) -> Result<(), BlockError> {
        if !self.state.lock().active {
            return Err(BlockError::NotFound(format!("{} is not active", self.image_id)));
        }
        self.link(&self.data, dir).await?;
        self.state.lock().mounts.insert(dir.to_path_buf(), read_only);
        Ok(())
    }

    async fn unmount(&self, dir: &Path) -> Result<(), BlockError> {
        Self::unlink(dir).await?;
        self.state.lock().mounts.remove(dir);
        Ok(())
    }

    async fn remount_read_only(&self, dir: &Path) -> Result<(), BlockError> {
        let mut state = self.state.lock();
        match state.mounts.get_mut(dir) {
            Some(ro) => {
                *ro = true;
                Ok(())
            }
            None => Err(BlockError::NotFound(format!("nothing mounted at {}", dir.display()))),
        }
    }

    async fn mount_snapshot_view(&self, dir: &Path) -> Result<(), BlockError> {
        self.drop_snapshot_view(dir).await?;
        let (data, snapshot) = (self.data.clone(), self.snapshot.clone());
        tokio::task::spawn_blocking(move || copy_tree(&data, &snapshot))
            .await
            .map_err(|e| BlockError::Io(std::io::Error::other(e)))??;
        self.link(&self.snapshot, dir).await?;
        self.state.lock().mounts.insert(dir.to_path_buf(), true);
        Ok(())
    }

    async fn drop_snapshot_view(&self, dir: &Path) -> Result<(), BlockError> {
        self.unmount(dir).await?;
        match tokio::fs::remove_dir_all(&self.snapshot).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivate(&self) -> Result<(), BlockError> {
        let mut state = self.state.lock();
        if let Some(dir) = state.mounts.keys().next() {
            return Err(BlockError::Busy(dir.display().to_string()));
        }
        state.active = false;
        Ok(())
    }
}

/// Recursively copy `src` into `dst`, which must not exist yet
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
