// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! YAML persistence for [`LocalVolumeState`]
//!
//! Writes go to a temporary sibling and are renamed into place, so a crash
//! leaves either the old or the new descriptor, never a torn one. `create`
//! links instead of renaming, which fails when a descriptor already exists.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::local_state::{LocalVolumeState, StateError};

pub const STATE_FILE_NAME: &str = "boxvol-state.yaml";

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(volume_dir: &Path) -> Self {
        Self {
            path: volume_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool, StateError> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    /// Persist the first descriptor; refuses to overwrite an existing one
    pub async fn create(&self, state: &LocalVolumeState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.write_temp(state).await?;
        let linked = tokio::fs::hard_link(&tmp, &self.path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(path = %self.path.display(), "Created volume state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StateError::AlreadyExists(self.path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self) -> Result<LocalVolumeState, StateError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::Missing(self.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&content).map_err(|e| StateError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Replace the descriptor; it must already exist
    pub async fn save(&self, state: &LocalVolumeState) -> Result<(), StateError> {
        if !self.exists().await? {
            return Err(StateError::Missing(self.path.display().to_string()));
        }
        let tmp = self.write_temp(state).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), StateError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_temp(&self, state: &LocalVolumeState) -> Result<PathBuf, StateError> {
        let yaml = serde_yaml::to_string(state).map_err(|e| StateError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension(format!("yaml.tmp-{}", std::process::id()));
        tokio::fs::write(&tmp, yaml).await?;
        let file = tokio::fs::File::open(&tmp).await?;
        file.sync_all().await?;
        Ok(tmp)
    }
}
