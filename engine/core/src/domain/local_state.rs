// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local volume state persisted next to the block image
//!
//! One descriptor per volume directory. The directory is owned by exactly one
//! engine instance, so the file has a single writer by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::volume::{ImageId, MountId, SnapshotId, VolumeId};

/// Who this engine is when talking to the remote API
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub api_url: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_id: Option<String>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("box_id", &self.box_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVolumeState {
    pub identity: ClientIdentity,
    pub volume_id: VolumeId,
    pub volume_uuid: Uuid,
    pub image_id: ImageId,
    /// Lease currently held, if any
    #[serde(default)]
    pub mount_id: Option<MountId>,
    #[serde(default)]
    pub restore_done: bool,
    #[serde(default)]
    pub restored_snapshot_id: Option<SnapshotId>,
    pub created_at: DateTime<Utc>,
}

impl LocalVolumeState {
    pub fn new(
        identity: ClientIdentity,
        volume_id: VolumeId,
        volume_uuid: Uuid,
        image_id: ImageId,
        mount_id: MountId,
    ) -> Self {
        Self {
            identity,
            volume_id,
            volume_uuid,
            image_id,
            mount_id: Some(mount_id),
            restore_done: false,
            restored_snapshot_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Volume state already exists at {0}")]
    AlreadyExists(String),

    #[error("No volume state at {0}")]
    Missing(String),

    #[error("Corrupt volume state at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
