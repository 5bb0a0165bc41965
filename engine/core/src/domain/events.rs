// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume lifecycle domain events
//!
//! Published on the in-process event bus by the mount-lease client and the
//! orphan scanner. Timestamps are taken when the step completed, so ordering
//! between events of one volume is meaningful (final backup before release).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::volume::{ImageId, MountId, SnapshotId, VolumeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeEvent {
    VolumeCreated {
        volume_id: VolumeId,
        image_id: ImageId,
        image_bytes: u64,
        filesystem_bytes: u64,
        created_at: DateTime<Utc>,
    },
    VolumeOpened {
        volume_id: VolumeId,
        image_id: ImageId,
        opened_at: DateTime<Utc>,
    },
    LeaseAcquired {
        volume_id: VolumeId,
        mount_id: MountId,
        acquired_at: DateTime<Utc>,
    },
    LeaseRefreshed {
        volume_id: VolumeId,
        mount_id: MountId,
        refreshed_at: DateTime<Utc>,
    },
    LeaseRejected {
        volume_id: VolumeId,
        mount_id: MountId,
        rejected_at: DateTime<Utc>,
    },
    SnapshotRestored {
        volume_id: VolumeId,
        snapshot_id: SnapshotId,
        restored_at: DateTime<Utc>,
    },
    BackupCompleted {
        volume_id: VolumeId,
        snapshot_id: SnapshotId,
        mount_id: Option<MountId>,
        read_only: bool,
        completed_at: DateTime<Utc>,
    },
    BackupFailed {
        volume_id: VolumeId,
        error: String,
        failed_at: DateTime<Utc>,
    },
    RemountedReadOnly {
        volume_id: VolumeId,
        remounted_at: DateTime<Utc>,
    },
    LeaseReleased {
        volume_id: VolumeId,
        mount_id: MountId,
        released_at: DateTime<Utc>,
    },
    ImageDeactivated {
        volume_id: VolumeId,
        image_id: ImageId,
        deactivated_at: DateTime<Utc>,
    },
    OrphanReclaimed {
        image_id: ImageId,
        volume_id: Option<VolumeId>,
        reclaimed_at: DateTime<Utc>,
    },
}

impl VolumeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VolumeCreated { .. } => "volume_created",
            Self::VolumeOpened { .. } => "volume_opened",
            Self::LeaseAcquired { .. } => "lease_acquired",
            Self::LeaseRefreshed { .. } => "lease_refreshed",
            Self::LeaseRejected { .. } => "lease_rejected",
            Self::SnapshotRestored { .. } => "snapshot_restored",
            Self::BackupCompleted { .. } => "backup_completed",
            Self::BackupFailed { .. } => "backup_failed",
            Self::RemountedReadOnly { .. } => "remounted_read_only",
            Self::LeaseReleased { .. } => "lease_released",
            Self::ImageDeactivated { .. } => "image_deactivated",
            Self::OrphanReclaimed { .. } => "orphan_reclaimed",
        }
    }

    /// Volume the event belongs to; orphans may have lost their volume tag
    pub fn volume_id(&self) -> Option<&VolumeId> {
        match self {
            Self::VolumeCreated { volume_id, .. }
            | Self::VolumeOpened { volume_id, .. }
            | Self::LeaseAcquired { volume_id, .. }
            | Self::LeaseRefreshed { volume_id, .. }
            | Self::LeaseRejected { volume_id, .. }
            | Self::SnapshotRestored { volume_id, .. }
            | Self::BackupCompleted { volume_id, .. }
            | Self::BackupFailed { volume_id, .. }
            | Self::RemountedReadOnly { volume_id, .. }
            | Self::LeaseReleased { volume_id, .. }
            | Self::ImageDeactivated { volume_id, .. } => Some(volume_id),
            Self::OrphanReclaimed { volume_id, .. } => volume_id.as_ref(),
        }
    }
}
