// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume Registry - Anti-Corruption Layer for the remote lease service
//!
//! The registry is authoritative for volumes and grants time-bounded,
//! exclusive leases ("mounts"). The engine consumes it over the network and
//! never decides lease ownership itself.
//!
//! # Lease semantics the engine relies on
//!
//! - At most one live mount id per volume. A second `mount` while a lease is
//!   live yields [`RegistryError::Conflict`], never a second lease.
//! - A mount id that expired without refresh may be reassigned. The registry
//!   then answers [`RegistryError::UnknownLease`], which means "your previous
//!   lease is gone", not "the volume is unavailable".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::volume::{MountId, SnapshotId, VolumeId, VolumeRecord};

/// Result of a successful `mount` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountGrant {
    pub mount_id: MountId,
    pub volume: VolumeRecord,
}

/// Snapshot metadata as tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    #[serde(default)]
    pub mount_id: Option<MountId>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VolumeRegistry: Send + Sync {
    /// Request a new lease on `volume`, optionally on behalf of a box
    async fn mount(&self, volume: &VolumeId, box_id: Option<&str>)
        -> Result<MountGrant, RegistryError>;

    /// Extend a held lease
    async fn refresh_mount(&self, mount: &MountId) -> Result<VolumeRecord, RegistryError>;

    /// Give the lease back; the volume becomes available to the next claimant
    async fn release_mount(&self, mount: &MountId) -> Result<VolumeRecord, RegistryError>;

    /// Record a completed backup as the volume's latest snapshot
    async fn record_snapshot(
        &self,
        mount: &MountId,
        snapshot: &SnapshotId,
    ) -> Result<VolumeRecord, RegistryError>;

    /// Drop whatever lease is held on `volume` (operator recovery)
    async fn force_release_mount(&self, volume: &VolumeId) -> Result<VolumeRecord, RegistryError>;

    /// Clear stale backup repository locks left by a dead node
    async fn force_unlock(&self, volume: &VolumeId) -> Result<(), RegistryError>;

    async fn get_snapshot(
        &self,
        volume: &VolumeId,
        snapshot: &SnapshotId,
    ) -> Result<SnapshotRecord, RegistryError>;

    async fn get_volume(&self, volume: &VolumeId) -> Result<VolumeRecord, RegistryError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another holder's lease is live
    #[error("Volume {volume} is in use by mount {holder} (lease expires {expires_at:?})")]
    Conflict {
        volume: VolumeId,
        holder: String,
        expires_at: Option<DateTime<Utc>>,
    },

    /// The lease id is unknown to the registry (expired and possibly reassigned)
    #[error("Lease {0} is unknown to the registry")]
    UnknownLease(MountId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Registry transport error: {0}")]
    Transport(String),

    #[error("Unexpected registry response: {0}")]
    Protocol(String),
}

impl RegistryError {
    /// Errors worth retrying on the next scheduler tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RegistryError::Protocol(err.to_string())
        } else {
            RegistryError::Transport(err.to_string())
        }
    }
}
