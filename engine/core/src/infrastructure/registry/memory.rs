// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory volume registry
//!
//! Grants leases with the same single-writer rules as the remote API: a
//! volume holds at most one unexpired lease, an expired lease id is unknown
//! from then on, and a new mount after expiry gets a fresh id. The clock can
//! be advanced to exercise expiry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::registry::{MountGrant, RegistryError, SnapshotRecord, VolumeRegistry};
use crate::domain::volume::{MountId, SnapshotId, VolumeId, VolumeRecord};

pub const DEFAULT_LEASE_TTL_SECS: i64 = 60;

#[derive(Default)]
struct Inner {
    volumes: HashMap<VolumeId, VolumeRecord>,
    snapshots: HashMap<(VolumeId, SnapshotId), SnapshotRecord>,
    unlocks: HashMap<VolumeId, usize>,
    clock_offset: Duration,
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    /// Volume whose live lease is `mount`
    fn leased_volume(&mut self, mount: &MountId) -> Result<&mut VolumeRecord, RegistryError> {
        let now = self.now();
        self.volumes
            .values_mut()
            .find(|v| v.mount_id.as_ref() == Some(mount) && v.is_leased_at(now))
            .ok_or_else(|| RegistryError::UnknownLease(mount.clone()))
    }
}

#[derive(Clone)]
pub struct InMemoryVolumeRegistry {
    inner: Arc<Mutex<Inner>>,
    lease_ttl: Duration,
}

impl Default for InMemoryVolumeRegistry {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LEASE_TTL_SECS))
    }
}

impl InMemoryVolumeRegistry {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            lease_ttl,
        }
    }

    pub fn insert_volume(&self, record: VolumeRecord) {
        self.inner.lock().volumes.insert(record.id.clone(), record);
    }

    pub fn volume(&self, id: &VolumeId) -> Option<VolumeRecord> {
        self.inner.lock().volumes.get(id).cloned()
    }

    /// Move the registry clock forward
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.clock_offset += by;
    }

    pub fn unlock_count(&self, id: &VolumeId) -> usize {
        self.inner.lock().unlocks.get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl VolumeRegistry for InMemoryVolumeRegistry {
    async fn mount(
        &self,
        volume: &VolumeId,
        _box_id: Option<&str>,
    ) -> Result<MountGrant, RegistryError> {
        let mut inner = self.inner.lock();
        let now = inner.now();
        let record = inner
            .volumes
            .get_mut(volume)
            .ok_or_else(|| RegistryError::NotFound(format!("volume {}", volume)))?;

        if record.is_leased_at(now) {
            return Err(RegistryError::Conflict {
                volume: volume.clone(),
                holder: record
                    .mount_id
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_default(),
                expires_at: record.lease_expires_at,
            });
        }

        let mount_id = MountId(format!("m-{}", &Uuid::new_v4().simple().to_string()[..12]));
        record.mount_id = Some(mount_id.clone());
        record.lease_expires_at = Some(now + self.lease_ttl);
        Ok(MountGrant {
            mount_id,
            volume: record.clone(),
        })
    }

    async fn refresh_mount(&self, mount: &MountId) -> Result<VolumeRecord, RegistryError> {
        let mut inner = self.inner.lock();
        let expires = inner.now() + self.lease_ttl;
        let record = inner.leased_volume(mount)?;
        record.lease_expires_at = Some(expires);
        Ok(record.clone())
    }

    async fn release_mount(&self, mount: &MountId) -> Result<VolumeRecord, RegistryError> {
        let mut inner = self.inner.lock();
        let record = inner.leased_volume(mount)?;
        record.mount_id = None;
        record.lease_expires_at = None;
        Ok(record.clone())
    }

    async fn record_snapshot(
        &self,
        mount: &MountId,
        snapshot: &SnapshotId,
    ) -> Result<VolumeRecord, RegistryError> {
        let mut inner = self.inner.lock();
        let now = inner.now();
        let record = inner.leased_volume(mount)?;
        record.latest_snapshot_id = Some(snapshot.clone());
        let updated = record.clone();
        inner.snapshots.insert(
            (updated.id.clone(), snapshot.clone()),
            SnapshotRecord {
                id: snapshot.clone(),
                volume_id: updated.id.clone(),
                mount_id: Some(mount.clone()),
                created_at: now,
            },
        );
        Ok(updated)
    }

    async fn force_release_mount(&self, volume: &VolumeId) -> Result<VolumeRecord, RegistryError> {
        let mut inner = self.inner.lock();
        let record = inner
            .volumes
            .get_mut(volume)
            .ok_or_else(|| RegistryError::NotFound(format!("volume {}", volume)))?;
        record.mount_id = None;
        record.lease_expires_at = None;
        Ok(record.clone())
    }

    async fn force_unlock(&self, volume: &VolumeId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if !inner.volumes.contains_key(volume) {
            return Err(RegistryError::NotFound(format!("volume {}", volume)));
        }
        *inner.unlocks.entry(volume.clone()).or_default() += 1;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        volume: &VolumeId,
        snapshot: &SnapshotId,
    ) -> Result<SnapshotRecord, RegistryError> {
        self.inner
            .lock()
            .snapshots
            .get(&(volume.clone(), snapshot.clone()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("snapshot {}", snapshot)))
    }

    async fn get_volume(&self, volume: &VolumeId) -> Result<VolumeRecord, RegistryError> {
        self.volume(volume)
            .ok_or_else(|| RegistryError::NotFound(format!("volume {}", volume)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::FilesystemType;

    fn registry() -> (InMemoryVolumeRegistry, VolumeId) {
        let registry = InMemoryVolumeRegistry::new(Duration::seconds(30));
        let id = VolumeId::new("v1").unwrap();
        registry.insert_volume(VolumeRecord {
            id: id.clone(),
            uuid: Uuid::new_v4(),
            size_bytes: 1 << 30,
            fs_type: FilesystemType::Ext4,
            backup_password: "pw".to_string(),
            mount_id: None,
            lease_expires_at: None,
            latest_snapshot_id: None,
        });
        (registry, id)
    }

    #[tokio::test]
    async fn test_second_mount_conflicts() {
        let (registry, id) = registry();
        let grant = registry.mount(&id, None).await.unwrap();

        for _ in 0..3 {
            match registry.mount(&id, Some("other-box")).await {
                Err(RegistryError::Conflict { holder, .. }) => {
                    assert_eq!(holder, grant.mount_id.as_str())
                }
                other => panic!("expected conflict, got {:?}", other.map(|g| g.mount_id)),
            }
        }
        registry.refresh_mount(&grant.mount_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_unknown_and_replaced() {
        let (registry, id) = registry();
        let first = registry.mount(&id, None).await.unwrap();
        registry.advance(Duration::seconds(31));

        assert!(matches!(
            registry.refresh_mount(&first.mount_id).await,
            Err(RegistryError::UnknownLease(_))
        ));

        let second = registry.mount(&id, None).await.unwrap();
        assert_ne!(first.mount_id, second.mount_id);
        assert!(matches!(
            registry.release_mount(&first.mount_id).await,
            Err(RegistryError::UnknownLease(_))
        ));
        registry.release_mount(&second.mount_id).await.unwrap();
        assert!(registry.volume(&id).unwrap().mount_id.is_none());
    }

    #[tokio::test]
    async fn test_refresh_extends_lease() {
        let (registry, id) = registry();
        let grant = registry.mount(&id, None).await.unwrap();
        registry.advance(Duration::seconds(20));
        registry.refresh_mount(&grant.mount_id).await.unwrap();
        registry.advance(Duration::seconds(20));
        registry.refresh_mount(&grant.mount_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_recording_and_force_ops() {
        let (registry, id) = registry();
        let grant = registry.mount(&id, None).await.unwrap();
        let snap = SnapshotId("s1".to_string());
        let record = registry.record_snapshot(&grant.mount_id, &snap).await.unwrap();
        assert_eq!(record.latest_snapshot_id, Some(snap.clone()));
        assert_eq!(
            registry.get_snapshot(&id, &snap).await.unwrap().mount_id,
            Some(grant.mount_id.clone())
        );

        registry.force_release_mount(&id).await.unwrap();
        assert!(registry.mount(&id, None).await.is_ok());
        registry.force_unlock(&id).await.unwrap();
        assert_eq!(registry.unlock_count(&id), 1);
    }
}
