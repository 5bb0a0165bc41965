// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end volume lifecycle against the in-memory registry, block
//! provider and backup tool.
//!
//! Covers the full serve cycle (create, open, restore, scheduled refresh and
//! backup, shutdown), release ordering, single-writer conflicts, lease
//! expiry recovery, idempotent create/deactivate/restore and the backup
//! round trip into a fresh image.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use boxvol_core::application::{
    EngineServices, LifecycleScheduler, MountError, MountLeaseClient, ShutdownOptions,
    VolumeBinding,
};
use boxvol_core::domain::engine_config::SchedulerConfig;
use boxvol_core::domain::events::VolumeEvent;
use boxvol_core::domain::image::{BlockImage, BlockImageProvider};
use boxvol_core::domain::lease::{MountState, ReleasePolicy};
use boxvol_core::domain::local_state::{ClientIdentity, StateError};
use boxvol_core::domain::volume::{FilesystemType, ImageSpec, VolumeId, VolumeRecord, MIB};
use boxvol_core::infrastructure::backup::InMemoryBackupTool;
use boxvol_core::infrastructure::block::InMemoryBlockProvider;
use boxvol_core::infrastructure::event_bus::EventBus;
use boxvol_core::infrastructure::markers::DirectoryMarker;
use boxvol_core::infrastructure::registry::InMemoryVolumeRegistry;
use boxvol_core::infrastructure::state_store::StateStore;

const GIB: u64 = 1024 * MIB;

struct Node {
    registry: InMemoryVolumeRegistry,
    provider: InMemoryBlockProvider,
    backup: InMemoryBackupTool,
    events: EventBus,
    volumes: tempfile::TempDir,
    _images: tempfile::TempDir,
}

impl Node {
    fn new(size_bytes: u64) -> Self {
        let registry = InMemoryVolumeRegistry::new(chrono::Duration::seconds(60));
        registry.insert_volume(VolumeRecord {
            id: v1(),
            uuid: uuid::Uuid::new_v4(),
            size_bytes,
            fs_type: FilesystemType::Ext4,
            backup_password: "correct horse".to_string(),
            mount_id: None,
            lease_expires_at: None,
            latest_snapshot_id: None,
        });
        let images = tempfile::tempdir().unwrap();
        Self {
            registry,
            provider: InMemoryBlockProvider::new(images.path()),
            backup: InMemoryBackupTool::new(),
            events: EventBus::new(256),
            volumes: tempfile::tempdir().unwrap(),
            _images: images,
        }
    }

    fn services(&self) -> EngineServices {
        EngineServices {
            registry: Arc::new(self.registry.clone()),
            provider: Arc::new(self.provider.clone()),
            backup: Arc::new(self.backup.clone()),
            marker: Arc::new(DirectoryMarker),
            events: self.events.clone(),
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.volumes.path().join(name)
    }

    async fn client(&self, name: &str) -> MountLeaseClient {
        MountLeaseClient::new(
            self.services(),
            VolumeBinding {
                volume_id: v1(),
                dir: self.dir(name),
                identity: ClientIdentity {
                    api_url: "https://api.example".to_string(),
                    token: "node-token".to_string(),
                    box_id: Some("box-7".to_string()),
                },
                size_multiplier: 2.0,
            },
        )
        .await
        .unwrap()
    }
}

fn v1() -> VolumeId {
    VolumeId::new("v1").unwrap()
}

fn scheduler(refresh: u64, backup: u64) -> LifecycleScheduler {
    LifecycleScheduler::new(SchedulerConfig {
        refresh_interval: Duration::from_secs(refresh),
        backup_interval: Duration::from_secs(backup),
        backup_retry_interval: Duration::from_secs(5),
        ..Default::default()
    })
}

fn fast_shutdown(policy: ReleasePolicy) -> ShutdownOptions {
    ShutdownOptions {
        final_backup_attempts: 3,
        retry_delay: Duration::from_millis(1),
        release_policy: policy,
    }
}

fn populate(root: &Path) {
    std::fs::write(root.join("hello.txt"), b"hello, volume\n").unwrap();
    std::fs::create_dir_all(root.join("nested/deeper")).unwrap();
    std::fs::write(root.join("nested/deeper/blob.bin"), (0u8..=255).collect::<Vec<_>>()).unwrap();
}

async fn serving(node: &Node, name: &str) -> MountLeaseClient {
    let mut client = node.client(name).await;
    client.create().await.unwrap();
    client.open().await.unwrap();
    client.refresh_mount().await.unwrap();
    client
}

#[tokio::test(start_paused = true)]
async fn test_one_gib_volume_full_cycle() {
    let node = Node::new(GIB);
    let mut events = node.events.subscribe();
    let mut client = node.client("v1").await;

    client.create().await.unwrap();
    client.open().await.unwrap();
    assert_eq!(client.restore_from_latest_snapshot().await.unwrap(), None);
    assert_eq!(node.backup.restore_count(), 0);
    populate(&client.data_dir());

    let scheduler = scheduler(10, 25);
    let token = scheduler.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(28)).await;
        token.cancel();
    });
    let stats = scheduler.run(&mut client).await.unwrap();
    assert!(stats.refreshes >= 1);
    assert_eq!(stats.backups, 1);

    let lease = client.mount_id().cloned().unwrap();
    let before = node.backup.snapshot_count();
    let report = client
        .shutdown(&fast_shutdown(ReleasePolicy::RequireBackup))
        .await
        .unwrap();
    assert_eq!(node.backup.snapshot_count(), before + 1);

    let final_snapshot = report.final_backup.clone().unwrap();
    let info = node
        .backup
        .snapshot_infos()
        .into_iter()
        .find(|s| s.id == final_snapshot)
        .unwrap();
    assert!(info.tags.contains(&"volume=v1".to_string()));
    assert!(info.tags.contains(&format!("mount={}", lease)));

    // release ordering
    assert!(report.remounted_read_only_at.unwrap() <= report.final_backup_at.unwrap());
    assert!(report.final_backup_at.unwrap() <= report.released_at.unwrap());
    assert!(report.directory_removed);
    assert_eq!(client.state(), MountState::Destroyed);
    assert!(!node.dir("v1").exists());

    let record = node.registry.volume(&v1()).unwrap();
    assert_eq!(record.mount_id, None);
    assert_eq!(record.latest_snapshot_id, Some(final_snapshot));

    let created = events
        .drain()
        .into_iter()
        .find_map(|e| match e {
            VolumeEvent::VolumeCreated {
                image_bytes,
                filesystem_bytes,
                ..
            } => Some((image_bytes, filesystem_bytes)),
            _ => None,
        })
        .unwrap();
    assert_eq!(created.1, GIB);
    assert!(created.0 >= 2 * GIB && created.0 < 2 * GIB + 16 * MIB);
}

#[tokio::test]
async fn test_shutdown_event_order() {
    let node = Node::new(64 * MIB);
    let mut client = serving(&node, "v1").await;
    populate(&client.data_dir());
    let mut events = node.events.subscribe();

    client
        .shutdown(&fast_shutdown(ReleasePolicy::RequireBackup))
        .await
        .unwrap();

    let names: Vec<&str> = events.drain().iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "remounted_read_only",
            "backup_completed",
            "lease_released",
            "image_deactivated"
        ]
    );
}

#[tokio::test]
async fn test_final_backup_reads_read_only_live_mount() {
    let node = Node::new(64 * MIB);
    let mut client = serving(&node, "v1").await;
    let mut events = node.events.subscribe();

    client.begin_release().await.unwrap();
    client.backup().await.unwrap();

    let read_only = events.drain().into_iter().find_map(|e| match e {
        VolumeEvent::BackupCompleted { read_only, .. } => Some(read_only),
        _ => None,
    });
    assert_eq!(read_only, Some(true));
}

#[tokio::test]
async fn test_release_before_final_backup_is_rejected() {
    let node = Node::new(64 * MIB);
    let mut client = serving(&node, "v1").await;

    assert!(matches!(
        client.release_mount().await,
        Err(MountError::InvalidTransition { .. })
    ));
    client.begin_release().await.unwrap();
    assert!(matches!(client.release_mount().await, Err(MountError::BackupOwed)));
    assert!(node.registry.volume(&v1()).unwrap().mount_id.is_some());

    client.backup().await.unwrap();
    client.release_mount().await.unwrap();
    assert!(node.registry.volume(&v1()).unwrap().mount_id.is_none());
}

#[tokio::test]
async fn test_second_writer_gets_in_use_until_release() {
    let node = Node::new(64 * MIB);
    let mut first = serving(&node, "a").await;

    let mut second = node.client("b").await;
    assert!(matches!(second.create().await, Err(MountError::InUse { .. })));
    assert_eq!(second.state(), MountState::Unprovisioned);

    first
        .shutdown(&fast_shutdown(ReleasePolicy::RequireBackup))
        .await
        .unwrap();
    second.create().await.unwrap();
    assert!(second.mount_id().is_some());
}

#[tokio::test]
async fn test_expired_lease_is_replaced_and_persisted() {
    let node = Node::new(64 * MIB);
    let mut client = serving(&node, "v1").await;
    let stale = client.mount_id().cloned().unwrap();

    node.registry.advance(chrono::Duration::seconds(90));
    assert!(matches!(
        client.refresh_mount().await,
        Err(MountError::LeaseRejected(_))
    ));
    assert_eq!(client.state(), MountState::Failed);

    client.teardown().await.unwrap();
    client.open().await.unwrap();
    client.refresh_mount().await.unwrap();

    let fresh = client.mount_id().cloned().unwrap();
    assert_ne!(fresh, stale);
    let persisted = StateStore::new(&node.dir("v1")).load().await.unwrap();
    assert_eq!(persisted.mount_id, Some(fresh));
}

#[tokio::test]
async fn test_create_twice_leaves_state_untouched() {
    let node = Node::new(64 * MIB);
    let mut first = node.client("v1").await;
    let mut racer = node.client("v1").await;

    first.create().await.unwrap();
    let state_path = node.dir("v1").join("boxvol-state.yaml");
    let original = std::fs::read(&state_path).unwrap();

    assert!(matches!(
        racer.create().await,
        Err(MountError::State(StateError::AlreadyExists(_)))
    ));
    assert!(matches!(
        first.create().await,
        Err(MountError::InvalidTransition { .. })
    ));
    assert_eq!(std::fs::read(&state_path).unwrap(), original);
}

#[tokio::test]
async fn test_deactivate_twice_is_a_no_op() {
    let node = Node::new(64 * MIB);
    let record = node.registry.volume(&v1()).unwrap();
    let spec = ImageSpec::for_volume(
        &record,
        boxvol_core::domain::volume::ImageId::generate(&v1()),
        2.0,
    )
    .unwrap();

    let image = node.provider.create(&node.dir("raw"), &spec).await.unwrap();
    image.deactivate().await.unwrap();
    image.deactivate().await.unwrap();
    assert!(!node.provider.is_active(&spec.image_id));
}

#[tokio::test]
async fn test_backup_restores_into_fresh_image() {
    let node = Node::new(64 * MIB);
    let mut original = serving(&node, "first").await;
    populate(&original.data_dir());
    let expected_blob = std::fs::read(original.data_dir().join("nested/deeper/blob.bin")).unwrap();
    original
        .shutdown(&fast_shutdown(ReleasePolicy::RequireBackup))
        .await
        .unwrap();

    let mut restored = node.client("second").await;
    restored.create().await.unwrap();
    restored.open().await.unwrap();
    let snapshot = restored.restore_from_latest_snapshot().await.unwrap();
    assert!(snapshot.is_some());
    assert_eq!(restored.restore_from_latest_snapshot().await.unwrap(), None);
    assert_eq!(node.backup.restore_count(), 1);

    let data = restored.data_dir();
    assert_eq!(std::fs::read(data.join("hello.txt")).unwrap(), b"hello, volume\n");
    assert_eq!(std::fs::read(data.join("nested/deeper/blob.bin")).unwrap(), expected_blob);
    let leftovers: Vec<_> = std::fs::read_dir(&data)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".boxvol-restore-"))
        .collect();
    assert!(leftovers.is_empty());

    let local = restored.local_state().unwrap();
    assert!(local.restore_done);
    assert_eq!(local.restored_snapshot_id, snapshot);
}

#[tokio::test]
async fn test_require_backup_keeps_lease_and_directory_for_retry() {
    let node = Node::new(64 * MIB);
    let mut client = serving(&node, "v1").await;
    populate(&client.data_dir());
    node.backup.fail_next_snapshots(3);

    let report = client
        .shutdown(&fast_shutdown(ReleasePolicy::RequireBackup))
        .await
        .unwrap();
    assert!(report.release_withheld);
    assert_eq!(report.backup_attempts, 3);
    assert_eq!(client.state(), MountState::Created);
    assert!(node.registry.volume(&v1()).unwrap().mount_id.is_some());

    // a restarted engine picks the directory up again and finishes the job
    drop(client);
    let mut again = node.client("v1").await;
    again.open().await.unwrap();
    again.refresh_mount().await.unwrap();
    let report = again
        .shutdown(&fast_shutdown(ReleasePolicy::RequireBackup))
        .await
        .unwrap();
    assert!(report.final_backup.is_some());
    assert!(report.released_at.is_some());
    assert!(node.registry.volume(&v1()).unwrap().mount_id.is_none());
}

#[tokio::test]
async fn test_best_effort_releases_without_backup() {
    let node = Node::new(64 * MIB);
    let mut client = serving(&node, "v1").await;
    node.backup.fail_next_snapshots(10);

    let report = client
        .shutdown(&fast_shutdown(ReleasePolicy::BestEffort))
        .await
        .unwrap();
    assert!(report.released_without_backup);
    assert!(report.final_backup.is_none());
    assert!(report.released_at.is_some());
    assert!(node.registry.volume(&v1()).unwrap().mount_id.is_none());
}
