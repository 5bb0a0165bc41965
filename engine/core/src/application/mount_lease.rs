// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount-Lease Client Application Service
//!
//! Owns one volume directory and drives it through the mount lease state
//! machine, coordinating:
//! - Registry: acquiring, refreshing and releasing the exclusive lease
//! - Block layer: creating, opening, remounting and deactivating the image
//! - Backup tool: restoring the latest snapshot and taking new ones
//! - Local state: persisting lease and restore progress next to the image
//!
//! Layout of a volume directory:
//!
//! ```text
//! <dir>/boxvol-state.yaml   local state descriptor
//! <dir>/image.img           backing file
//! <dir>/mnt                 data filesystem
//! <dir>/backup-view         read-only snapshot view during backups
//! <dir>/ref                 reference marker tmpfs
//! ```

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::backup::{BackupError, BackupTool, RepositoryAccess, SnapshotTags};
use crate::domain::events::VolumeEvent;
use crate::domain::image::{BlockError, BlockImage, BlockImageProvider};
use crate::domain::lease::{MountOperation, MountState, ReleasePolicy};
use crate::domain::local_state::{ClientIdentity, LocalVolumeState, StateError};
use crate::domain::registry::{RegistryError, VolumeRegistry};
use crate::domain::volume::{
    ImageId, ImageSpec, MountId, SnapshotId, VolumeError, VolumeId, VolumeRecord,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::markers::ReferenceMarker;
use crate::infrastructure::state_store::StateStore;
use crate::infrastructure::telemetry;

pub const DATA_DIR: &str = "mnt";
pub const SNAPSHOT_VIEW_DIR: &str = "backup-view";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Cannot {op} while {state}")]
    InvalidTransition { op: MountOperation, state: MountState },

    #[error("Volume {volume} is in use by mount {holder}")]
    InUse {
        volume: VolumeId,
        holder: String,
        expires_at: Option<DateTime<Utc>>,
    },

    #[error("Lease {0} was rejected by the registry; ownership of the volume is lost")]
    LeaseRejected(MountId),

    #[error("No lease is held")]
    NoLease,

    #[error("A final backup is owed before the lease can be released")]
    BackupOwed,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Block image error: {0}")]
    Block(#[from] BlockError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Local state error: {0}")]
    State(#[from] StateError),

    #[error("Invalid volume: {0}")]
    Volume(#[from] VolumeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MountError {
    /// Errors after which the serving session must end
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LeaseRejected(_) | Self::InUse { .. } | Self::InvalidTransition { .. }
        )
    }
}

fn in_use(err: RegistryError) -> MountError {
    match err {
        RegistryError::Conflict {
            volume,
            holder,
            expires_at,
        } => MountError::InUse {
            volume,
            holder,
            expires_at,
        },
        other => MountError::Registry(other),
    }
}

// ============================================================================
// Collaborators & configuration
// ============================================================================

/// Shared collaborators, cheap to clone
#[derive(Clone)]
pub struct EngineServices {
    pub registry: Arc<dyn VolumeRegistry>,
    pub provider: Arc<dyn BlockImageProvider>,
    pub backup: Arc<dyn BackupTool>,
    pub marker: Arc<dyn ReferenceMarker>,
    pub events: EventBus,
}

#[derive(Debug, Clone)]
pub struct VolumeBinding {
    pub volume_id: VolumeId,
    pub dir: PathBuf,
    pub identity: ClientIdentity,
    pub size_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub final_backup_attempts: u32,
    /// Pause between failed final backup attempts
    pub retry_delay: Duration,
    pub release_policy: ReleasePolicy,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            final_backup_attempts: 3,
            retry_delay: Duration::from_secs(5),
            release_policy: ReleasePolicy::RequireBackup,
        }
    }
}

/// What happened during [`MountLeaseClient::shutdown`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub remounted_read_only_at: Option<DateTime<Utc>>,
    pub final_backup: Option<SnapshotId>,
    pub final_backup_at: Option<DateTime<Utc>>,
    pub backup_attempts: u32,
    pub released_at: Option<DateTime<Utc>>,
    /// Every final backup failed and the policy kept the lease
    pub release_withheld: bool,
    /// Released although writes since the last snapshot were not backed up
    pub released_without_backup: bool,
    pub directory_removed: bool,
    pub errors: Vec<String>,
}

// ============================================================================
// Client
// ============================================================================

pub struct MountLeaseClient {
    services: EngineServices,
    binding: VolumeBinding,
    store: StateStore,
    state: MountState,
    local: Option<LocalVolumeState>,
    volume: Option<VolumeRecord>,
    image: Option<Arc<dyn BlockImage>>,
    read_only: bool,
    backup_owed: bool,
    last_backup_at: Option<DateTime<Utc>>,
}

impl MountLeaseClient {
    /// Bind to a volume directory. Existing local state puts the client in
    /// `Created`, so a restarted process can `open` straight away.
    pub async fn new(services: EngineServices, binding: VolumeBinding) -> Result<Self, MountError> {
        let store = StateStore::new(&binding.dir);
        let local = if store.exists().await? {
            let local = store.load().await?;
            if local.volume_id != binding.volume_id {
                return Err(StateError::Corrupt {
                    path: store.path().display().to_string(),
                    reason: format!(
                        "directory belongs to volume {}, not {}",
                        local.volume_id, binding.volume_id
                    ),
                }
                .into());
            }
            Some(local)
        } else {
            None
        };

        Ok(Self {
            services,
            store,
            state: if local.is_some() {
                MountState::Created
            } else {
                MountState::Unprovisioned
            },
            local,
            binding,
            volume: None,
            image: None,
            read_only: false,
            backup_owed: false,
            last_backup_at: None,
        })
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.binding.volume_id
    }

    pub fn dir(&self) -> &Path {
        &self.binding.dir
    }

    pub fn data_dir(&self) -> PathBuf {
        self.binding.dir.join(DATA_DIR)
    }

    pub fn local_state(&self) -> Option<&LocalVolumeState> {
        self.local.as_ref()
    }

    pub fn mount_id(&self) -> Option<&MountId> {
        self.local.as_ref().and_then(|l| l.mount_id.as_ref())
    }

    pub fn backup_owed(&self) -> bool {
        self.backup_owed
    }

    pub fn last_backup_at(&self) -> Option<DateTime<Utc>> {
        self.last_backup_at
    }

    fn guard(&self, op: MountOperation) -> Result<(), MountError> {
        if self.state.permits(op) {
            Ok(())
        } else {
            Err(MountError::InvalidTransition {
                op,
                state: self.state,
            })
        }
    }

    fn local_mut(&mut self) -> Result<&mut LocalVolumeState, MountError> {
        self.local
            .as_mut()
            .ok_or_else(|| StateError::Missing(self.store.path().display().to_string()).into())
    }

    fn image(&self) -> Result<Arc<dyn BlockImage>, MountError> {
        self.image
            .clone()
            .ok_or_else(|| BlockError::NotFound(self.binding.dir.display().to_string()).into())
    }

    fn volume_record(&self) -> Result<&VolumeRecord, MountError> {
        self.volume.as_ref().ok_or(MountError::NoLease)
    }

    async fn persist(&self) -> Result<(), MountError> {
        if let Some(local) = &self.local {
            self.store.save(local).await?;
        }
        Ok(())
    }

    /// Request a fresh lease and record it locally
    async fn acquire_lease(&mut self) -> Result<MountId, MountError> {
        let grant = self
            .services
            .registry
            .mount(&self.binding.volume_id, self.binding.identity.box_id.as_deref())
            .await
            .map_err(in_use)?;

        self.local_mut()?.mount_id = Some(grant.mount_id.clone());
        self.persist().await?;
        self.volume = Some(grant.volume);

        info!(volume_id = %self.binding.volume_id, mount_id = %grant.mount_id, "Lease acquired");
        self.services.events.publish(VolumeEvent::LeaseAcquired {
            volume_id: self.binding.volume_id.clone(),
            mount_id: grant.mount_id.clone(),
            acquired_at: Utc::now(),
        });
        Ok(grant.mount_id)
    }

    /// The registry no longer knows our lease: the claim is void
    async fn lose_lease(&mut self, mount: MountId) -> MountError {
        warn!(volume_id = %self.binding.volume_id, mount_id = %mount, "Lease rejected by registry");
        if let Some(local) = self.local.as_mut() {
            local.mount_id = None;
        }
        if let Err(e) = self.persist().await {
            error!(error = %e, "Failed to persist lease loss");
        }
        self.state = MountState::Failed;
        telemetry::record_lease_refresh("rejected");
        self.services.events.publish(VolumeEvent::LeaseRejected {
            volume_id: self.binding.volume_id.clone(),
            mount_id: mount.clone(),
            rejected_at: Utc::now(),
        });
        MountError::LeaseRejected(mount)
    }

    // ------------------------------------------------------------------------
    // Create / Open
    // ------------------------------------------------------------------------

    /// Provision the volume directory: lease, local state and block image.
    /// Fails without side effects when the directory is already provisioned.
    pub async fn create(&mut self) -> Result<(), MountError> {
        self.guard(MountOperation::Create)?;
        if self.store.exists().await? {
            return Err(StateError::AlreadyExists(self.store.path().display().to_string()).into());
        }

        let volume_id = self.binding.volume_id.clone();
        let grant = self
            .services
            .registry
            .mount(&volume_id, self.binding.identity.box_id.as_deref())
            .await
            .map_err(in_use)?;
        let record = grant.volume;
        let image_id = ImageId::generate(&volume_id);
        let local = LocalVolumeState::new(
            self.binding.identity.clone(),
            volume_id.clone(),
            record.uuid,
            image_id.clone(),
            grant.mount_id.clone(),
        );

        let (spec, image) = match self.provision(&record, &local).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                error!(volume_id = %volume_id, error = %e, "Volume creation failed, releasing lease");
                if let Err(e) = self.services.registry.release_mount(&grant.mount_id).await {
                    warn!(error = %e, "Failed to release lease after failed create");
                }
                return Err(e);
            }
        };

        info!(
            volume_id = %volume_id,
            image_id = %image_id,
            image_bytes = spec.image_bytes,
            filesystem_bytes = spec.filesystem_bytes,
            "Volume created"
        );
        self.services.events.publish(VolumeEvent::VolumeCreated {
            volume_id: volume_id.clone(),
            image_id,
            image_bytes: spec.image_bytes,
            filesystem_bytes: spec.filesystem_bytes,
            created_at: Utc::now(),
        });
        self.services.events.publish(VolumeEvent::LeaseAcquired {
            volume_id,
            mount_id: grant.mount_id,
            acquired_at: Utc::now(),
        });

        self.local = Some(local);
        self.volume = Some(record);
        self.image = Some(image);
        self.state = MountState::Created;
        Ok(())
    }

    /// Claim the directory and build the image. Local state written here is
    /// removed again when the image cannot be built.
    async fn provision(
        &self,
        record: &VolumeRecord,
        local: &LocalVolumeState,
    ) -> Result<(ImageSpec, Arc<dyn BlockImage>), MountError> {
        let spec = ImageSpec::for_volume(record, local.image_id.clone(), self.binding.size_multiplier)?;
        // claims the directory; a concurrent create loses here
        self.store.create(local).await?;

        match self.services.provider.create(&self.binding.dir, &spec).await {
            Ok(image) => Ok((spec, image)),
            Err(e) => {
                if let Err(e) = self.store.remove().await {
                    warn!(error = %e, "Failed to remove local state");
                }
                Err(e.into())
            }
        }
    }

    /// Re-validate the lease, attach the image, place the reference marker
    /// and mount the filesystem writable
    pub async fn open(&mut self) -> Result<(), MountError> {
        self.guard(MountOperation::Open)?;
        self.local = Some(self.store.load().await?);

        match self.mount_id().cloned() {
            Some(mount) => match self.services.registry.refresh_mount(&mount).await {
                Ok(record) => {
                    debug!(mount_id = %mount, "Existing lease still valid");
                    self.volume = Some(record);
                }
                Err(RegistryError::UnknownLease(_)) => {
                    // expired and possibly reassigned; the data on disk is
                    // still ours to serve once a new lease is granted
                    info!(mount_id = %mount, "Stored lease is unknown, requesting a new one");
                    self.local_mut()?.mount_id = None;
                    self.persist().await?;
                    self.acquire_lease().await?;
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                self.acquire_lease().await?;
            }
        }

        let image_id = self.local_mut()?.image_id.clone();
        // the marker must exist before the image is active
        self.services
            .marker
            .place(&self.binding.dir, &image_id)
            .await?;
        let image = match self.attach(&image_id).await {
            Ok(image) => image,
            Err(e) => {
                if let Err(e) = self.services.marker.remove(&self.binding.dir).await {
                    warn!(error = %e, "Failed to remove reference marker after failed open");
                }
                return Err(e);
            }
        };

        info!(volume_id = %self.binding.volume_id, image_id = %image_id, "Volume opened");
        self.services.events.publish(VolumeEvent::VolumeOpened {
            volume_id: self.binding.volume_id.clone(),
            image_id,
            opened_at: Utc::now(),
        });

        self.image = Some(image);
        self.read_only = false;
        self.backup_owed = false;
        self.state = MountState::Opened;
        Ok(())
    }

    async fn attach(&self, image_id: &ImageId) -> Result<Arc<dyn BlockImage>, MountError> {
        let image = self.services.provider.open(&self.binding.dir, image_id).await?;
        if let Err(e) = image.mount(&self.data_dir(), false).await {
            if let Err(e) = image.deactivate().await {
                warn!(image_id = %image_id, error = %e, "Failed to deactivate image after failed mount");
            }
            return Err(e.into());
        }
        Ok(image)
    }

    // ------------------------------------------------------------------------
    // Lease keep-alive
    // ------------------------------------------------------------------------

    /// Extend the held lease, or request one when none is held. Safe to call
    /// repeatedly from a timer.
    pub async fn refresh_mount(&mut self) -> Result<(), MountError> {
        self.guard(MountOperation::Refresh)?;

        let Some(mount) = self.mount_id().cloned() else {
            self.acquire_lease().await?;
            telemetry::record_lease_refresh("reacquired");
            self.state = MountState::Serving;
            return Ok(());
        };

        match self.services.registry.refresh_mount(&mount).await {
            Ok(record) => {
                self.volume = Some(record);
                self.state = MountState::Serving;
                telemetry::record_lease_refresh("ok");
                debug!(volume_id = %self.binding.volume_id, mount_id = %mount, "Lease refreshed");
                self.services.events.publish(VolumeEvent::LeaseRefreshed {
                    volume_id: self.binding.volume_id.clone(),
                    mount_id: mount,
                    refreshed_at: Utc::now(),
                });
                Ok(())
            }
            Err(RegistryError::UnknownLease(_)) if self.state == MountState::Opened => {
                // nothing has been served under this lease yet
                info!(mount_id = %mount, "Lease unknown before serving, requesting a new one");
                self.local_mut()?.mount_id = None;
                self.persist().await?;
                self.acquire_lease().await?;
                telemetry::record_lease_refresh("reacquired");
                self.state = MountState::Serving;
                Ok(())
            }
            Err(RegistryError::UnknownLease(_)) => Err(self.lose_lease(mount).await),
            Err(e) => {
                telemetry::record_lease_refresh("error");
                Err(e.into())
            }
        }
    }

    /// Refresh without changing state, used while a release is pending
    async fn keep_alive(&mut self) -> Result<(), MountError> {
        let mount = self.mount_id().cloned().ok_or(MountError::NoLease)?;
        match self.services.registry.refresh_mount(&mount).await {
            Ok(record) => {
                self.volume = Some(record);
                telemetry::record_lease_refresh("ok");
                Ok(())
            }
            Err(RegistryError::UnknownLease(_)) => Err(self.lose_lease(mount).await),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------------
    // Restore / Backup
    // ------------------------------------------------------------------------

    /// Replay the volume's latest snapshot into the mounted image. Runs at
    /// most once per volume directory; returns the restored snapshot.
    pub async fn restore_from_latest_snapshot(&mut self) -> Result<Option<SnapshotId>, MountError> {
        self.guard(MountOperation::Restore)?;
        if self.local_mut()?.restore_done {
            debug!(volume_id = %self.binding.volume_id, "Restore already done");
            return Ok(None);
        }

        let record = self.volume_record()?.clone();
        let Some(snapshot) = record.latest_snapshot_id.clone() else {
            info!(volume_id = %self.binding.volume_id, "No snapshot to restore");
            self.local_mut()?.restore_done = true;
            self.persist().await?;
            return Ok(None);
        };

        // only a snapshot the registry has recorded for this volume replaces
        // the image contents
        let recorded = self
            .services
            .registry
            .get_snapshot(&record.id, &snapshot)
            .await?;
        if recorded.volume_id != record.id {
            return Err(RegistryError::Protocol(format!(
                "snapshot {} belongs to volume {}, not {}",
                snapshot, recorded.volume_id, record.id
            ))
            .into());
        }
        debug!(
            snapshot_id = %snapshot,
            snapshot_created_at = %recorded.created_at,
            written_by = ?recorded.mount_id.as_ref().map(MountId::as_str),
            "Restoring snapshot"
        );
        let summary = self
            .services
            .backup
            .restore(&self.repository(&record), &snapshot, &self.data_dir(), true)
            .await?;

        let local = self.local_mut()?;
        local.restore_done = true;
        local.restored_snapshot_id = Some(snapshot.clone());
        self.persist().await?;

        info!(
            volume_id = %self.binding.volume_id,
            snapshot_id = %snapshot,
            snapshot_created_at = %recorded.created_at,
            restored = summary.entries_restored,
            skipped = summary.entries_skipped,
            "Snapshot restored"
        );
        self.services.events.publish(VolumeEvent::SnapshotRestored {
            volume_id: self.binding.volume_id.clone(),
            snapshot_id: snapshot.clone(),
            restored_at: Utc::now(),
        });
        Ok(Some(snapshot))
    }

    fn repository(&self, record: &VolumeRecord) -> RepositoryAccess {
        RepositoryAccess {
            volume_id: self.binding.volume_id.clone(),
            password: record.backup_password.clone(),
        }
    }

    /// Snapshot the filesystem and record it with the registry. A writable
    /// filesystem is backed up through a read-only snapshot view; once
    /// remounted read-only the live mount is used directly.
    pub async fn backup(&mut self) -> Result<SnapshotId, MountError> {
        self.guard(MountOperation::Backup)?;
        let final_backup = self.state == MountState::ReleasePending;
        let mount = self.mount_id().cloned().ok_or(MountError::NoLease)?;
        let record = self.volume_record()?.clone();
        let image = self.image()?;
        let tags = SnapshotTags {
            volume_id: self.binding.volume_id.clone(),
            mount_id: Some(mount.clone()),
        };
        let repo = self.repository(&record);

        let result = if self.read_only {
            self.services
                .backup
                .snapshot(&repo, &self.data_dir(), &tags)
                .await
                .map_err(MountError::from)
        } else {
            let view = self.binding.dir.join(SNAPSHOT_VIEW_DIR);
            match image.mount_snapshot_view(&view).await {
                Ok(()) => {
                    let result = self.services.backup.snapshot(&repo, &view, &tags).await;
                    if let Err(e) = image.drop_snapshot_view(&view).await {
                        warn!(error = %e, "Failed to drop snapshot view");
                    }
                    result.map_err(MountError::from)
                }
                Err(e) => Err(e.into()),
            }
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                telemetry::record_backup_failure(final_backup);
                warn!(volume_id = %self.binding.volume_id, error = %e, "Backup failed");
                self.services.events.publish(VolumeEvent::BackupFailed {
                    volume_id: self.binding.volume_id.clone(),
                    error: e.to_string(),
                    failed_at: Utc::now(),
                });
                return Err(e);
            }
        };

        match self.services.registry.record_snapshot(&mount, &snapshot).await {
            Ok(record) => self.volume = Some(record),
            Err(RegistryError::UnknownLease(_)) => return Err(self.lose_lease(mount).await),
            Err(e) => {
                telemetry::record_backup_failure(final_backup);
                return Err(e.into());
            }
        }

        let completed_at = Utc::now();
        if final_backup {
            self.backup_owed = false;
        }
        self.last_backup_at = Some(completed_at);
        telemetry::record_backup(final_backup);
        info!(
            volume_id = %self.binding.volume_id,
            snapshot_id = %snapshot,
            read_only = self.read_only,
            "Backup completed"
        );
        self.services.events.publish(VolumeEvent::BackupCompleted {
            volume_id: self.binding.volume_id.clone(),
            snapshot_id: snapshot.clone(),
            mount_id: Some(mount),
            read_only: self.read_only,
            completed_at,
        });
        Ok(snapshot)
    }

    // ------------------------------------------------------------------------
    // Release / Teardown
    // ------------------------------------------------------------------------

    /// Stop writes: enter `ReleasePending` and remount read-only. A final
    /// backup is owed if the volume was serving.
    pub async fn begin_release(&mut self) -> Result<(), MountError> {
        self.guard(MountOperation::BeginRelease)?;
        self.backup_owed = self.state == MountState::Serving;
        self.state = MountState::ReleasePending;

        self.image()?.remount_read_only(&self.data_dir()).await?;
        self.read_only = true;
        info!(volume_id = %self.binding.volume_id, "Remounted read-only");
        self.services.events.publish(VolumeEvent::RemountedReadOnly {
            volume_id: self.binding.volume_id.clone(),
            remounted_at: Utc::now(),
        });
        Ok(())
    }

    /// Hand the lease back. Refused while a final backup is owed.
    pub async fn release_mount(&mut self) -> Result<(), MountError> {
        self.release(false).await
    }

    async fn release(&mut self, allow_unbacked: bool) -> Result<(), MountError> {
        self.guard(MountOperation::Release)?;
        if self.backup_owed && !allow_unbacked {
            return Err(MountError::BackupOwed);
        }
        let mount = self.mount_id().cloned().ok_or(MountError::NoLease)?;

        match self.services.registry.release_mount(&mount).await {
            Ok(record) => self.volume = Some(record),
            Err(RegistryError::UnknownLease(_)) => {
                warn!(mount_id = %mount, "Lease already gone at release");
            }
            Err(e) => return Err(e.into()),
        }

        self.local_mut()?.mount_id = None;
        self.persist().await?;
        self.state = MountState::Released;

        info!(volume_id = %self.binding.volume_id, mount_id = %mount, "Lease released");
        self.services.events.publish(VolumeEvent::LeaseReleased {
            volume_id: self.binding.volume_id.clone(),
            mount_id: mount,
            released_at: Utc::now(),
        });
        Ok(())
    }

    /// Unmount, drop the marker and deactivate the image, continuing past
    /// failures. Returns the errors encountered.
    async fn release_local_resources(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        let dir = self.binding.dir.clone();

        if let Some(image) = self.image.clone() {
            if let Err(e) = image.drop_snapshot_view(&dir.join(SNAPSHOT_VIEW_DIR)).await {
                errors.push(format!("drop snapshot view: {}", e));
            }
            if let Err(e) = image.unmount(&self.data_dir()).await {
                errors.push(format!("unmount: {}", e));
            }
        }
        if let Err(e) = self.services.marker.remove(&dir).await {
            errors.push(format!("remove marker: {}", e));
        }
        if let Some(image) = self.image.clone() {
            match image.deactivate().await {
                Ok(()) => self.services.events.publish(VolumeEvent::ImageDeactivated {
                    volume_id: self.binding.volume_id.clone(),
                    image_id: image.image_id().clone(),
                    deactivated_at: Utc::now(),
                }),
                Err(e) => errors.push(format!("deactivate: {}", e)),
            }
        }
        for e in &errors {
            warn!(volume_id = %self.binding.volume_id, error = %e, "Teardown step failed");
        }
        errors
    }

    /// Release local resources. After a release the volume directory is
    /// removed; after a lost lease it is kept so the volume can be reopened.
    pub async fn teardown(&mut self) -> Result<Vec<String>, MountError> {
        self.guard(MountOperation::Teardown)?;
        let mut errors = self.release_local_resources().await;

        if self.state == MountState::Failed {
            self.image = None;
            self.state = MountState::Created;
            return Ok(errors);
        }

        if errors.is_empty() {
            match tokio::fs::remove_dir_all(&self.binding.dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(format!("remove directory: {}", e)),
            }
        } else {
            // a mounted filesystem may still sit below the directory
            warn!(dir = %self.binding.dir.display(), "Keeping volume directory after failed teardown");
        }

        self.image = None;
        self.local = None;
        self.state = MountState::Destroyed;
        Ok(errors)
    }

    /// Free the kernel resources but keep the lease and local state, so a
    /// later process can `open` the same directory again.
    pub async fn detach(&mut self) -> Result<Vec<String>, MountError> {
        self.guard(MountOperation::Detach)?;
        let errors = self.release_local_resources().await;
        self.image = None;
        self.state = MountState::Created;
        info!(volume_id = %self.binding.volume_id, "Volume detached, lease kept");
        Ok(errors)
    }

    /// Full stop: remount read-only, final backup, release, unmount,
    /// deactivate, remove the directory. Kernel-level failures are logged
    /// and do not block the release.
    pub async fn shutdown(&mut self, options: &ShutdownOptions) -> Result<ShutdownReport, MountError> {
        let mut report = ShutdownReport::default();
        info!(volume_id = %self.binding.volume_id, state = %self.state, "Shutting down volume");

        if self.state.permits(MountOperation::BeginRelease) {
            match self.begin_release().await {
                Ok(()) => report.remounted_read_only_at = Some(Utc::now()),
                Err(e) => {
                    error!(error = %e, "Remount read-only failed, continuing shutdown");
                    report.errors.push(format!("remount read-only: {}", e));
                }
            }
        }

        if self.state == MountState::ReleasePending && self.backup_owed {
            let attempts = options.final_backup_attempts.max(1);
            while report.backup_attempts < attempts {
                report.backup_attempts += 1;
                match self.backup().await {
                    Ok(snapshot) => {
                        report.final_backup = Some(snapshot);
                        report.final_backup_at = self.last_backup_at;
                        break;
                    }
                    Err(e @ MountError::LeaseRejected(_)) => {
                        report.errors.push(format!("final backup: {}", e));
                        break;
                    }
                    Err(e) => {
                        report.errors.push(format!("final backup attempt {}: {}", report.backup_attempts, e));
                        if report.backup_attempts < attempts {
                            if let Err(e @ MountError::LeaseRejected(_)) = self.keep_alive().await {
                                report.errors.push(format!("keep-alive: {}", e));
                                break;
                            }
                            tokio::time::sleep(options.retry_delay).await;
                        }
                    }
                }
            }
        }

        if self.state == MountState::ReleasePending {
            let release = if self.backup_owed {
                match options.release_policy {
                    ReleasePolicy::RequireBackup => {
                        error!(
                            volume_id = %self.binding.volume_id,
                            "Final backup failed; keeping lease and volume directory"
                        );
                        report.release_withheld = true;
                        None
                    }
                    ReleasePolicy::BestEffort => {
                        error!(
                            volume_id = %self.binding.volume_id,
                            "Final backup failed; releasing anyway, writes since the last snapshot are lost"
                        );
                        report.released_without_backup = true;
                        Some(self.release(true).await)
                    }
                }
            } else {
                Some(self.release(false).await)
            };

            match release {
                Some(Ok(())) => report.released_at = Some(Utc::now()),
                Some(Err(e)) => report.errors.push(format!("release: {}", e)),
                None => {}
            }
        }

        match self.state {
            MountState::Released => {
                let errors = self.teardown().await?;
                report.directory_removed = errors.is_empty();
                report.errors.extend(errors);
            }
            MountState::Failed => {
                report.errors.extend(self.teardown().await?);
            }
            MountState::ReleasePending => {
                report.errors.extend(self.detach().await?);
            }
            _ => {}
        }

        info!(
            volume_id = %self.binding.volume_id,
            final_backup = ?report.final_backup,
            released = report.released_at.is_some(),
            withheld = report.release_withheld,
            "Shutdown finished"
        );
        Ok(report)
    }
}
