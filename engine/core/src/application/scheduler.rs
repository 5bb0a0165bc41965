// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle Scheduler - steady-state lease keep-alive and periodic backups
//!
//! Two deadlines feed one wait point: a short refresh cadence and a longer
//! backup cadence, each re-armed after it fires. Actions run outside the
//! wait so a stop request interrupts waiting but never an in-flight lease
//! call or backup; a refresh that fell due during a slow backup fires as
//! soon as the backup returns.
//!
//! Stopping leaves the volume untouched. The caller runs
//! [`MountLeaseClient::shutdown`] afterwards.

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::mount_lease::{MountError, MountLeaseClient, ShutdownOptions};
use crate::domain::engine_config::SchedulerConfig;
use crate::domain::lease::MountState;

/// Counters for one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub backups: u64,
    pub backup_failures: u64,
}

enum Due {
    Refresh,
    Backup,
}

pub struct LifecycleScheduler {
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
}

impl LifecycleScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger a stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Options for the shutdown sequence that follows a stop
    pub fn shutdown_options(&self) -> ShutdownOptions {
        ShutdownOptions {
            final_backup_attempts: self.config.final_backup_attempts,
            retry_delay: self.config.backup_retry_interval,
            release_policy: self.config.release_policy,
        }
    }

    /// Drive refresh and backup timers until stopped. Returns an error when
    /// the client lost its lease or can no longer serve; transient refresh
    /// and backup failures are retried on the next cycle.
    pub async fn run(&self, client: &mut MountLeaseClient) -> Result<ScheduleStats, MountError> {
        let mut stats = ScheduleStats::default();
        // first refresh is immediate: it moves an opened volume to serving
        let mut next_refresh = Instant::now();
        let mut next_backup = Instant::now() + self.config.backup_interval;

        info!(
            volume_id = %client.volume_id(),
            refresh_interval = ?self.config.refresh_interval,
            backup_interval = ?self.config.backup_interval,
            "Starting lifecycle scheduler"
        );

        loop {
            let due = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    info!(volume_id = %client.volume_id(), "Stop requested, leaving scheduler loop");
                    break;
                }
                _ = sleep_until(next_refresh) => Due::Refresh,
                _ = sleep_until(next_backup) => Due::Backup,
            };

            match due {
                Due::Refresh => {
                    next_refresh = Instant::now() + self.config.refresh_interval;
                    match client.refresh_mount().await {
                        Ok(()) => stats.refreshes += 1,
                        Err(e) if e.is_fatal() => {
                            warn!(volume_id = %client.volume_id(), error = %e, "Serving session ended");
                            return Err(e);
                        }
                        Err(e) => {
                            stats.refresh_failures += 1;
                            warn!(volume_id = %client.volume_id(), error = %e, "Lease refresh failed, will retry");
                        }
                    }
                }
                Due::Backup => {
                    if client.state() != MountState::Serving {
                        // not confirmed by a refresh yet
                        debug!(state = %client.state(), "Backup due before serving, deferring");
                        next_backup = Instant::now() + self.config.backup_retry_interval;
                        continue;
                    }
                    match client.backup().await {
                        Ok(snapshot) => {
                            stats.backups += 1;
                            debug!(snapshot_id = %snapshot, "Periodic backup done");
                            next_backup = Instant::now() + self.config.backup_interval;
                        }
                        Err(e) if e.is_fatal() => {
                            warn!(volume_id = %client.volume_id(), error = %e, "Serving session ended");
                            return Err(e);
                        }
                        Err(e) => {
                            stats.backup_failures += 1;
                            warn!(
                                volume_id = %client.volume_id(),
                                error = %e,
                                retry_in = ?self.config.backup_retry_interval,
                                "Periodic backup failed, will retry"
                            );
                            next_backup = Instant::now() + self.config.backup_retry_interval;
                        }
                    }
                }
            }
        }

        info!(
            volume_id = %client.volume_id(),
            refreshes = stats.refreshes,
            backups = stats.backups,
            "Lifecycle scheduler stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::mount_lease::{EngineServices, VolumeBinding};
    use crate::domain::local_state::ClientIdentity;
    use crate::domain::volume::{FilesystemType, VolumeId, VolumeRecord, MIB};
    use crate::infrastructure::backup::InMemoryBackupTool;
    use crate::infrastructure::block::InMemoryBlockProvider;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::markers::DirectoryMarker;
    use crate::infrastructure::registry::InMemoryVolumeRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        registry: InMemoryVolumeRegistry,
        backup: InMemoryBackupTool,
        client: MountLeaseClient,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn opened_client() -> Fixture {
        let registry = InMemoryVolumeRegistry::new(chrono::Duration::seconds(60));
        registry.insert_volume(VolumeRecord {
            id: VolumeId::new("v1").unwrap(),
            uuid: uuid::Uuid::new_v4(),
            size_bytes: 8 * MIB,
            fs_type: FilesystemType::Xfs,
            backup_password: "secret".to_string(),
            mount_id: None,
            lease_expires_at: None,
            latest_snapshot_id: None,
        });
        let backup = InMemoryBackupTool::new();
        let images = tempfile::tempdir().unwrap();
        let volumes = tempfile::tempdir().unwrap();
        let services = EngineServices {
            registry: Arc::new(registry.clone()),
            provider: Arc::new(InMemoryBlockProvider::new(images.path())),
            backup: Arc::new(backup.clone()),
            marker: Arc::new(DirectoryMarker),
            events: EventBus::with_default_capacity(),
        };
        let mut client = MountLeaseClient::new(
            services,
            VolumeBinding {
                volume_id: VolumeId::new("v1").unwrap(),
                dir: volumes.path().join("v1"),
                identity: ClientIdentity {
                    api_url: "http://api".to_string(),
                    token: "t".to_string(),
                    box_id: Some("box-1".to_string()),
                },
                size_multiplier: 2.0,
            },
        )
        .await
        .unwrap();
        client.create().await.unwrap();
        client.open().await.unwrap();
        Fixture {
            registry,
            backup,
            client,
            _dirs: (images, volumes),
        }
    }

    fn config(refresh: u64, backup: u64, retry: u64) -> SchedulerConfig {
        SchedulerConfig {
            refresh_interval: Duration::from_secs(refresh),
            backup_interval: Duration::from_secs(backup),
            backup_retry_interval: Duration::from_secs(retry),
            ..Default::default()
        }
    }

    fn stop_after(scheduler: &LifecycleScheduler, after: Duration) {
        let token = scheduler.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_independently() {
        let mut f = opened_client().await;
        let scheduler = LifecycleScheduler::new(config(10, 20, 5));
        stop_after(&scheduler, Duration::from_secs(25));

        let stats = scheduler.run(&mut f.client).await.unwrap();
        assert_eq!(stats.refreshes, 3);
        assert_eq!(stats.backups, 1);
        assert_eq!(f.client.state(), MountState::Serving);
        assert_eq!(f.backup.snapshot_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_backup_is_retried() {
        let mut f = opened_client().await;
        f.backup.fail_next_snapshots(1);
        let scheduler = LifecycleScheduler::new(config(30, 60, 10));
        stop_after(&scheduler, Duration::from_secs(75));

        let stats = scheduler.run(&mut f.client).await.unwrap();
        assert_eq!(stats.backup_failures, 1);
        assert_eq!(stats.backups, 1);
        assert_eq!(f.backup.snapshot_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_overdue_after_slow_backup_fires_at_once() {
        let mut f = opened_client().await;
        // refreshes due at 30, 40 and 50 all fall inside the backup
        f.backup.delay_snapshots(Duration::from_secs(35));
        let scheduler = LifecycleScheduler::new(config(10, 20, 5));
        stop_after(&scheduler, Duration::from_secs(58));

        let stats = scheduler.run(&mut f.client).await.unwrap();
        assert_eq!(stats.backups, 1);
        // 0, 10, 20 and the overdue one at 55; the next would be at 65
        assert_eq!(stats.refreshes, 4);
        assert_eq!(stats.refresh_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backup_lets_it_finish() {
        let mut f = opened_client().await;
        f.backup.delay_snapshots(Duration::from_secs(35));
        let scheduler = LifecycleScheduler::new(config(10, 20, 5));
        stop_after(&scheduler, Duration::from_secs(30));

        let started = Instant::now();
        let stats = scheduler.run(&mut f.client).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(f.backup.snapshots_started(), 1);
        assert_eq!(stats.backups, 1);
        assert_eq!(stats.backup_failures, 0);
        assert_eq!(f.backup.snapshot_count(), 1);
        assert_eq!(stats.refreshes, 3);
        // returned once the backup started at 20 completed, not at the stop
        assert!(elapsed >= Duration::from_secs(55), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(60), "{:?}", elapsed);
        assert_eq!(f.client.state(), MountState::Serving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_lease_ends_serving_session() {
        let mut f = opened_client().await;
        f.client.refresh_mount().await.unwrap();
        f.registry.advance(chrono::Duration::seconds(120));

        let scheduler = LifecycleScheduler::new(config(10, 60, 10));
        let result = scheduler.run(&mut f.client).await;
        assert!(matches!(result, Err(MountError::LeaseRejected(_))));
        assert_eq!(f.client.state(), MountState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_backup_has_no_side_effects() {
        let mut f = opened_client().await;
        let scheduler = LifecycleScheduler::new(config(10, 600, 60));
        scheduler.shutdown_token().cancel();

        let stats = scheduler.run(&mut f.client).await.unwrap();
        assert_eq!(stats, ScheduleStats::default());
        assert_eq!(f.client.state(), MountState::Opened);
        assert_eq!(f.backup.snapshot_count(), 0);
    }

    #[test]
    fn test_shutdown_options_follow_config() {
        let scheduler = LifecycleScheduler::new(config(10, 20, 7));
        let options = scheduler.shutdown_options();
        assert_eq!(options.final_backup_attempts, 3);
        assert_eq!(options.retry_delay, Duration::from_secs(7));
    }
}
