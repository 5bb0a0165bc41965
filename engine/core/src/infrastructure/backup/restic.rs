// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! restic-backed [`BackupTool`]
//!
//! restic talks to the local object-store proxy over its REST backend
//! (`rest:http://<proxy>/`). The repository password comes from the volume
//! record and is only ever passed through the environment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::backup::{
    BackupError, BackupTool, RepositoryAccess, RestoreSummary, SnapshotInfo, SnapshotTags,
};
use crate::domain::volume::{SnapshotId, VolumeId};
use crate::infrastructure::backup::staging::{prepare_staging, promote_staging, STAGING_PREFIX};
use crate::infrastructure::command::{CommandOutput, CommandRunner, CommandSpec};

/// restic exit code for "repository does not exist"
const EXIT_NO_REPOSITORY: i32 = 10;

#[derive(Debug, Deserialize)]
struct BackupMessage {
    message_type: String,
    #[serde(default)]
    snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResticSnapshot {
    id: String,
    time: DateTime<Utc>,
    #[serde(default)]
    paths: Vec<PathBuf>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl From<ResticSnapshot> for SnapshotInfo {
    fn from(s: ResticSnapshot) -> Self {
        SnapshotInfo {
            id: SnapshotId(s.id),
            time: s.time,
            paths: s.paths,
            tags: s.tags.unwrap_or_default(),
        }
    }
}

pub struct ResticBackupTool {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    repository_url: String,
    timeout: Duration,
    initialized: Mutex<HashSet<VolumeId>>,
}

impl ResticBackupTool {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<PathBuf>,
        proxy_addr: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            repository_url: format!("rest:http://{}/", proxy_addr),
            timeout,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    pub fn repository_url(&self) -> &str {
        &self.repository_url
    }

    fn command(&self, repo: &RepositoryAccess) -> CommandSpec {
        CommandSpec::new(self.binary.display().to_string())
            .env("RESTIC_REPOSITORY", &self.repository_url)
            .env("RESTIC_PASSWORD", &repo.password)
            .timeout(self.timeout)
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, BackupError> {
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(BackupError::ToolFailed {
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Initialise the repository the first time this volume is backed up
    async fn ensure_repository(&self, repo: &RepositoryAccess) -> Result<(), BackupError> {
        if self.initialized.lock().contains(&repo.volume_id) {
            return Ok(());
        }
        let out = self
            .runner
            .run(&self.command(repo).args(["cat", "config"]))
            .await?;
        if !out.success() {
            if out.code != EXIT_NO_REPOSITORY {
                return Err(BackupError::ToolFailed {
                    code: out.code,
                    stderr: out.stderr.trim().to_string(),
                });
            }
            info!(volume_id = %repo.volume_id, "Initialising backup repository");
            self.run(self.command(repo).arg("init")).await?;
        }
        self.initialized.lock().insert(repo.volume_id.clone());
        Ok(())
    }

    async fn find_snapshot(
        &self,
        repo: &RepositoryAccess,
        snapshot: &SnapshotId,
    ) -> Result<SnapshotInfo, BackupError> {
        let out = self
            .runner
            .run(
                &self
                    .command(repo)
                    .args(["snapshots", "--json"])
                    .arg(snapshot.as_str()),
            )
            .await?;
        if !out.success() {
            if out.stderr.contains("no matching ID") || out.stderr.contains("not found") {
                return Err(BackupError::SnapshotNotFound(snapshot.clone()));
            }
            return Err(BackupError::ToolFailed {
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        parse_snapshots(&out.stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::SnapshotNotFound(snapshot.clone()))
    }
}

fn parse_snapshots(stdout: &str) -> Result<Vec<SnapshotInfo>, BackupError> {
    let snapshots: Vec<ResticSnapshot> =
        serde_json::from_str(stdout.trim()).map_err(|e| BackupError::Parse(e.to_string()))?;
    Ok(snapshots.into_iter().map(Into::into).collect())
}

/// Snapshot id from the summary line of `restic backup --json`
fn parse_backup_summary(stdout: &str) -> Result<SnapshotId, BackupError> {
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<BackupMessage>(line).ok())
        .find(|m| m.message_type == "summary")
        .and_then(|m| m.snapshot_id)
        .map(SnapshotId)
        .ok_or_else(|| BackupError::Parse("backup output has no summary".to_string()))
}

#[async_trait]
impl BackupTool for ResticBackupTool {
    async fn snapshot(
        &self,
        repo: &RepositoryAccess,
        source: &Path,
        tags: &SnapshotTags,
    ) -> Result<SnapshotId, BackupError> {
        self.ensure_repository(repo).await?;

        let mut spec = self
            .command(repo)
            .args(["backup", "--json", "--exclude"])
            .arg(format!("{}*", STAGING_PREFIX));
        for tag in tags.to_tags() {
            spec = spec.arg("--tag").arg(tag);
        }
        let spec = spec.arg(".").current_dir(source);

        let out = self.run(spec).await?;
        let id = parse_backup_summary(&out.stdout)?;
        info!(volume_id = %repo.volume_id, snapshot_id = %id, "Backup snapshot created");
        Ok(id)
    }

    async fn restore(
        &self,
        repo: &RepositoryAccess,
        snapshot: &SnapshotId,
        target: &Path,
        delete_after: bool,
    ) -> Result<RestoreSummary, BackupError> {
        let info = self.find_snapshot(repo, snapshot).await?;
        let source = info
            .paths
            .first()
            .ok_or_else(|| BackupError::Parse(format!("snapshot {} has no paths", snapshot)))?;

        let staging = prepare_staging(target, snapshot).await?;
        self.run(
            self.command(repo)
                .arg("restore")
                .arg(format!("{}:{}", snapshot, source.display()))
                .arg("--target")
                .arg(staging.display().to_string()),
        )
        .await?;

        let summary = promote_staging(&staging, target, delete_after).await?;
        debug!(
            snapshot_id = %snapshot,
            restored = summary.entries_restored,
            skipped = summary.entries_skipped,
            "Restored snapshot"
        );
        Ok(summary)
    }

    async fn forget(&self, repo: &RepositoryAccess, snapshot: &SnapshotId) -> Result<(), BackupError> {
        self.run(self.command(repo).arg("forget").arg(snapshot.as_str()))
            .await?;
        Ok(())
    }

    async fn list_snapshots(&self, repo: &RepositoryAccess) -> Result<Vec<SnapshotInfo>, BackupError> {
        let out = self.run(self.command(repo).args(["snapshots", "--json"])).await?;
        parse_snapshots(&out.stdout)
    }

    async fn unlock(&self, repo: &RepositoryAccess) -> Result<(), BackupError> {
        self.run(self.command(repo).arg("unlock")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::MountId;
    use crate::infrastructure::command::ScriptedCommandRunner;

    fn repo() -> RepositoryAccess {
        RepositoryAccess {
            volume_id: VolumeId::new("v1").unwrap(),
            password: "pw".to_string(),
        }
    }

    fn tool(runner: &ScriptedCommandRunner) -> ResticBackupTool {
        ResticBackupTool::new(
            Arc::new(runner.clone()),
            "restic",
            "127.0.0.1:8999",
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_snapshot_initialises_then_tags() {
        let runner = ScriptedCommandRunner::new();
        runner.respond(
            "restic cat config",
            CommandOutput::failed(EXIT_NO_REPOSITORY, "Is there a repository at the following location?"),
        );
        runner.respond(
            "restic backup",
            CommandOutput::ok(
                "{\"message_type\":\"status\",\"percent_done\":0.5}\n\
                 {\"message_type\":\"summary\",\"snapshot_id\":\"deadbeef\"}\n",
            ),
        );
        let tool = tool(&runner);
        let tags = SnapshotTags {
            volume_id: VolumeId::new("v1").unwrap(),
            mount_id: Some(MountId("m1".to_string())),
        };

        let id = tool.snapshot(&repo(), Path::new("/vol/view"), &tags).await.unwrap();
        assert_eq!(id.as_str(), "deadbeef");
        tool.snapshot(&repo(), Path::new("/vol/view"), &tags).await.unwrap();

        let calls = runner.calls();
        let lines: Vec<_> = calls.iter().map(CommandSpec::display).collect();
        assert_eq!(lines[0], "restic cat config");
        assert_eq!(lines[1], "restic init");
        assert_eq!(
            lines[2],
            "restic backup --json --exclude .boxvol-restore-* --tag volume=v1 --tag mount=m1 ."
        );
        // repository checked once per volume
        assert_eq!(lines.len(), 4);

        let backup = &calls[2];
        assert_eq!(backup.current_dir.as_deref(), Some(Path::new("/vol/view")));
        assert!(backup
            .env
            .contains(&("RESTIC_REPOSITORY".to_string(), "rest:http://127.0.0.1:8999/".to_string())));
        assert!(backup.env.contains(&("RESTIC_PASSWORD".to_string(), "pw".to_string())));
    }

    #[tokio::test]
    async fn test_failed_backup_is_reported() {
        let runner = ScriptedCommandRunner::new();
        runner.respond("restic backup", CommandOutput::failed(3, "incomplete snapshot"));
        let tags = SnapshotTags {
            volume_id: VolumeId::new("v1").unwrap(),
            mount_id: None,
        };
        let err = tool(&runner)
            .snapshot(&repo(), Path::new("/vol"), &tags)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ToolFailed { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_restore_uses_snapshot_source_path() {
        let target = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond(
            "restic snapshots --json abc",
            CommandOutput::ok(
                r#"[{"id":"abc","time":"2026-01-02T03:04:05Z","paths":["/var/lib/boxvol/v1/backup-view"],"tags":["volume=v1"]}]"#,
            ),
        );
        let summary = tool(&runner)
            .restore(&repo(), &SnapshotId("abc".to_string()), target.path(), true)
            .await
            .unwrap();
        assert!(summary.staging_purged);

        let lines = runner.command_lines();
        assert!(lines[1].starts_with("restic restore abc:/var/lib/boxvol/v1/backup-view --target "));
        assert!(lines[1].ends_with(".boxvol-restore-abc"));
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot() {
        let target = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond("restic snapshots", CommandOutput::ok("[]"));
        let err = tool(&runner)
            .restore(&repo(), &SnapshotId("gone".to_string()), target.path(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::SnapshotNotFound(_)));
    }

    #[test]
    fn test_parse_snapshots_null_tags() {
        let parsed =
            parse_snapshots(r#"[{"id":"a","time":"2026-01-02T03:04:05.123456789+01:00","paths":["/x"],"tags":null}]"#)
                .unwrap();
        assert_eq!(parsed[0].id.as_str(), "a");
        assert!(parsed[0].tags.is_empty());
    }
}
