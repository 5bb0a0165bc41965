// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Loop device + LVM block images
//!
//! Each image is a sparse backing file in the volume directory, attached to a
//! loop device that is the sole PV of a dedicated volume group
//! `boxvol-<image id>`. The data LV takes the declared quota; the rest of the
//! VG stays free for the copy-on-write snapshot used as the backup view.
//!
//! The VG carries the tags the orphan scanner relies on: `boxvol`,
//! `boxvol.volume=<id>`, `boxvol.image=<id>`, `boxvol.created=<unix secs>`.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::image::{
    BlockError, BlockImage, BlockImageProvider, ImageInfo, ImageListing, DATA_LV, IMAGE_TAG,
    SNAPSHOT_LV, VG_PREFIX,
};
use crate::domain::volume::{FilesystemType, ImageId, ImageSpec, VolumeId};
use crate::infrastructure::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::infrastructure::procfs::ProcFs;

pub const IMAGE_FILE: &str = "image.img";

const TAG_VOLUME: &str = "boxvol.volume=";
const TAG_IMAGE: &str = "boxvol.image=";
const TAG_CREATED: &str = "boxvol.created=";

pub fn vg_name(image_id: &ImageId) -> String {
    format!("{}{}", VG_PREFIX, image_id)
}

async fn run_checked(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
) -> Result<CommandOutput, BlockError> {
    let out = runner.run(&spec).await?;
    if !out.success() {
        return Err(BlockError::CommandFailed {
            command: spec.display(),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out)
}

fn is_missing_vg(err: &BlockError) -> bool {
    matches!(err, BlockError::CommandFailed { stderr, .. } if stderr.contains("not found"))
}

/// Split a Linux `dev_t` into major and minor numbers
fn split_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}

/// Loop devices currently attached to `file`
async fn attached_loops(runner: &dyn CommandRunner, file: &Path) -> Result<Vec<String>, BlockError> {
    let out = run_checked(
        runner,
        CommandSpec::new("losetup").arg("-j").arg(file.display().to_string()),
    )
    .await?;
    Ok(out
        .stdout
        .lines()
        .filter_map(|line| line.split_once(':').map(|(dev, _)| dev.trim().to_string()))
        .filter(|dev| !dev.is_empty())
        .collect())
}

async fn deactivate_vg(runner: &dyn CommandRunner, vg: &str) -> Result<(), BlockError> {
    match run_checked(runner, CommandSpec::new("vgchange").args(["-an", vg])).await {
        Ok(_) => Ok(()),
        Err(e) if is_missing_vg(&e) => {
            debug!(vg, "Volume group already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn detach_loop(runner: &dyn CommandRunner, device: &str) -> Result<(), BlockError> {
    match run_checked(runner, CommandSpec::new("losetup").args(["-d", device])).await {
        Ok(_) => Ok(()),
        // already detached by someone else
        Err(BlockError::CommandFailed { stderr, .. })
            if stderr.contains("No such device") || stderr.contains("No such file") =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Refuse to touch an LV that is still mounted in our namespace
fn ensure_not_mounted(procfs: &ProcFs, dev_path: &Path) -> Result<(), BlockError> {
    let meta = match std::fs::metadata(dev_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let (major, minor) = split_dev(meta.rdev());
    if procfs.is_device_mounted(major, minor)? {
        return Err(BlockError::Busy(dev_path.display().to_string()));
    }
    Ok(())
}

pub struct LvmBlockProvider {
    runner: Arc<dyn CommandRunner>,
    procfs: ProcFs,
}

impl LvmBlockProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, procfs: ProcFs) -> Self {
        Self { runner, procfs }
    }

    fn image(&self, image_id: ImageId, file: PathBuf) -> LvmImage {
        LvmImage {
            runner: self.runner.clone(),
            procfs: self.procfs.clone(),
            vg: vg_name(&image_id),
            image_id,
            file,
        }
    }

    async fn provision(
        &self,
        spec: &ImageSpec,
        vg: &str,
        loop_dev: &str,
    ) -> Result<(), BlockError> {
        let runner = self.runner.as_ref();
        run_checked(runner, CommandSpec::new("pvcreate").args(["-qq", loop_dev])).await?;

        let created = Utc::now().timestamp();
        run_checked(
            runner,
            CommandSpec::new("vgcreate")
                .args(["-qq", "--addtag", IMAGE_TAG])
                .arg("--addtag")
                .arg(format!("{}{}", TAG_VOLUME, spec.volume_id))
                .arg("--addtag")
                .arg(format!("{}{}", TAG_IMAGE, spec.image_id))
                .arg("--addtag")
                .arg(format!("{}{}", TAG_CREATED, created))
                .args([vg, loop_dev]),
        )
        .await?;

        run_checked(
            runner,
            CommandSpec::new("lvcreate")
                .args(["-qq", "-y", "--wipesignatures", "y", "-L"])
                .arg(format!("{}B", spec.filesystem_bytes))
                .args(["-n", DATA_LV, vg]),
        )
        .await?;

        let dev = format!("/dev/{}/{}", vg, DATA_LV);
        let force = match spec.fs_type {
            FilesystemType::Ext4 => "-F",
            FilesystemType::Xfs => "-f",
        };
        run_checked(
            runner,
            CommandSpec::new(spec.fs_type.mkfs_program()).args(["-q", force, dev.as_str()]),
        )
        .await?;
        Ok(())
    }

    async fn undo_create(&self, vg: &str, file: &Path) {
        let runner = self.runner.as_ref();
        if let Err(e) = deactivate_vg(runner, vg).await {
            warn!(vg, error = %e, "Failed to deactivate partially created volume group");
        }
        match attached_loops(runner, file).await {
            Ok(loops) => {
                for dev in loops {
                    if let Err(e) = detach_loop(runner, &dev).await {
                        warn!(device = %dev, error = %e, "Failed to detach loop device");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list loop devices"),
        }
        if let Err(e) = tokio::fs::remove_file(file).await {
            warn!(file = %file.display(), error = %e, "Failed to remove backing file");
        }
    }
}

#[async_trait]
impl BlockImageProvider for LvmBlockProvider {
    async fn create(&self, dir: &Path, spec: &ImageSpec) -> Result<Arc<dyn BlockImage>, BlockError> {
        tokio::fs::create_dir_all(dir).await?;
        let file = dir.join(IMAGE_FILE);
        let vg = vg_name(&spec.image_id);

        // create_new: an existing backing file means a previous attempt is
        // still around and must be cleaned up by deactivate, not reused.
        let backing = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file)
            .await?;
        backing.set_len(spec.image_bytes).await?;
        drop(backing);

        let loop_dev = match run_checked(
            self.runner.as_ref(),
            CommandSpec::new("losetup")
                .args(["--find", "--show"])
                .arg(file.display().to_string()),
        )
        .await
        {
            Ok(out) => out.stdout.trim().to_string(),
            Err(e) => {
                if let Err(err) = tokio::fs::remove_file(&file).await {
                    warn!(file = %file.display(), error = %err, "Failed to remove backing file");
                }
                return Err(e);
            }
        };
        if loop_dev.is_empty() {
            self.undo_create(&vg, &file).await;
            return Err(BlockError::Parse("losetup returned no device".to_string()));
        }

        if let Err(e) = self.provision(spec, &vg, &loop_dev).await {
            self.undo_create(&vg, &file).await;
            return Err(e);
        }

        info!(
            image_id = %spec.image_id,
            volume_id = %spec.volume_id,
            loop_device = %loop_dev,
            image_bytes = spec.image_bytes,
            filesystem_bytes = spec.filesystem_bytes,
            "Created block image"
        );
        Ok(Arc::new(self.image(spec.image_id.clone(), file)))
    }

    async fn open(&self, dir: &Path, image_id: &ImageId) -> Result<Arc<dyn BlockImage>, BlockError> {
        let file = dir.join(IMAGE_FILE);
        if !tokio::fs::try_exists(&file).await? {
            return Err(BlockError::NotFound(file.display().to_string()));
        }
        let runner = self.runner.as_ref();

        if attached_loops(runner, &file).await?.is_empty() {
            let out = run_checked(
                runner,
                CommandSpec::new("losetup")
                    .args(["--find", "--show"])
                    .arg(file.display().to_string()),
            )
            .await?;
            debug!(loop_device = %out.stdout.trim(), "Attached backing file");
        }

        let vg = vg_name(image_id);
        run_checked(runner, CommandSpec::new("vgchange").args(["-ay", vg.as_str()])).await?;
        debug!(image_id = %image_id, vg = %vg, "Opened block image");
        Ok(Arc::new(self.image(image_id.clone(), file)))
    }

    async fn list_images(&self) -> Result<ImageListing, BlockError> {
        let out = self
            .runner
            .run(&CommandSpec::new("vgs").args([
                "--noheadings",
                "--separator",
                "|",
                "-o",
                "vg_name,vg_tags,pv_name",
            ]).arg(format!("@{}", IMAGE_TAG)))
            .await?;
        if !out.success() {
            if out.stderr.contains("No volume groups found") {
                return Ok(ImageListing::default());
            }
            return Err(BlockError::CommandFailed {
                command: "vgs".to_string(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_vgs(&out.stdout))
    }

    async fn reclaim(&self, image: &ImageInfo) -> Result<(), BlockError> {
        let runner = self.runner.as_ref();
        let dev = PathBuf::from(format!("/dev/{}/{}", image.vg_name, DATA_LV));
        ensure_not_mounted(&self.procfs, &dev)?;

        deactivate_vg(runner, &image.vg_name).await?;
        for device in image.loop_devices.iter().filter(|d| d.starts_with("/dev/loop")) {
            detach_loop(runner, device).await?;
        }
        info!(image_id = %image.image_id, vg = %image.vg_name, "Reclaimed block image");
        Ok(())
    }
}

fn parse_vgs(stdout: &str) -> ImageListing {
    let mut by_vg: BTreeMap<String, ImageInfo> = BTreeMap::new();
    let mut skipped = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split('|').map(str::trim);
        let (Some(vg), Some(tags), pv) = (fields.next(), fields.next(), fields.next()) else {
            warn!(line = %line, "Skipping unexpected vgs line");
            skipped.push(format!("unexpected vgs line: {}", line));
            continue;
        };
        if !vg.starts_with(VG_PREFIX) {
            continue;
        }

        let entry = match by_vg.entry(vg.to_string()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let mut image_id = None;
                let mut volume_id = None;
                let mut created_at = None;
                for tag in tags.split(',') {
                    if let Some(v) = tag.strip_prefix(TAG_IMAGE) {
                        image_id = ImageId::parse(v).ok();
                    } else if let Some(v) = tag.strip_prefix(TAG_VOLUME) {
                        volume_id = VolumeId::new(v).ok();
                    } else if let Some(v) = tag.strip_prefix(TAG_CREATED) {
                        created_at = v
                            .parse::<i64>()
                            .ok()
                            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                    }
                }
                // fall back to the VG name when the image tag is missing
                let parsed = match image_id {
                    Some(id) => Ok(id),
                    None => ImageId::parse(&vg[VG_PREFIX.len()..]),
                };
                let image_id = match parsed {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(vg = %vg, error = %e, "Skipping volume group without a usable image id");
                        skipped.push(format!("volume group {}: {}", vg, e));
                        continue;
                    }
                };
                slot.insert(ImageInfo {
                    image_id,
                    volume_id,
                    vg_name: vg.to_string(),
                    loop_devices: Vec::new(),
                    created_at,
                })
            }
        };
        if let Some(pv) = pv.filter(|p| !p.is_empty()) {
            entry.loop_devices.push(pv.to_string());
        }
    }
    ImageListing {
        images: by_vg.into_values().collect(),
        skipped,
    }
}

pub struct LvmImage {
    runner: Arc<dyn CommandRunner>,
    procfs: ProcFs,
    image_id: ImageId,
    vg: String,
    file: PathBuf,
}

impl LvmImage {
    fn snapshot_path(&self) -> String {
        format!("/dev/{}/{}", self.vg, SNAPSHOT_LV)
    }

    async fn is_mountpoint(&self, dir: &Path) -> Result<bool, BlockError> {
        let out = self
            .runner
            .run(&CommandSpec::new("mountpoint").arg("-q").arg(dir.display().to_string()))
            .await?;
        Ok(out.success())
    }

    async fn fs_type(&self) -> Result<FilesystemType, BlockError> {
        let out = run_checked(
            self.runner.as_ref(),
            CommandSpec::new("blkid")
                .args(["-o", "value", "-s", "TYPE"])
                .arg(self.dev_path().display().to_string()),
        )
        .await?;
        out.stdout
            .trim()
            .parse()
            .map_err(|e: crate::domain::volume::VolumeError| BlockError::Parse(e.to_string()))
    }

    async fn snapshot_exists(&self) -> Result<bool, BlockError> {
        let out = self
            .runner
            .run(&CommandSpec::new("lvs").arg(format!("{}/{}", self.vg, SNAPSHOT_LV)))
            .await?;
        Ok(out.success())
    }
}

#[async_trait]
impl BlockImage for LvmImage {
    fn image_id(&self) -> &ImageId {
        &self.image_id
    }

    fn dev_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.vg, DATA_LV))
    }

    async fn mount(&self, dir: &Path, read_only: bool) -> Result<(), BlockError> {
        tokio::fs::create_dir_all(dir).await?;
        if self.is_mountpoint(dir).await? {
            debug!(dir = %dir.display(), "Already mounted");
            return Ok(());
        }
        let fs = self.fs_type().await?;
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("mount")
                .args(["-t", fs.as_str(), "-o", if read_only { "ro" } else { "rw" }])
                .arg(self.dev_path().display().to_string())
                .arg(dir.display().to_string()),
        )
        .await?;
        debug!(image_id = %self.image_id, dir = %dir.display(), read_only, "Mounted image");
        Ok(())
    }

    async fn unmount(&self, dir: &Path) -> Result<(), BlockError> {
        if !tokio::fs::try_exists(dir).await? || !self.is_mountpoint(dir).await? {
            return Ok(());
        }
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("umount").arg(dir.display().to_string()),
        )
        .await?;
        Ok(())
    }

    async fn remount_read_only(&self, dir: &Path) -> Result<(), BlockError> {
        run_checked(
            self.runner.as_ref(),
            CommandSpec::new("mount")
                .args(["-o", "remount,ro"])
                .arg(dir.display().to_string()),
        )
        .await?;
        Ok(())
    }

    async fn mount_snapshot_view(&self, dir: &Path) -> Result<(), BlockError> {
        // a view left over from an interrupted backup is stale
        self.drop_snapshot_view(dir).await?;

        let runner = self.runner.as_ref();
        run_checked(
            runner,
            CommandSpec::new("lvcreate")
                .args(["-qq", "-s", "-l", "100%FREE", "-n", SNAPSHOT_LV])
                .arg(format!("{}/{}", self.vg, DATA_LV)),
        )
        .await?;

        tokio::fs::create_dir_all(dir).await?;
        let fs = self.fs_type().await?;
        let mounted = run_checked(
            runner,
            CommandSpec::new("mount")
                .args(["-t", fs.as_str(), "-o", fs.snapshot_mount_options()])
                .arg(self.snapshot_path())
                .arg(dir.display().to_string()),
        )
        .await;
        if let Err(e) = mounted {
            if let Err(err) = run_checked(
                runner,
                CommandSpec::new("lvremove").args(["-qq", "-f"]).arg(self.snapshot_path()),
            )
            .await
            {
                warn!(
                    snapshot = %self.snapshot_path(),
                    error = %err,
                    "Failed to remove snapshot LV after failed mount"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn drop_snapshot_view(&self, dir: &Path) -> Result<(), BlockError> {
        self.unmount(dir).await?;
        if self.snapshot_exists().await? {
            run_checked(
                self.runner.as_ref(),
                CommandSpec::new("lvremove").args(["-qq", "-f"]).arg(self.snapshot_path()),
            )
            .await?;
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), BlockError> {
        ensure_not_mounted(&self.procfs, &self.dev_path())?;

        let runner = self.runner.as_ref();
        deactivate_vg(runner, &self.vg).await?;

        if tokio::fs::try_exists(&self.file).await? {
            for dev in attached_loops(runner, &self.file).await? {
                detach_loop(runner, &dev).await?;
            }
        }
        debug!(image_id = %self.image_id, "Deactivated block image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::{VolumeRecord, MIB};
    use crate::infrastructure::command::ScriptedCommandRunner;
    use uuid::Uuid;

    fn spec(volume: &str) -> ImageSpec {
        let record = VolumeRecord {
            id: VolumeId::new(volume).unwrap(),
            uuid: Uuid::new_v4(),
            size_bytes: 64 * MIB,
            fs_type: FilesystemType::Ext4,
            backup_password: String::new(),
            mount_id: None,
            lease_expires_at: None,
            latest_snapshot_id: None,
        };
        ImageSpec::for_volume(&record, ImageId::parse("v1-0011aabb").unwrap(), 2.0).unwrap()
    }

    fn provider(runner: &ScriptedCommandRunner) -> LvmBlockProvider {
        LvmBlockProvider::new(Arc::new(runner.clone()), ProcFs::new("/nonexistent-proc"))
    }

    #[tokio::test]
    async fn test_create_runs_full_stack() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond("losetup --find --show", CommandOutput::ok("/dev/loop7\n"));

        let image = provider(&runner).create(dir.path(), &spec("v1")).await.unwrap();
        assert_eq!(image.dev_path(), PathBuf::from("/dev/boxvol-v1-0011aabb/data"));

        let file = dir.path().join(IMAGE_FILE);
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 132 * MIB);

        let lines = runner.command_lines();
        assert!(lines[0].starts_with("losetup --find --show"));
        assert_eq!(lines[1], "pvcreate -qq /dev/loop7");
        assert!(lines[2].contains("--addtag boxvol --addtag boxvol.volume=v1"));
        assert!(lines[2].contains("--addtag boxvol.image=v1-0011aabb"));
        assert!(lines[2].ends_with("boxvol-v1-0011aabb /dev/loop7"));
        assert!(lines[3].contains(&format!("-L {}B -n data", 64 * MIB)));
        assert_eq!(lines[4], "mkfs.ext4 -q -F /dev/boxvol-v1-0011aabb/data");
    }

    #[tokio::test]
    async fn test_create_refuses_existing_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IMAGE_FILE), b"").unwrap();
        let runner = ScriptedCommandRunner::new();
        assert!(provider(&runner).create(dir.path(), &spec("v1")).await.is_err());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond("losetup --find --show", CommandOutput::ok("/dev/loop7\n"));
        runner.respond("losetup -j", CommandOutput::ok("/dev/loop7: []: (/x/image.img)\n"));
        runner.respond("lvcreate", CommandOutput::failed(5, "Insufficient free space"));

        let err = provider(&runner).create(dir.path(), &spec("v1")).await.err().unwrap();
        assert!(matches!(err, BlockError::CommandFailed { code: 5, .. }));
        assert!(!dir.path().join(IMAGE_FILE).exists());

        let lines = runner.command_lines();
        assert!(lines.contains(&"vgchange -an boxvol-v1-0011aabb".to_string()));
        assert!(lines.contains(&"losetup -d /dev/loop7".to_string()));
    }

    #[tokio::test]
    async fn test_failed_loop_attach_removes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond(
            "losetup --find --show",
            CommandOutput::failed(1, "could not find any free loop device"),
        );

        let err = provider(&runner).create(dir.path(), &spec("v1")).await.err().unwrap();
        assert!(matches!(err, BlockError::CommandFailed { code: 1, .. }));
        assert!(!dir.path().join(IMAGE_FILE).exists());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_mount_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond("blkid", CommandOutput::ok("ext4\n"));
        runner.respond("mount -t", CommandOutput::failed(32, "wrong fs type"));
        let p = provider(&runner);
        let image = p.image(ImageId::parse("v1-0011aabb").unwrap(), dir.path().join(IMAGE_FILE));

        let err = image
            .mount_snapshot_view(&dir.path().join("backup-view"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BlockError::CommandFailed { code: 32, .. }));
        let lines = runner.command_lines();
        assert!(lines[lines.len() - 2].starts_with("mount -t ext4"));
        assert!(lines[lines.len() - 1].starts_with("lvremove -qq -f"));
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IMAGE_FILE), b"").unwrap();
        let runner = ScriptedCommandRunner::new();
        runner.respond(
            "vgchange -an",
            CommandOutput::failed(5, "Volume group \"boxvol-v1-0011aabb\" not found"),
        );
        let p = provider(&runner);
        let image = p.image(ImageId::parse("v1-0011aabb").unwrap(), dir.path().join(IMAGE_FILE));

        image.deactivate().await.unwrap();
        image.deactivate().await.unwrap();
        assert!(!runner.command_lines().iter().any(|l| l.starts_with("losetup -d")));
    }

    #[tokio::test]
    async fn test_open_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedCommandRunner::new();
        let err = provider(&runner)
            .open(dir.path(), &ImageId::parse("v1-0011aabb").unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BlockError::NotFound(_)));
    }

    #[test]
    fn test_parse_vgs_groups_pvs() {
        let out = "  boxvol-v1-aa|boxvol,boxvol.created=1700000000,boxvol.image=v1-aa,boxvol.volume=v1|/dev/loop3\n\
                   \x20 boxvol-v1-aa|boxvol,boxvol.created=1700000000,boxvol.image=v1-aa,boxvol.volume=v1|/dev/loop4\n\
                   \x20 boxvol-untagged|boxvol|/dev/loop9\n";
        let listing = parse_vgs(out);
        assert!(listing.skipped.is_empty());
        let images = listing.images;
        assert_eq!(images.len(), 2);
        let tagged = images.iter().find(|i| i.vg_name == "boxvol-v1-aa").unwrap();
        assert_eq!(tagged.loop_devices, vec!["/dev/loop3", "/dev/loop4"]);
        assert_eq!(tagged.volume_id.as_ref().unwrap().as_str(), "v1");
        assert_eq!(tagged.created_at.unwrap().timestamp(), 1_700_000_000);

        let untagged = images.iter().find(|i| i.vg_name == "boxvol-untagged").unwrap();
        assert_eq!(untagged.image_id.as_str(), "untagged");
        assert!(untagged.created_at.is_none());
    }

    #[test]
    fn test_parse_vgs_skips_bad_entries() {
        let out = "  boxvol-v1-aa|boxvol,boxvol.image=v1-aa|/dev/loop3\n\
                   \x20 garbage-without-separators\n\
                   \x20 boxvol-bad name|boxvol|/dev/loop5\n\
                   \x20 boxvol-v2-bb|boxvol,boxvol.image=v2-bb|/dev/loop6\n";
        let listing = parse_vgs(out);
        let ids: Vec<&str> = listing.images.iter().map(|i| i.image_id.as_str()).collect();
        assert_eq!(ids, vec!["v1-aa", "v2-bb"]);
        assert_eq!(listing.skipped.len(), 2);
        assert!(listing.skipped[0].contains("garbage-without-separators"));
        assert!(listing.skipped[1].contains("boxvol-bad name"));
    }

    #[test]
    fn test_split_dev() {
        // makedev(253, 3) on glibc
        assert_eq!(split_dev((253 << 8) | 3), (253, 3));
        assert_eq!(split_dev((259u64 << 8) | 0x12 | (0x100 << 12)), (259, 0x112));
    }
}
