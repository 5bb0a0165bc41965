// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Value Objects
// ============================================================================

/// Registry identifier of a volume (e.g. `vol_2f9c...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Result<Self, VolumeError> {
        let id = id.into();
        validate_token("volume id", &id, MAX_VOLUME_ID_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease token issued by the registry when a volume goes from unleased to leased
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountId(pub String);

impl MountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed backup point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag of one local block image: `<volume id>-<8 hex chars>`
///
/// A volume directory gets a fresh image id on every `Create`, so two images
/// of the same volume on one host never share a volume group name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn generate(volume_id: &VolumeId) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", volume_id, &suffix[..8]))
    }

    pub fn parse(s: &str) -> Result<Self, VolumeError> {
        let s = s.trim();
        validate_token("image id", s, MAX_IMAGE_ID_LEN)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const MAX_VOLUME_ID_LEN: usize = 96;

/// `-` plus eight hex characters
const IMAGE_SUFFIX_LEN: usize = 9;

/// Every id `ImageId::generate` can produce parses back
pub const MAX_IMAGE_ID_LEN: usize = MAX_VOLUME_ID_LEN + IMAGE_SUFFIX_LEN;

/// Identifiers end up in LVM names, tags and file paths, so keep them to a
/// conservative character set.
fn validate_token(what: &str, s: &str, max_len: usize) -> Result<(), VolumeError> {
    if s.is_empty() || s.len() > max_len {
        return Err(VolumeError::InvalidIdentifier(format!(
            "{} must be 1..={} characters, got {:?}",
            what, max_len, s
        )));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(VolumeError::InvalidIdentifier(format!(
            "{} {:?} contains characters outside [A-Za-z0-9._-]",
            what, s
        )));
    }
    Ok(())
}

/// Filesystem placed on the logical volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    #[default]
    Ext4,
    Xfs,
}

impl FilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        }
    }

    /// mkfs program for this filesystem
    pub fn mkfs_program(&self) -> &'static str {
        match self {
            Self::Ext4 => "mkfs.ext4",
            Self::Xfs => "mkfs.xfs",
        }
    }

    /// Extra options needed to mount a COW snapshot of a mounted filesystem
    /// next to the original.
    pub fn snapshot_mount_options(&self) -> &'static str {
        match self {
            Self::Ext4 => "ro,noload",
            Self::Xfs => "ro,nouuid,norecovery",
        }
    }
}

impl std::str::FromStr for FilesystemType {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(Self::Ext4),
            "xfs" => Ok(Self::Xfs),
            other => Err(VolumeError::UnsupportedFilesystem(other.to_string())),
        }
    }
}

impl std::fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Remote Volume Snapshot
// ============================================================================

/// Volume as reported by the registry
///
/// Every registry call returns the current record alongside lease state. The
/// engine never mutates it except through lease operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,

    pub uuid: Uuid,

    /// Declared filesystem quota in bytes
    pub size_bytes: u64,

    #[serde(default)]
    pub fs_type: FilesystemType,

    /// Password of the encrypted backup repository
    #[serde(default)]
    pub backup_password: String,

    /// Current lease holder, if any
    #[serde(default)]
    pub mount_id: Option<MountId>,

    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub latest_snapshot_id: Option<SnapshotId>,
}

impl VolumeRecord {
    /// Check the record for values the block layer cannot act on
    pub fn validate(&self) -> Result<(), VolumeError> {
        if self.size_bytes == 0 {
            return Err(VolumeError::InvalidSizeLimit(
                "declared filesystem size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the lease recorded on this snapshot is still within its window
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.mount_id, self.lease_expires_at) {
            (Some(_), Some(expires)) => now < expires,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Image sizing derived from a volume's declared quota
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image_id: ImageId,
    pub volume_id: VolumeId,
    pub fs_type: FilesystemType,
    /// Size of the sparse backing file (volume group capacity)
    pub image_bytes: u64,
    /// Size of the data logical volume (filesystem size)
    pub filesystem_bytes: u64,
}

pub const MIB: u64 = 1024 * 1024;

/// Default image capacity relative to the declared quota. The space beyond
/// the data LV holds copy-on-write snapshots taken for backups.
pub const DEFAULT_SIZE_MULTIPLIER: f64 = 2.0;

impl ImageSpec {
    pub fn for_volume(
        record: &VolumeRecord,
        image_id: ImageId,
        size_multiplier: f64,
    ) -> Result<Self, VolumeError> {
        record.validate()?;
        if !(size_multiplier.is_finite() && size_multiplier >= 1.0) {
            return Err(VolumeError::InvalidSizeLimit(format!(
                "size multiplier must be >= 1.0, got {}",
                size_multiplier
            )));
        }

        let filesystem_bytes = round_up_mib(record.size_bytes);
        let image_bytes = round_up_mib((filesystem_bytes as f64 * size_multiplier).ceil() as u64)
            // LVM metadata lives at the start of the PV
            + 4 * MIB;

        Ok(Self {
            image_id,
            volume_id: record.id.clone(),
            fs_type: record.fs_type,
            image_bytes,
            filesystem_bytes,
        })
    }
}

fn round_up_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB) * MIB
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid size limit: {0}")]
    InvalidSizeLimit(String),

    #[error("Unsupported filesystem type: {0}")]
    UnsupportedFilesystem(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(size_bytes: u64) -> VolumeRecord {
        VolumeRecord {
            id: VolumeId::new("v1").unwrap(),
            uuid: Uuid::new_v4(),
            size_bytes,
            fs_type: FilesystemType::Ext4,
            backup_password: "pw".to_string(),
            mount_id: None,
            lease_expires_at: None,
            latest_snapshot_id: None,
        }
    }

    #[test]
    fn test_volume_id_validation() {
        assert!(VolumeId::new("vol_01-a.b").is_ok());
        assert!(VolumeId::new("").is_err());
        assert!(VolumeId::new("has space").is_err());
        assert!(VolumeId::new("../etc").is_err());
    }

    #[test]
    fn test_image_id_is_prefixed_and_unique() {
        let volume = VolumeId::new("v1").unwrap();
        let a = ImageId::generate(&volume);
        let b = ImageId::generate(&volume);
        assert!(a.as_str().starts_with("v1-"));
        assert_eq!(a.as_str().len(), "v1-".len() + 8);
        assert_ne!(a, b);
        assert_eq!(ImageId::parse(&format!("{}\n", a)).unwrap(), a);
    }

    #[test]
    fn test_longest_volume_id_yields_parseable_image_id() {
        let volume = VolumeId::new("a".repeat(MAX_VOLUME_ID_LEN)).unwrap();
        assert!(VolumeId::new("a".repeat(MAX_VOLUME_ID_LEN + 1)).is_err());

        let image = ImageId::generate(&volume);
        assert_eq!(image.as_str().len(), MAX_IMAGE_ID_LEN);
        assert_eq!(ImageId::parse(image.as_str()).unwrap(), image);
        assert!(ImageId::parse(&"a".repeat(MAX_IMAGE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_image_spec_doubles_one_gib_quota() {
        let rec = record(1024 * MIB);
        let spec = ImageSpec::for_volume(&rec, ImageId::generate(&rec.id), DEFAULT_SIZE_MULTIPLIER)
            .unwrap();
        assert_eq!(spec.filesystem_bytes, 1024 * MIB);
        assert_eq!(spec.image_bytes, 2048 * MIB + 4 * MIB);
    }

    #[test]
    fn test_image_spec_rounds_to_mib() {
        let rec = record(MIB + 1);
        let spec = ImageSpec::for_volume(&rec, ImageId::generate(&rec.id), 2.0).unwrap();
        assert_eq!(spec.filesystem_bytes, 2 * MIB);
        assert_eq!(spec.image_bytes, 4 * MIB + 4 * MIB);
    }

    #[test]
    fn test_image_spec_rejects_zero_size_and_bad_multiplier() {
        let zero = record(0);
        assert!(ImageSpec::for_volume(&zero, ImageId::generate(&zero.id), 2.0).is_err());
        let rec = record(MIB);
        assert!(ImageSpec::for_volume(&rec, ImageId::generate(&rec.id), 0.5).is_err());
        assert!(ImageSpec::for_volume(&rec, ImageId::generate(&rec.id), f64::NAN).is_err());
    }

    #[test]
    fn test_filesystem_type_parse() {
        assert_eq!("EXT4".parse::<FilesystemType>().unwrap(), FilesystemType::Ext4);
        assert_eq!("xfs".parse::<FilesystemType>().unwrap(), FilesystemType::Xfs);
        assert!("btrfs".parse::<FilesystemType>().is_err());
    }

    #[test]
    fn test_lease_window() {
        let now = Utc::now();
        let mut rec = record(MIB);
        assert!(!rec.is_leased_at(now));
        rec.mount_id = Some(MountId("m1".to_string()));
        rec.lease_expires_at = Some(now + Duration::seconds(30));
        assert!(rec.is_leased_at(now));
        assert!(!rec.is_leased_at(now + Duration::seconds(31)));
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let json = r#"{"id":"v1","uuid":"123e4567-e89b-12d3-a456-426614174000","size_bytes":1048576}"#;
        let rec: VolumeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.fs_type, FilesystemType::Ext4);
        assert!(rec.mount_id.is_none());
        assert!(rec.latest_snapshot_id.is_none());
    }
}
