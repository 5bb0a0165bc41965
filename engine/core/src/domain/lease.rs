// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount lease state machine
//!
//! Lease state and filesystem write-mode are coupled: once a release is
//! requested nothing may write, and once the lease is released the next
//! claimant owns the volume. Each client operation is checked against the
//! current state instead of relying on call-order discipline.
//!
//! ```text
//! Unprovisioned -create-> Created -open-> Opened -refresh-> Serving
//!                                            \               |
//!                                             \--begin_release--> ReleasePending
//!                                                                   |
//!                                    Released <-------release-------/
//!                                        |
//!                                    Destroyed
//! Serving/ReleasePending --lease rejected--> Failed --open--> Opened
//! Created/Opened/Serving/ReleasePending --detach--> Created (lease kept)
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountState {
    /// No local state in the volume directory
    Unprovisioned,
    /// Local state and image exist; image not mounted by this instance
    Created,
    /// Image attached and mounted writable, reference marker in place
    Opened,
    /// Lease refreshed at least once while opened; writes are allowed
    Serving,
    /// Filesystem remounted read-only, waiting for final backup and release
    ReleasePending,
    /// Lease handed back to the registry
    Released,
    /// Unmounted, deactivated and directory removed
    Destroyed,
    /// Lease rejected while serving; ownership claim is void
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOperation {
    Create,
    Open,
    Refresh,
    Restore,
    Backup,
    BeginRelease,
    Release,
    Detach,
    Teardown,
}

impl std::fmt::Display for MountOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Open => "open",
            Self::Refresh => "refresh",
            Self::Restore => "restore",
            Self::Backup => "backup",
            Self::BeginRelease => "begin-release",
            Self::Release => "release",
            Self::Detach => "detach",
            Self::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

impl MountState {
    /// Whether `op` may run in this state
    pub fn permits(&self, op: MountOperation) -> bool {
        use MountOperation as Op;
        use MountState as S;
        matches!(
            (self, op),
            (S::Unprovisioned, Op::Create)
                | (S::Created | S::Failed, Op::Open)
                | (S::Opened | S::Serving, Op::Refresh)
                | (S::Opened | S::Serving, Op::Restore)
                | (S::Serving | S::ReleasePending, Op::Backup)
                | (S::Opened | S::Serving, Op::BeginRelease)
                | (S::ReleasePending, Op::Release)
                | (S::Created | S::Opened | S::Serving | S::ReleasePending, Op::Detach)
                | (S::Released | S::Failed, Op::Teardown)
        )
    }

    /// Whether the filesystem may be written in this state
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Opened | Self::Serving)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What to do when every final backup attempt fails during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReleasePolicy {
    /// Keep the lease and the volume directory so a restart can retry the
    /// backup; the lease lapses at the registry if nobody comes back.
    #[default]
    RequireBackup,
    /// Release anyway, losing writes since the last good snapshot
    BestEffort,
}
