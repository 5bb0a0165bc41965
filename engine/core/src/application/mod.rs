// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application layer
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`mount_lease`] | Per-volume lease state machine over registry, block image and backup tool |
//! | [`scheduler`] | Refresh and backup timers for a serving volume |
//! | [`orphan_scanner`] | Reclaims images no live mount namespace refers to |
//! | [`object_store_proxy`] | Presigned-URL object access with a cached listing |

pub mod mount_lease;
pub mod object_store_proxy;
pub mod orphan_scanner;
pub mod scheduler;

pub use mount_lease::{
    EngineServices, MountError, MountLeaseClient, ShutdownOptions, ShutdownReport, VolumeBinding,
};
pub use object_store_proxy::{ListedObject, ListingCache, ObjectStoreProxy};
pub use orphan_scanner::{OrphanScanner, ScanReport};
pub use scheduler::{LifecycleScheduler, ScheduleStats};
