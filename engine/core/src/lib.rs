// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! boxvol core
//!
//! Volume lifecycle, lease and backup engine: exclusive mount leases against
//! a remote volume registry, loop-backed LVM images, restic snapshots through
//! a credential-free object-store proxy, and an orphan scanner that reclaims
//! images left behind by dead mount namespaces.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Layout:** `domain` (types and traits), `application` (engine
//!   services), `infrastructure` (system, HTTP and in-memory adapters),
//!   `presentation` (proxy HTTP surface)

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
