// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backup Infrastructure Module
//!
//! Concrete implementations of the BackupTool trait.

pub mod memory;
pub mod restic;
pub mod staging;

pub use memory::InMemoryBackupTool;
pub use restic::ResticBackupTool;
