// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume Registry Infrastructure Module
//!
//! Concrete implementations of the VolumeRegistry trait.

pub mod http;
pub mod memory;

pub use http::HttpVolumeRegistry;
pub use memory::InMemoryVolumeRegistry;
