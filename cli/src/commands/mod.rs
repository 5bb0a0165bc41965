// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the boxvol CLI

pub mod config;
pub mod proxy;
pub mod scan;
pub mod volume;

pub use self::config::ConfigCommand;
pub use self::proxy::ProxyCommand;
pub use self::scan::ScanCommand;
pub use self::volume::VolumeCommand;
