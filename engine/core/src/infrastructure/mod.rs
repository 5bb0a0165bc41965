// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod backup;
pub mod block;
pub mod command;
pub mod event_bus;
pub mod markers;
pub mod namespace;
pub mod object_store;
pub mod procfs;
pub mod registry;
pub mod state_store;
pub mod telemetry;
