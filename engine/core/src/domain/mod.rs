// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer
//!
//! Volume identities, the mount lease state machine, and the anti-corruption
//! traits (registry, block images, backup tool, object store) that the
//! application layer is written against.

pub mod backup;
pub mod engine_config;
pub mod events;
pub mod image;
pub mod lease;
pub mod local_state;
pub mod object_store;
pub mod registry;
pub mod volume;
