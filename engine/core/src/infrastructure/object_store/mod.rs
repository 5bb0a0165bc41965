// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object Store Infrastructure Module
//!
//! Concrete implementations of the ObjectStoreGateway trait.

pub mod http;
pub mod memory;

pub use http::HttpObjectStoreGateway;
pub use memory::InMemoryObjectStoreGateway;
