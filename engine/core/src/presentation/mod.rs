// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer
//!
//! HTTP surface that translates backup-tool requests into application
//! service calls. No engine logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`proxy_api`] | HTTP (Axum) | Repository REST layout served from presigned URLs |

pub mod proxy_api;
