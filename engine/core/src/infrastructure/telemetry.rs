// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Engine metrics
//!
//! Thin recording helpers over the `metrics` facade. Nothing is exported
//! unless the binary installs a recorder.

pub const LEASE_REFRESH_TOTAL: &str = "boxvol_lease_refresh_total";
pub const BACKUP_TOTAL: &str = "boxvol_backup_total";
pub const BACKUP_FAILURES_TOTAL: &str = "boxvol_backup_failures_total";
pub const ORPHANS_RECLAIMED_TOTAL: &str = "boxvol_orphans_reclaimed_total";
pub const PROXY_REQUESTS_TOTAL: &str = "boxvol_proxy_requests_total";

/// `outcome` is one of "ok", "reacquired", "rejected", "error"
pub fn record_lease_refresh(outcome: &'static str) {
    metrics::counter!(LEASE_REFRESH_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_backup(final_backup: bool) {
    let kind = if final_backup { "final" } else { "periodic" };
    metrics::counter!(BACKUP_TOTAL, "kind" => kind).increment(1);
}

pub fn record_backup_failure(final_backup: bool) {
    let kind = if final_backup { "final" } else { "periodic" };
    metrics::counter!(BACKUP_FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_orphans_reclaimed(count: usize) {
    metrics::counter!(ORPHANS_RECLAIMED_TOTAL).increment(count as u64);
}

pub fn record_proxy_request(method: &'static str, kind: &'static str, status: u16) {
    metrics::counter!(
        PROXY_REQUESTS_TOTAL,
        "method" => method,
        "type" => kind,
        "status" => status.to_string()
    )
    .increment(1);
}
