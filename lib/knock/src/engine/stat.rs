// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Gate statistics.
//!
//! The counters are updated from every packet-processing context at
//! once, so each one is an independent atomic. A snapshot taken while
//! packets are flowing holds uncorrupted individual values, but the
//! values taken as a group may reflect a partially completed update.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use knock_api::GateStatsSnap;

/// A 64-bit counter.
#[derive(Debug, Default)]
pub struct StatU64(AtomicU64);

impl StatU64 {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct GateStats {
    pub accept_authorized: StatU64,
    pub accept_passthrough: StatU64,
    pub accept_established: StatU64,
    pub drop_unauthorized: StatU64,
    pub drop_malformed: StatU64,
    pub authorized: StatU64,
    pub auth_rejected: StatU64,
    pub expired: StatU64,
    pub sweeps: StatU64,
}

impl GateStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    pub fn snapshot(&self) -> GateStatsSnap {
        GateStatsSnap {
            accept_authorized: self.accept_authorized.val(),
            accept_passthrough: self.accept_passthrough.val(),
            accept_established: self.accept_established.val(),
            drop_unauthorized: self.drop_unauthorized.val(),
            drop_malformed: self.drop_malformed.val(),
            authorized: self.authorized.val(),
            auth_rejected: self.auth_rejected.val(),
            expired: self.expired.val(),
            sweeps: self.sweeps.val(),
        }
    }
}
