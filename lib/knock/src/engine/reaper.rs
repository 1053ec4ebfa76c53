// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The reaper: periodic eviction of expired authorizations.
//!
//! The reaper runs on its own [`Periodic`] whose period is the
//! authorization timeout. On each tick it goes `Idle -> Sweeping ->
//! Idle`, removing every entry whose age has reached the timeout. An
//! entry is therefore never removed before `inserted_at + timeout`,
//! and never outlives `inserted_at + 2 * timeout` by more than the
//! time it takes to run a sweep.

use super::stat::GateStats;
use super::state_table::StateEntry;
use super::state_table::StateTable;
use super::state_table::Ttl;
use crate::ddi::time::Interval;
use crate::ddi::time::Moment;
use crate::ddi::time::Periodic;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering;
use core::time::Duration;
use knock_api::KnockError;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::sync::Arc;

pub const REAPER_NAME: &str = "knock-reaper";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReaperState {
    Idle = 0,
    Sweeping = 1,
}

#[derive(Debug)]
struct ReaperShared {
    state: AtomicU8,
}

impl ReaperShared {
    fn set(&self, state: ReaperState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> ReaperState {
        match self.state.load(Ordering::Acquire) {
            0 => ReaperState::Idle,
            _ => ReaperState::Sweeping,
        }
    }
}

/// Everything a single sweep needs. Owned by the reaper's periodic.
pub struct ReaperCtx {
    table: Arc<StateTable>,
    ttl: Ttl,
    stats: Arc<GateStats>,
    shared: Arc<ReaperShared>,
    log: Logger,
}

impl ReaperCtx {
    pub fn new(
        table: Arc<StateTable>,
        ttl: Ttl,
        stats: Arc<GateStats>,
        log: Logger,
    ) -> Self {
        let state = AtomicU8::new(ReaperState::Idle as u8);
        let shared = Arc::new(ReaperShared { state });
        Self { table, ttl, stats, shared, log }
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Run one sweep as of `now`, returning the evicted entries.
    pub fn sweep(&mut self, now: Moment) -> Vec<StateEntry> {
        self.shared.set(ReaperState::Sweeping);
        let expired = self.table.expire(now, self.ttl);
        self.stats.sweeps.incr();
        self.stats.expired.add(expired.len() as u64);
        self.shared.set(ReaperState::Idle);

        // The table locks are all released by now.
        for entry in &expired {
            debug!(self.log, "authorization expired";
                "key" => %entry,
                "age_ms" => now.delta_as_millis(entry.inserted_at()),
            );
        }

        expired
    }
}

fn reap(ctx: &mut ReaperCtx) {
    ctx.sweep(Moment::now());
}

/// A running reaper.
#[derive(Debug)]
pub struct Reaper {
    periodic: Periodic,
    shared: Arc<ReaperShared>,
}

impl Reaper {
    /// Start sweeping `table` every `ttl`.
    ///
    /// # Errors
    ///
    /// A zero `ttl` is refused with [`KnockError::BadConfig`]. Failure
    /// to spawn the reaper thread is [`KnockError::TaskStart`].
    pub fn start(
        table: Arc<StateTable>,
        ttl: Ttl,
        stats: Arc<GateStats>,
        log: &Logger,
    ) -> Result<Self, KnockError> {
        let interval = Interval::from_millis(ttl.as_milliseconds())?;
        let log = log.new(o!("component" => "reaper"));
        let ctx = ReaperCtx::new(table, ttl, stats, log.clone());
        let shared = ctx.shared.clone();
        let periodic =
            Periodic::new(REAPER_NAME, reap, Box::new(ctx), interval)?;

        info!(log, "reaper started"; "period_ms" => ttl.as_milliseconds());
        Ok(Self { periodic, shared })
    }

    pub fn state(&self) -> ReaperState {
        self.shared.get()
    }

    pub fn interval(&self) -> Interval {
        self.periodic.interval()
    }

    /// Stop the reaper. A sweep already in progress is allowed up to
    /// `grace` to finish.
    pub fn stop(self, grace: Duration) -> Result<(), KnockError> {
        self.periodic.cancel(grace)
    }
}
