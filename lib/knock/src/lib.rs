// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! knock: a single-packet authorization gate.
//!
//! New inbound connections to a protected port are dropped unless
//! their source has recently been authorized by a trigger. The pieces:
//!
//! * [`engine::state_table::StateTable`]: the authorizations.
//! * [`engine::gate::PacketGate`]: the per-packet decision.
//! * [`engine::reaper::Reaper`]: evicts authorizations once they
//!   time out.
//! * [`engine::trigger::TriggerListener`]: turns validated triggers
//!   into authorizations.
//! * [`ctx::KnockCtx`]: owns all of the above and runs the lifecycle.
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub use knock_api as api;

pub mod ctx;
pub mod ddi;
pub mod engine;
#[cfg(feature = "std")]
pub mod print;
pub mod provider;

pub use ctx::KnockCtx;
pub use ctx::StopReport;
