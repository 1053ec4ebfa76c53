// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The gate engine: the state table and everything that reads or
//! writes it.
pub mod gate;
pub mod headers;
pub mod reaper;
pub mod stat;
pub mod state_table;
pub mod trigger;
