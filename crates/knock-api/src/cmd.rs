// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use super::ip::IpAddr;
use super::ip::PortSel;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum KnockError {
    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("hook registration failed: {0}")]
    Hook(String),

    #[error("max capacity reached: {0}")]
    MaxCapacity(u64),

    #[error("too many protected ports: {count} exceeds limit of {max}")]
    MaxPorts { count: usize, max: usize },

    #[error("{task} did not stop within {grace_ms}ms")]
    StopTimeout { task: String, grace_ms: u64 },

    #[error("failed to start {task}: {msg}")]
    TaskStart { task: String, msg: String },

    #[error("trigger source: {0}")]
    Trigger(String),
}

/// A dump of a single authorization entry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateEntryDump {
    pub addr: IpAddr,
    pub port: PortSel,
    /// Milliseconds since the authorization was inserted (or last
    /// refreshed).
    pub age_ms: u64,
}

/// A dump of the authorization state table.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpStateResp {
    pub timeout_ms: u64,
    pub limit: u32,
    pub entries: Vec<StateEntryDump>,
}

/// A point-in-time copy of the gate counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GateStatsSnap {
    /// New connections to a protected port from an authorized source.
    pub accept_authorized: u64,
    /// Packets to ports the gate does not protect.
    pub accept_passthrough: u64,
    /// Packets belonging to an already admitted connection.
    pub accept_established: u64,
    /// New connections to a protected port from an unknown source.
    pub drop_unauthorized: u64,
    /// Packets whose headers could not be parsed.
    pub drop_malformed: u64,
    /// Successful calls to `authorize`.
    pub authorized: u64,
    /// Calls to `authorize` refused because the table was full or
    /// closed.
    pub auth_rejected: u64,
    /// Entries removed by the reaper.
    pub expired: u64,
    /// Completed reaper sweeps.
    pub sweeps: u64,
}

impl GateStatsSnap {
    pub fn accepted(&self) -> u64 {
        self.accept_authorized
            + self.accept_passthrough
            + self.accept_established
    }

    pub fn dropped(&self) -> u64 {
        self.drop_unauthorized + self.drop_malformed
    }
}
