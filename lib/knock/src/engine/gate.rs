// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The per-packet admission decision.
//!
//! This is the hot path: it is called for every inbound packet, from
//! as many contexts as the host delivers packets on. It never
//! allocates, never blocks on anything but the table's read lock, and
//! never mutates the table.

use super::headers::parse_inbound;
use super::stat::GateStats;
use super::state_table::StateTable;
use knock_api::ConnState;
use knock_api::IpAddr;
use knock_api::Verdict;
use std::sync::Arc;

pub struct PacketGate {
    table: Arc<StateTable>,
    // Sorted and deduplicated; fixed for the life of the gate.
    ports: Box<[u16]>,
    stats: Arc<GateStats>,
}

impl PacketGate {
    pub fn new(
        table: Arc<StateTable>,
        ports: &[u16],
        stats: Arc<GateStats>,
    ) -> Self {
        let mut ports = ports.to_vec();
        ports.sort_unstable();
        ports.dedup();
        Self { table, ports: ports.into_boxed_slice(), stats }
    }

    pub fn protected_ports(&self) -> &[u16] {
        &self.ports
    }

    #[inline]
    pub fn is_protected(&self, port: u16) -> bool {
        self.ports.binary_search(&port).is_ok()
    }

    /// Decide on a packet whose headers have already been read.
    pub fn decide(
        &self,
        src: IpAddr,
        dst_port: u16,
        conn: ConnState,
    ) -> Verdict {
        if !conn.is_new() {
            self.stats.accept_established.incr();
            return Verdict::Accept;
        }

        if !self.is_protected(dst_port) {
            self.stats.accept_passthrough.incr();
            return Verdict::Accept;
        }

        if self.table.is_authorized(src, dst_port) {
            self.stats.accept_authorized.incr();
            Verdict::Accept
        } else {
            self.stats.drop_unauthorized.incr();
            Verdict::Drop
        }
    }

    /// Decide on a raw IP datagram.
    ///
    /// Packets of an existing connection are accepted without being
    /// looked at. A new packet whose headers cannot be read is
    /// dropped. A new packet with no transport port (anything but TCP
    /// and UDP) cannot target a protected port and is accepted.
    pub fn process(&self, pkt: &[u8], conn: ConnState) -> Verdict {
        if !conn.is_new() {
            self.stats.accept_established.incr();
            return Verdict::Accept;
        }

        let meta = match parse_inbound(pkt) {
            Ok(meta) => meta,
            Err(_) => {
                self.stats.drop_malformed.incr();
                return Verdict::Drop;
            }
        };

        match meta.dst_port {
            Some(port) => self.decide(meta.src, port, conn),
            None => {
                self.stats.accept_passthrough.incr();
                Verdict::Accept
            }
        }
    }
}

impl core::fmt::Debug for PacketGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketGate")
            .field("ports", &self.ports)
            .field("table", &self.table)
            .finish()
    }
}
