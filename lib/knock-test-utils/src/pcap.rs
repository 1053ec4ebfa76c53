// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Routines for building packet capture files.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Build a packet capture file from a series of packets.
pub struct PcapBuilder {
    file: File,
    ts_usec: u64,
}

impl PcapBuilder {
    /// Create a new pcap builder of raw IP packets, writing all
    /// captures to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_linktype(path, Linktype::RAW)
    }

    /// Create a new pcap builder whose packets start at the link
    /// layer given by `network`.
    pub fn with_linktype(path: impl AsRef<Path>, network: Linktype) -> Self {
        let mut file = File::create(path).unwrap();

        let mut hdr = PcapHeader {
            magic_number: 0xa1b2c3d4,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 1500,
            network,
        };

        file.write_all(&hdr.to_vec().unwrap()).unwrap();

        Self { file, ts_usec: 0 }
    }

    /// Add a packet to the capture, 1ms after the previous one.
    pub fn add_pkt(&mut self, pkt: &[u8]) {
        self.ts_usec += 1_000;
        let mut block = LegacyPcapBlock {
            ts_sec: (self.ts_usec / 1_000_000) as u32,
            ts_usec: (self.ts_usec % 1_000_000) as u32,
            caplen: pkt.len() as u32,
            origlen: pkt.len() as u32,
            data: pkt,
        };

        self.file.write_all(&block.to_vec().unwrap()).unwrap();
    }

    pub fn finish(mut self) {
        self.file.flush().unwrap();
    }
}
