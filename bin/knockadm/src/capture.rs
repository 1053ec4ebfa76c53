// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Reading IP packets out of capture files.
//!
//! Both legacy pcap and pcapng are accepted. Every packet is reduced to
//! the IP datagram it carries; frames that carry something other than
//! IP are skipped.

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use pcap_parser::Block;
use pcap_parser::Linktype;
use pcap_parser::PcapBlockOwned;
use pcap_parser::PcapError;
use pcap_parser::create_reader;
use pcap_parser::traits::PcapReaderIterator;
use std::fs::File;
use std::path::Path;

const READ_BUF_LEN: usize = 65536;

const ETHER_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const SLL_HDR_LEN: usize = 16;
const NULL_HDR_LEN: usize = 4;

const ETHER_TYPE_IPV4: u16 = 0x0800;
const ETHER_TYPE_IPV6: u16 = 0x86DD;
const ETHER_TYPE_VLAN: u16 = 0x8100;
const ETHER_TYPE_QINQ: u16 = 0x88A8;

/// The IP packets of a capture, in capture order.
#[derive(Debug, Default)]
pub struct Capture {
    pub pkts: Vec<Vec<u8>>,
    /// Frames that did not carry IP.
    pub skipped: usize,
}

fn be16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn is_ip_ethertype(ethertype: u16) -> bool {
    ethertype == ETHER_TYPE_IPV4 || ethertype == ETHER_TYPE_IPV6
}

/// Return the IP datagram carried by `frame`, if any.
///
/// A frame that is too short to hold its link header is kept as an
/// empty datagram so that the gate sees (and drops) it.
pub fn strip_link(
    linktype: Linktype,
    frame: &[u8],
) -> anyhow::Result<Option<&[u8]>> {
    let empty: &[u8] = &[];

    if linktype == Linktype::RAW
        || linktype == Linktype::IPV4
        || linktype == Linktype::IPV6
    {
        return Ok(Some(frame));
    }

    if linktype == Linktype::ETHERNET {
        let mut off = ETHER_HDR_LEN;
        let mut ethertype = match be16(frame, 12) {
            Some(et) => et,
            None => return Ok(Some(empty)),
        };

        while ethertype == ETHER_TYPE_VLAN || ethertype == ETHER_TYPE_QINQ {
            ethertype = match be16(frame, off + 2) {
                Some(et) => et,
                None => return Ok(Some(empty)),
            };
            off += VLAN_TAG_LEN;
        }

        if !is_ip_ethertype(ethertype) {
            return Ok(None);
        }

        return Ok(Some(frame.get(off..).unwrap_or(empty)));
    }

    if linktype == Linktype::LINUX_SLL {
        return match be16(frame, 14) {
            Some(et) if is_ip_ethertype(et) => {
                Ok(Some(frame.get(SLL_HDR_LEN..).unwrap_or(empty)))
            }
            Some(_) => Ok(None),
            None => Ok(Some(empty)),
        };
    }

    if linktype == Linktype::NULL {
        return Ok(Some(frame.get(NULL_HDR_LEN..).unwrap_or(empty)));
    }

    bail!("unsupported link type: {}", linktype.0)
}

/// Read every IP packet out of the capture file at `path`.
pub fn read_capture(path: &Path) -> anyhow::Result<Capture> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = create_reader(READ_BUF_LEN, file)
        .map_err(|e| anyhow!("{}: not a capture file: {e:?}", path.display()))?;

    let mut capture = Capture::default();
    let mut legacy_linktype = Linktype::ETHERNET;
    // pcapng links are per interface, in order of description.
    let mut if_linktypes: Vec<Linktype> = vec![];

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let frame = match block {
                    PcapBlockOwned::LegacyHeader(hdr) => {
                        legacy_linktype = hdr.network;
                        None
                    }

                    PcapBlockOwned::Legacy(b) => {
                        let len = (b.caplen as usize).min(b.data.len());
                        Some((legacy_linktype, &b.data[..len]))
                    }

                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        if_linktypes.clear();
                        None
                    }

                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        if_linktypes.push(idb.linktype);
                        None
                    }

                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let Some(lt) = if_linktypes.get(epb.if_id as usize)
                        else {
                            bail!(
                                "packet on undescribed interface {}",
                                epb.if_id
                            );
                        };
                        let len = (epb.caplen as usize).min(epb.data.len());
                        Some((*lt, &epb.data[..len]))
                    }

                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        let Some(lt) = if_linktypes.first() else {
                            bail!("simple packet with no interface");
                        };
                        let len = (spb.origlen as usize).min(spb.data.len());
                        Some((*lt, &spb.data[..len]))
                    }

                    PcapBlockOwned::NG(_) => None,
                };

                if let Some((lt, frame)) = frame {
                    match strip_link(lt, frame)? {
                        Some(pkt) => capture.pkts.push(pkt.to_vec()),
                        None => capture.skipped += 1,
                    }
                }

                reader.consume(offset);
            }

            Err(PcapError::Eof) => break,

            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| anyhow!("failed to read capture: {e:?}"))?;
            }

            Err(e) => bail!("failed to parse capture: {e:?}"),
        }
    }

    Ok(capture)
}
