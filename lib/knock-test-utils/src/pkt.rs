// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Routines for building raw IP packets.
//!
//! Every builder returns a complete datagram starting at the IP
//! header, with valid lengths and checksums, as the gate would see it
//! on the receive path.

use knock::api::IpAddr;
use knock::engine::headers::TCP_ACK;
use knock::engine::headers::TCP_FIN;
use knock::engine::headers::TCP_RST;
use knock::engine::headers::TCP_SYN;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::TcpSeqNumber;
use smoltcp::wire::UdpPacket;

pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
pub const ETHER_HDR_LEN: usize = 14;

pub const GUEST_MAC: EthernetAddress =
    EthernetAddress([0xA8, 0x40, 0x25, 0xF7, 0x00, 0x01]);
pub const GW_MAC: EthernetAddress =
    EthernetAddress([0xA8, 0x40, 0x25, 0xF7, 0x00, 0x02]);

fn smol_addr(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::Ip4(v4) => IpAddress::Ipv4(Ipv4Address(v4.bytes())),
        IpAddr::Ip6(v6) => IpAddress::Ipv6(Ipv6Address(v6.bytes())),
    }
}

/// Wrap a transport payload in an IP header.
///
/// # Panics
///
/// If `src` and `dst` are not of the same family.
pub fn ip_packet(
    src: IpAddr,
    dst: IpAddr,
    proto: IpProtocol,
    ulp: &[u8],
) -> Vec<u8> {
    match (smol_addr(src), smol_addr(dst)) {
        (IpAddress::Ipv4(s), IpAddress::Ipv4(d)) => {
            let mut bytes = vec![0u8; IPV4_HDR_LEN + ulp.len()];
            let mut ip = Ipv4Packet::new_unchecked(&mut bytes);
            ip.set_version(4);
            ip.set_header_len(IPV4_HDR_LEN as u8);
            ip.set_dscp(0);
            ip.set_ecn(0);
            ip.set_total_len((IPV4_HDR_LEN + ulp.len()) as u16);
            ip.set_ident(7777);
            ip.clear_flags();
            ip.set_dont_frag(true);
            ip.set_frag_offset(0);
            ip.set_hop_limit(64);
            ip.set_next_header(proto);
            ip.set_src_addr(s);
            ip.set_dst_addr(d);
            ip.payload_mut().copy_from_slice(ulp);
            ip.fill_checksum();
            bytes
        }

        (IpAddress::Ipv6(s), IpAddress::Ipv6(d)) => {
            let mut bytes = vec![0u8; IPV6_HDR_LEN + ulp.len()];
            let mut ip = Ipv6Packet::new_unchecked(&mut bytes);
            ip.set_version(6);
            ip.set_traffic_class(0);
            ip.set_flow_label(0);
            ip.set_payload_len(ulp.len() as u16);
            ip.set_next_header(proto);
            ip.set_hop_limit(64);
            ip.set_src_addr(s);
            ip.set_dst_addr(d);
            ip.payload_mut().copy_from_slice(ulp);
            bytes
        }

        _ => panic!("mixed address families: {src} -> {dst}"),
    }
}

/// Build a TCP segment with the given flags (see [`TCP_SYN`] and
/// friends).
pub fn tcp(
    src: IpAddr,
    dst: IpAddr,
    sport: u16,
    dport: u16,
    flags: u8,
) -> Vec<u8> {
    let mut seg = vec![0u8; TCP_HDR_LEN];
    let mut tcp = TcpPacket::new_unchecked(&mut seg);
    tcp.set_src_port(sport);
    tcp.set_dst_port(dport);
    tcp.set_seq_number(TcpSeqNumber(1000));
    let ack = if flags & TCP_ACK != 0 { 2000 } else { 0 };
    tcp.set_ack_number(TcpSeqNumber(ack));
    tcp.set_header_len(TCP_HDR_LEN as u8);
    tcp.clear_flags();
    tcp.set_syn(flags & TCP_SYN != 0);
    tcp.set_ack(flags & TCP_ACK != 0);
    tcp.set_fin(flags & TCP_FIN != 0);
    tcp.set_rst(flags & TCP_RST != 0);
    tcp.set_window_len(64240);
    tcp.set_urgent_at(0);
    tcp.fill_checksum(&smol_addr(src), &smol_addr(dst));

    ip_packet(src, dst, IpProtocol::Tcp, &seg)
}

/// Build the first segment of a TCP handshake.
pub fn tcp_syn(src: IpAddr, dst: IpAddr, sport: u16, dport: u16) -> Vec<u8> {
    tcp(src, dst, sport, dport, TCP_SYN)
}

/// Build a mid-connection TCP segment.
pub fn tcp_ack(src: IpAddr, dst: IpAddr, sport: u16, dport: u16) -> Vec<u8> {
    tcp(src, dst, sport, dport, TCP_ACK)
}

/// Build a UDP datagram.
pub fn udp(
    src: IpAddr,
    dst: IpAddr,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = UDP_HDR_LEN + payload.len();
    let mut dgram = vec![0u8; len];
    let mut udp = UdpPacket::new_unchecked(&mut dgram);
    udp.set_src_port(sport);
    udp.set_dst_port(dport);
    udp.set_len(len as u16);
    udp.payload_mut().copy_from_slice(payload);
    udp.fill_checksum(&smol_addr(src), &smol_addr(dst));

    ip_packet(src, dst, IpProtocol::Udp, &dgram)
}

/// Build an ICMPv4 echo request.
pub fn icmp_echo(src: IpAddr, dst: IpAddr, data: &[u8]) -> Vec<u8> {
    let icmp = Icmpv4Repr::EchoRequest { ident: 7, seq_no: 1, data };
    let mut bytes = vec![0u8; icmp.buffer_len()];
    let mut pkt = Icmpv4Packet::new_unchecked(&mut bytes);
    icmp.emit(&mut pkt, &ChecksumCapabilities::default());

    ip_packet(src, dst, IpProtocol::Icmp, &bytes)
}

/// Insert an empty hop-by-hop options header into an IPv6 packet.
pub fn with_hop_by_hop(pkt: &[u8]) -> Vec<u8> {
    let ip = Ipv6Packet::new_checked(pkt).unwrap();
    let next = ip.next_header();
    let payload_len = ip.payload_len();

    // Next header, length 0 (8 bytes), then a 6-byte PadN option.
    let hbh = [u8::from(next), 0, 1, 4, 0, 0, 0, 0];
    let mut out = pkt[..IPV6_HDR_LEN].to_vec();
    out.extend_from_slice(&hbh);
    out.extend_from_slice(&pkt[IPV6_HDR_LEN..]);

    let mut ip = Ipv6Packet::new_unchecked(&mut out);
    ip.set_next_header(IpProtocol::HopByHop);
    ip.set_payload_len(payload_len + hbh.len() as u16);
    out
}

/// Rewrite an IPv4 packet as a fragment at `offset` bytes.
pub fn as_ipv4_fragment(pkt: &[u8], offset: u16, more: bool) -> Vec<u8> {
    let mut out = pkt.to_vec();
    let mut ip = Ipv4Packet::new_checked(&mut out).unwrap();
    ip.set_dont_frag(false);
    ip.set_more_frags(more);
    ip.set_frag_offset(offset);
    ip.fill_checksum();
    out
}

/// Wrap an IP packet in an Ethernet frame.
pub fn ethernet_frame(pkt: &[u8]) -> Vec<u8> {
    let ethertype = match pkt.first().map(|b| b >> 4) {
        Some(6) => EthernetProtocol::Ipv6,
        _ => EthernetProtocol::Ipv4,
    };

    let mut bytes = vec![0u8; ETHER_HDR_LEN + pkt.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut bytes);
    frame.set_dst_addr(GUEST_MAC);
    frame.set_src_addr(GW_MAC);
    frame.set_ethertype(ethertype);
    frame.payload_mut().copy_from_slice(pkt);
    bytes
}
