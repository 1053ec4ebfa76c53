// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Inbound header parsing.
//!
//! The gate needs very little from a packet: who sent it, which
//! protocol it carries, and (for TCP and UDP) the ports. These header
//! views read exactly that out of a raw IP datagram without copying
//! it, and without allocating.

use knock_api::IpAddr;
use knock_api::Ipv4Addr;
use knock_api::Ipv6Addr;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const IPV4_VERSION: u8 = 4;
pub const IPV6_VERSION: u8 = 6;
pub const IPV4_HDR_LEN_MASK: u8 = 0x0F;
pub const IPV4_FRAG_OFFSET_MASK: u16 = 0x1FFF;
pub const IPV6_FRAG_OFFSET_SHIFT: u16 = 3;

pub const IP_PROTO_HOP_BY_HOP: u8 = 0;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_IPV6_ROUTE: u8 = 43;
pub const IP_PROTO_IPV6_FRAG: u8 = 44;
pub const IP_PROTO_AH: u8 = 51;
pub const IP_PROTO_IPV6_OPTS: u8 = 60;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("{hdr} header truncated")]
    Truncated { hdr: &'static str },

    #[error("bad IP version: {vsn}")]
    BadVersion { vsn: u8 },

    #[error("bad IPv4 header length: {hdr_len}")]
    BadHeaderLen { hdr_len: u16 },

    #[error("bad IPv4 total length: {total_len}")]
    BadTotalLen { total_len: u16 },

    #[error("non-initial fragment")]
    Fragment,
}

#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub dscp_ecn: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    pub frag_and_flags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    fn hdr_len(&self) -> u16 {
        u16::from(self.ver_hdr_len & IPV4_HDR_LEN_MASK) * 4
    }

    fn frag_offset(&self) -> u16 {
        u16::from_be_bytes(self.frag_and_flags) & IPV4_FRAG_OFFSET_MASK
    }
}

#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct Ipv6HdrRaw {
    pub vsn_class_flow: [u8; 4],
    pub payload_len: [u8; 2],
    pub next_hdr: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

impl Ipv6HdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// The leading bytes shared by every IPv6 extension header we step
/// over.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct Ipv6ExtHdrRaw {
    pub next_hdr: u8,
    pub hdr_ext_len: u8,
    pub data: [u8; 6],
}

impl Ipv6ExtHdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    fn offset_and_flags(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }
}

#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct TcpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub seq: [u8; 4],
    pub ack: [u8; 4],
    pub offset: u8,
    pub flags: u8,
    pub win: [u8; 2],
    pub csum: [u8; 2],
    pub urg: [u8; 2],
}

impl TcpHdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct UdpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub len: [u8; 2],
    pub csum: [u8; 2],
}

impl UdpHdrRaw {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// The inbound metadata the gate decides on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InboundMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<u8>,
}

impl InboundMeta {
    /// Is this a TCP segment carrying SYN without ACK?
    pub fn is_tcp_syn(&self) -> bool {
        self.tcp_flags
            .is_some_and(|f| f & TCP_SYN != 0 && f & TCP_ACK == 0)
    }
}

fn view<'a, T>(
    bytes: &'a [u8],
    hdr: &'static str,
) -> Result<(&'a T, &'a [u8]), ParseError>
where
    T: FromBytes + KnownLayout + Immutable + Unaligned,
{
    T::ref_from_prefix(bytes).map_err(|_| ParseError::Truncated { hdr })
}

/// Parse a raw IP datagram, starting at the IP header.
///
/// A non-initial fragment carries no transport header and is reported
/// as [`ParseError::Fragment`]. Protocols other than TCP and UDP parse
/// successfully with no ports.
pub fn parse_inbound(pkt: &[u8]) -> Result<InboundMeta, ParseError> {
    let Some(first) = pkt.first() else {
        return Err(ParseError::Truncated { hdr: "IP" });
    };

    match first >> 4 {
        IPV4_VERSION => parse_ipv4(pkt),
        IPV6_VERSION => parse_ipv6(pkt),
        vsn => Err(ParseError::BadVersion { vsn }),
    }
}

fn parse_ipv4(pkt: &[u8]) -> Result<InboundMeta, ParseError> {
    let (ip, _) = view::<Ipv4HdrRaw>(pkt, "IPv4")?;
    let hdr_len = ip.hdr_len();

    if usize::from(hdr_len) < Ipv4HdrRaw::SIZE {
        return Err(ParseError::BadHeaderLen { hdr_len });
    }

    let total_len = u16::from_be_bytes(ip.total_len);
    if total_len < hdr_len {
        return Err(ParseError::BadTotalLen { total_len });
    }

    // Options are skipped, never interpreted.
    let Some(ulp) = pkt.get(usize::from(hdr_len)..) else {
        return Err(ParseError::Truncated { hdr: "IPv4 options" });
    };

    if ip.frag_offset() != 0 {
        return Err(ParseError::Fragment);
    }

    let mut proto = ip.proto;
    let mut ulp = ulp;
    while proto == IP_PROTO_AH {
        (proto, ulp) = skip_auth_hdr(ulp)?;
    }

    let src = IpAddr::Ip4(Ipv4Addr::from(ip.src));
    let dst = IpAddr::Ip4(Ipv4Addr::from(ip.dst));
    parse_ulp(src, dst, proto, ulp)
}

/// Step over an Authentication Header, returning the protocol it
/// protects and the bytes that follow it.
///
/// AH counts its length in 4-byte words, less two, unlike the IPv6
/// extension headers.
fn skip_auth_hdr(bytes: &[u8]) -> Result<(u8, &[u8]), ParseError> {
    let (ah, _) = view::<Ipv6ExtHdrRaw>(bytes, "AH")?;
    let len = (usize::from(ah.hdr_ext_len) + 2) * 4;
    let rest = bytes.get(len..).ok_or(ParseError::Truncated { hdr: "AH" })?;
    Ok((ah.next_hdr, rest))
}

fn parse_ipv6(pkt: &[u8]) -> Result<InboundMeta, ParseError> {
    let (ip, mut rest) = view::<Ipv6HdrRaw>(pkt, "IPv6")?;
    let mut next = ip.next_hdr;

    // Every extension header is at least 8 bytes long, so this walk
    // always terminates.
    loop {
        match next {
            IP_PROTO_HOP_BY_HOP | IP_PROTO_IPV6_ROUTE | IP_PROTO_IPV6_OPTS => {
                let (ext, _) = view::<Ipv6ExtHdrRaw>(rest, "IPv6 extension")?;
                let len = (usize::from(ext.hdr_ext_len) + 1) * 8;
                next = ext.next_hdr;
                rest = rest
                    .get(len..)
                    .ok_or(ParseError::Truncated { hdr: "IPv6 extension" })?;
            }

            IP_PROTO_IPV6_FRAG => {
                let (frag, tail) =
                    view::<Ipv6ExtHdrRaw>(rest, "IPv6 fragment")?;
                if frag.offset_and_flags() >> IPV6_FRAG_OFFSET_SHIFT != 0 {
                    return Err(ParseError::Fragment);
                }
                next = frag.next_hdr;
                rest = tail;
            }

            IP_PROTO_AH => (next, rest) = skip_auth_hdr(rest)?,

            _ => break,
        }
    }

    let src = IpAddr::Ip6(Ipv6Addr::from(ip.src));
    let dst = IpAddr::Ip6(Ipv6Addr::from(ip.dst));
    parse_ulp(src, dst, next, rest)
}

fn parse_ulp(
    src: IpAddr,
    dst: IpAddr,
    proto: u8,
    ulp: &[u8],
) -> Result<InboundMeta, ParseError> {
    let mut meta = InboundMeta {
        src,
        dst,
        proto,
        src_port: None,
        dst_port: None,
        tcp_flags: None,
    };

    match proto {
        IP_PROTO_TCP => {
            let (tcp, _) = view::<TcpHdrRaw>(ulp, "TCP")?;
            meta.src_port = Some(u16::from_be_bytes(tcp.src_port));
            meta.dst_port = Some(u16::from_be_bytes(tcp.dst_port));
            meta.tcp_flags = Some(tcp.flags);
        }

        IP_PROTO_UDP => {
            let (udp, _) = view::<UdpHdrRaw>(ulp, "UDP")?;
            meta.src_port = Some(u16::from_be_bytes(udp.src_port));
            meta.dst_port = Some(u16::from_be_bytes(udp.dst_port));
        }

        _ => {}
    }

    Ok(meta)
}
