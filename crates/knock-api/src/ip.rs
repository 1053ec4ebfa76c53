// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// A family-tagged IP address.
///
/// Authorizations are keyed on this type, so it orders IPv4 before
/// IPv6 and otherwise compares bytewise.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum IpAddr {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

impl IpAddr {
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddr::Ip4(_))
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(ipv4: Ipv4Addr) -> Self {
        IpAddr::Ip4(ipv4)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(ipv6: Ipv6Addr) -> Self {
        IpAddr::Ip6(ipv6)
    }
}

impl From<std::net::IpAddr> for IpAddr {
    fn from(ip: std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(ipv4) => Self::Ip4(ipv4.into()),
            std::net::IpAddr::V6(ipv6) => Self::Ip6(ipv6.into()),
        }
    }
}

impl From<IpAddr> for std::net::IpAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::Ip4(ipv4) => Self::V4(ipv4.into()),
            IpAddr::Ip6(ipv6) => Self::V6(ipv6.into()),
        }
    }
}

impl Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpAddr::Ip4(ip4) => write!(f, "{ip4}"),
            IpAddr::Ip6(ip6) => write!(f, "{ip6}"),
        }
    }
}

impl FromStr for IpAddr {
    type Err = String;
    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        if let Ok(ipv4) = val.parse::<Ipv4Addr>() {
            Ok(ipv4.into())
        } else {
            val.parse::<Ipv6Addr>()
                .map(IpAddr::Ip6)
                .map_err(|_| String::from("Invalid IP address"))
        }
    }
}

/// An IPv4 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl From<std::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip4: std::net::Ipv4Addr) -> Self {
        Self { inner: ip4.octets() }
    }
}

impl From<Ipv4Addr> for std::net::Ipv4Addr {
    fn from(ip4: Ipv4Addr) -> Self {
        Self::from(ip4.inner)
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        val.parse::<std::net::Ipv4Addr>()
            .map(Self::from)
            .map_err(|_| format!("malformed ip: {val}"))
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.inner[0], self.inner[1], self.inner[2], self.inner[3],
        )
    }
}

// There's no reason to view an Ipv4Addr as its raw array, so just
// present it in a human-friendly manner.
impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr {{ inner: {self} }}")
    }
}

/// An IPv6 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv6Addr {
    inner: [u8; 16],
}

impl Ipv6Addr {
    /// The unspecified IPv6 address, i.e., `::` or all zeros.
    pub const ANY_ADDR: Self = Self { inner: [0; 16] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 16] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 16]) -> Self {
        Self { inner: bytes }
    }
}

impl From<[u8; 16]> for Ipv6Addr {
    fn from(bytes: [u8; 16]) -> Self {
        Self { inner: bytes }
    }
}

impl From<std::net::Ipv6Addr> for Ipv6Addr {
    fn from(ip6: std::net::Ipv6Addr) -> Self {
        Self { inner: ip6.octets() }
    }
}

impl From<Ipv6Addr> for std::net::Ipv6Addr {
    fn from(ip6: Ipv6Addr) -> Self {
        Self::from(ip6.inner)
    }
}

impl FromStr for Ipv6Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        val.parse::<std::net::Ipv6Addr>()
            .map(Self::from)
            .map_err(|_| String::from("Invalid IPv6 address"))
    }
}

impl Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", std::net::Ipv6Addr::from(self.inner))
    }
}

impl Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv6Addr {{ inner: {self} }}")
    }
}

/// The destination port(s) an authorization applies to.
///
/// `Any` is the wildcard sentinel: it admits the source on every
/// protected port.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum PortSel {
    Any,
    Port(u16),
}

impl From<u16> for PortSel {
    fn from(port: u16) -> Self {
        Self::Port(port)
    }
}

impl Display for PortSel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Port(p) => write!(f, "{p}"),
        }
    }
}

impl FromStr for PortSel {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        match val {
            "*" | "any" => Ok(Self::Any),
            _ => val
                .parse::<u16>()
                .map(Self::Port)
                .map_err(|_| format!("invalid port: {val}")),
        }
    }
}

/// The key of an authorization: a source address and the port it
/// was authorized for.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct AuthKey {
    pub addr: IpAddr,
    pub port: PortSel,
}

impl AuthKey {
    pub fn new(addr: IpAddr, port: PortSel) -> Self {
        Self { addr, port }
    }
}

impl Display for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            IpAddr::Ip4(ip4) => write!(f, "{ip4}:{}", self.port),
            IpAddr::Ip6(ip6) => write!(f, "[{ip6}]:{}", self.port),
        }
    }
}
