// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cfg;
pub mod cmd;
pub mod ip;

pub use cfg::*;
pub use cmd::*;
pub use ip::*;

/// The overall version of the API. Anytime an API type is added,
/// removed, or modified, this number should increment.
pub const API_VERSION: u64 = 3;

/// Major version of the knock package.
pub const MAJOR_VERSION: u64 = 0;

/// The decision returned by the ingress hook for a single packet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        };

        write!(f, "{s}")
    }
}

/// The connection-tracking state of an inbound packet, as supplied by
/// the host alongside the packet itself.
///
/// Only [`ConnState::New`] is subject to the gate; every other state
/// belongs to a flow that was already admitted.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ConnState {
    New,
    Established,
    EstablishedReply,
    Related,
}

impl ConnState {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

impl core::str::FromStr for ConnState {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "established" => Ok(Self::Established),
            "established-reply" => Ok(Self::EstablishedReply),
            "related" => Ok(Self::Related),
            _ => Err(format!("invalid connection state: {s}")),
        }
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Established => "ESTABLISHED",
            Self::EstablishedReply => "ESTABLISHED_REPLY",
            Self::Related => "RELATED",
        };

        write!(f, "{s}")
    }
}
