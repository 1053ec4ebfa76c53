// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod pcap;
pub mod pkt;

// Let's make our lives easier and pub use a bunch of stuff.
pub use knock::KnockCtx;
pub use knock::api::AuthKey;
pub use knock::api::ConnState;
pub use knock::api::GateCfg;
pub use knock::api::IpAddr;
pub use knock::api::KnockError;
pub use knock::api::PortSel;
pub use knock::api::Verdict;
pub use knock::engine::headers::TCP_ACK;
pub use knock::engine::headers::TCP_FIN;
pub use knock::engine::headers::TCP_RST;
pub use knock::engine::headers::TCP_SYN;
pub use knock::engine::trigger::ChannelSource;
pub use knock::engine::trigger::Trigger;
pub use knock::provider::LocalIngress;
pub use knock::provider::Providers;
pub use pkt::*;

use slog::Logger;
use slog::o;
use std::sync::Arc;
use std::sync::mpsc;

/// A logger that goes nowhere.
pub fn discard_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Parse an address, panicking on failure.
pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// A running gate wired to in-process providers.
pub struct TestGate {
    pub ctx: KnockCtx,
    pub ingress: Arc<LocalIngress>,
    pub triggers: mpsc::Sender<Trigger>,
}

impl TestGate {
    /// Create and start a gate for `cfg`.
    pub fn start(cfg: GateCfg) -> Self {
        let ctx = KnockCtx::new(cfg, &discard_log()).unwrap();
        let ingress = Arc::new(LocalIngress::new());
        let (triggers, src) = ChannelSource::new();
        let providers =
            Providers { ingress: ingress.clone(), trigger: Box::new(src) };
        ctx.start(providers).unwrap();
        Self { ctx, ingress, triggers }
    }

    /// Run a packet through the registered ingress hook.
    pub fn deliver(&self, pkt: &[u8], conn: ConnState) -> Verdict {
        self.ingress.deliver(pkt, conn)
    }

    /// Authorize directly, bypassing the trigger listener.
    pub fn authorize(&self, addr: IpAddr, port: PortSel) {
        self.ctx.authorizer().authorize(addr, port).unwrap();
    }
}
