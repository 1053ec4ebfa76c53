// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! knockadm: check gate configurations and replay captures through a
//! live gate.

pub mod capture;

use anyhow::Context;
use anyhow::anyhow;
use knock::KnockCtx;
use knock::StopReport;
use knock::api::ConnState;
use knock::api::DumpStateResp;
use knock::api::GateCfg;
use knock::api::GateStatsSnap;
use knock::api::IpAddr;
use knock::api::PortSel;
use knock::api::Verdict;
use knock::engine::headers::InboundMeta;
use knock::engine::headers::parse_inbound;
use knock::engine::trigger::ChannelSource;
use knock::engine::trigger::Trigger;
use knock::provider::LocalIngress;
use knock::provider::Providers;
use slog::Drain;
use slog::Logger;
use slog::o;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc;
use tabwriter::TabWriter;

pub use knock::api::API_VERSION;
pub use knock::api::MAJOR_VERSION;

/// The version reported by `knockadm --version`.
pub fn knock_pkg_version() -> String {
    format!("{MAJOR_VERSION}.{API_VERSION}")
}

/// Build the process logger: terminal output on stderr, filtered by
/// `RUST_LOG`, written off-thread.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "knockadm"))
}

/// Load and validate a gate configuration file.
pub fn load_cfg(path: &Path) -> anyhow::Result<GateCfg> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    GateCfg::from_toml(&text)
        .with_context(|| format!("invalid configuration {}", path.display()))
}

/// An authorization given on the command line: `ADDR`, `ADDR:PORT`,
/// `ADDR:*` or `[V6ADDR]:PORT`. A bare address is authorized for
/// every protected port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthSpec {
    pub addr: IpAddr,
    pub port: PortSel,
}

impl FromStr for AuthSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Self { addr, port: PortSel::Any });
        }

        let (addr, port) = match s.strip_prefix('[') {
            Some(rest) => rest
                .split_once("]:")
                .ok_or_else(|| format!("malformed authorization: {s}"))?,
            None => s
                .rsplit_once(':')
                .ok_or_else(|| format!("malformed authorization: {s}"))?,
        };

        let addr = addr.parse::<IpAddr>()?;
        let port = port.parse::<PortSel>()?;
        Ok(Self { addr, port })
    }
}

type FlowKey = (IpAddr, IpAddr, u8, u16, u16);

fn flow_key(meta: &InboundMeta) -> Option<FlowKey> {
    Some((meta.src, meta.dst, meta.proto, meta.src_port?, meta.dst_port?))
}

fn reverse(key: &FlowKey) -> FlowKey {
    (key.1, key.0, key.2, key.4, key.3)
}

/// The gate's decision on one packet of a replay.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplayRecord {
    pub index: usize,
    pub meta: Option<InboundMeta>,
    pub conn: ConnState,
    pub verdict: Verdict,
}

/// What was left when a replay finished.
#[derive(Clone, Debug)]
pub struct ReplaySummary {
    pub stats: GateStatsSnap,
    pub state: DumpStateResp,
    pub stop: StopReport,
}

/// A live gate that packets are fed through one at a time.
///
/// A capture carries no connection-tracking state, so it is inferred:
/// a packet belongs to an established connection when an earlier
/// packet of the same flow (in either direction) was admitted, unless
/// it is a bare TCP SYN.
pub struct Replayer {
    ctx: KnockCtx,
    ingress: Arc<LocalIngress>,
    // Held so the listener's source stays connected.
    _triggers: mpsc::Sender<Trigger>,
    flows: BTreeSet<FlowKey>,
    next_index: usize,
}

impl Replayer {
    pub fn start(cfg: GateCfg, log: &Logger) -> anyhow::Result<Self> {
        let ctx = KnockCtx::new(cfg, log)?;
        let ingress = Arc::new(LocalIngress::new());
        let (triggers, source) = ChannelSource::new();
        ctx.start(Providers {
            ingress: ingress.clone(),
            trigger: Box::new(source),
        })?;

        Ok(Self {
            ctx,
            ingress,
            _triggers: triggers,
            flows: BTreeSet::new(),
            next_index: 0,
        })
    }

    pub fn authorize(&self, spec: &AuthSpec) -> anyhow::Result<()> {
        self.ctx
            .authorizer()
            .authorize(spec.addr, spec.port)
            .map_err(|e| anyhow!("failed to authorize {}: {e}", spec.addr))
    }

    pub fn feed(&mut self, pkt: &[u8]) -> ReplayRecord {
        let index = self.next_index;
        self.next_index += 1;

        let meta = parse_inbound(pkt).ok();
        let key = meta.as_ref().and_then(flow_key);
        let conn = match (&meta, &key) {
            (Some(m), _) if m.is_tcp_syn() => ConnState::New,
            (_, Some(k)) if self.flows.contains(k) => ConnState::Established,
            (_, Some(k)) if self.flows.contains(&reverse(k)) => {
                ConnState::EstablishedReply
            }
            _ => ConnState::New,
        };

        let verdict = self.ingress.deliver(pkt, conn);
        if let (Verdict::Accept, Some(k)) = (verdict, key) {
            self.flows.insert(k);
        }

        ReplayRecord { index, meta, conn, verdict }
    }

    pub fn finish(self) -> anyhow::Result<ReplaySummary> {
        let stats = self.ctx.stats();
        let state = self.ctx.dump_state();
        let stop = self.ctx.stop()?;
        Ok(ReplaySummary { stats, state, stop })
    }
}

fn opt<T: ToString>(val: Option<T>) -> String {
    val.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Print a header for [`print_record_into`].
pub fn print_record_header_into(w: &mut impl Write) -> std::io::Result<()> {
    writeln!(w, "IDX\tSOURCE\tDESTINATION\tPROTO\tDPORT\tCONN\tVERDICT")
}

/// Print a single [`ReplayRecord`].
pub fn print_record_into(
    w: &mut impl Write,
    rec: &ReplayRecord,
) -> std::io::Result<()> {
    let m = rec.meta.as_ref();
    writeln!(
        w,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        rec.index,
        opt(m.map(|m| m.src)),
        opt(m.map(|m| m.dst)),
        opt(m.map(|m| m.proto)),
        opt(m.and_then(|m| m.dst_port)),
        rec.conn,
        rec.verdict,
    )
}

/// Print every [`ReplayRecord`] as a table.
pub fn print_records(recs: &[ReplayRecord]) -> std::io::Result<()> {
    print_records_into(&mut std::io::stdout(), recs)
}

/// Print every [`ReplayRecord`] as a table into the given writer.
pub fn print_records_into(
    writer: &mut impl Write,
    recs: &[ReplayRecord],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    print_record_header_into(&mut t)?;
    for rec in recs {
        print_record_into(&mut t, rec)?;
    }
    t.flush()
}
