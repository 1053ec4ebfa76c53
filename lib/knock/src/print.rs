// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print gate state in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both knockadm and integration tests.

use knock_api::DumpStateResp;
use knock_api::GateCfg;
use knock_api::GateStatsSnap;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpStateResp`].
pub fn print_state(resp: &DumpStateResp) -> std::io::Result<()> {
    print_state_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpStateResp`] into a given writer.
pub fn print_state_into(
    writer: &mut impl Write,
    resp: &DumpStateResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(
        t,
        "Authorizations: {}/{} (timeout {}ms)",
        resp.entries.len(),
        resp.limit,
        resp.timeout_ms,
    )?;
    write_hr(&mut t)?;
    writeln!(t, "SOURCE\tPORT\tAGE (ms)")?;
    for entry in &resp.entries {
        writeln!(t, "{}\t{}\t{}", entry.addr, entry.port, entry.age_ms)?;
    }
    t.flush()
}

/// Print a [`GateStatsSnap`].
pub fn print_stats(stats: &GateStatsSnap) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print a [`GateStatsSnap`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &GateStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Gate Stats")?;
    write_hr(&mut t)?;
    writeln!(t, "accepted\t{}", stats.accepted())?;
    writeln!(t, "  authorized\t{}", stats.accept_authorized)?;
    writeln!(t, "  passthrough\t{}", stats.accept_passthrough)?;
    writeln!(t, "  established\t{}", stats.accept_established)?;
    writeln!(t, "dropped\t{}", stats.dropped())?;
    writeln!(t, "  unauthorized\t{}", stats.drop_unauthorized)?;
    writeln!(t, "  malformed\t{}", stats.drop_malformed)?;
    writeln!(t, "authorizations\t{}", stats.authorized)?;
    writeln!(t, "  rejected\t{}", stats.auth_rejected)?;
    writeln!(t, "expired\t{}", stats.expired)?;
    writeln!(t, "sweeps\t{}", stats.sweeps)?;
    t.flush()
}

/// Print a [`GateCfg`].
pub fn print_cfg(cfg: &GateCfg) -> std::io::Result<()> {
    print_cfg_into(&mut std::io::stdout(), cfg)
}

/// Print a [`GateCfg`] into a given writer.
pub fn print_cfg_into(
    writer: &mut impl Write,
    cfg: &GateCfg,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    let ports: Vec<String> =
        cfg.protected_ports().iter().map(ToString::to_string).collect();

    writeln!(t, "protected ports\t{}", ports.join(","))?;
    writeln!(t, "timeout\t{}ms", cfg.timeout_ms)?;
    writeln!(t, "max ports\t{}", cfg.max_ports)?;
    writeln!(t, "max entries\t{}", cfg.max_entries)?;
    writeln!(t, "shutdown grace\t{}ms", cfg.shutdown_grace_ms)?;
    writeln!(t, "trigger poll\t{}ms", cfg.trigger_poll_ms)?;
    t.flush()
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use knock_api::StateEntryDump;

    #[test]
    fn state_table_rows() {
        let resp = DumpStateResp {
            timeout_ms: 30_000,
            limit: 8192,
            entries: vec![
                StateEntryDump {
                    addr: "10.0.0.5".parse().unwrap(),
                    port: knock_api::PortSel::Port(1234),
                    age_ms: 100,
                },
                StateEntryDump {
                    addr: "fd00::5".parse().unwrap(),
                    port: knock_api::PortSel::Any,
                    age_ms: 7,
                },
            ],
        };

        let mut out = vec![];
        print_state_into(&mut out, &resp).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines[0], "Authorizations: 2/8192 (timeout 30000ms)");
        assert!(lines[2].starts_with("SOURCE"));
        let row: Vec<&str> = lines[3].split_whitespace().collect();
        assert_eq!(row, ["10.0.0.5", "1234", "100"]);
        let row: Vec<&str> = lines[4].split_whitespace().collect();
        assert_eq!(row, ["fd00::5", "*", "7"]);
    }

    #[test]
    fn stats_totals() {
        let stats = GateStatsSnap {
            accept_authorized: 2,
            accept_passthrough: 3,
            drop_unauthorized: 4,
            ..Default::default()
        };

        let mut out = vec![];
        print_stats_into(&mut out, &stats).unwrap();
        let out = String::from_utf8(out).unwrap();
        let has_row = |row: [&str; 2]| {
            out.lines().any(|l| l.split_whitespace().eq(row))
        };
        assert!(has_row(["accepted", "5"]));
        assert!(has_row(["dropped", "4"]));
    }

    #[test]
    fn cfg_ports() {
        let cfg = GateCfg { additional_ports: vec![22], ..Default::default() };
        let mut out = vec![];
        print_cfg_into(&mut out, &cfg).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.lines().next().unwrap().ends_with("22,1234"));
    }
}
