// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::path::PathBuf;

use clap::Parser;

use knock::api::GateCfg;
use knock::print::print_cfg;
use knock::print::print_state;
use knock::print::print_stats;
use knockadm::AuthSpec;
use knockadm::Replayer;
use knockadm::capture::read_capture;
use knockadm::knock_pkg_version;
use knockadm::load_cfg;
use knockadm::print_records;
use slog::info;
use slog::o;

/// Administer a port-knocking gate.
#[derive(Debug, Parser)]
#[command(version=knock_pkg_version())]
enum Command {
    /// Validate a gate configuration file and print the resulting
    /// settings.
    CheckConfig {
        path: PathBuf,
    },

    /// Push the packets of a capture file through a gate and report
    /// the verdict on each.
    Replay {
        /// A pcap or pcapng capture.
        #[arg(long)]
        pcap: PathBuf,

        /// Gate configuration; the defaults are used when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Authorize ADDR, ADDR:PORT or [V6ADDR]:PORT before the
        /// first packet. May be repeated.
        #[arg(long = "authorize", value_name = "ADDR[:PORT]")]
        authorize: Vec<AuthSpec>,

        /// Only print the summary.
        #[arg(short, long)]
        quiet: bool,

        /// Print the authorizations left at the end of the replay.
        #[arg(long)]
        state: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let log = knockadm::logger();

    match cmd {
        Command::CheckConfig { path } => {
            let cfg = load_cfg(&path)?;
            print_cfg(&cfg)?;
        }

        Command::Replay { pcap, config, authorize, quiet, state } => {
            let cfg = match config {
                Some(path) => load_cfg(&path)?,
                None => GateCfg::default(),
            };

            let capture = read_capture(&pcap)?;
            let log = log.new(o!("pcap" => pcap.display().to_string()));
            info!(log, "replaying capture";
                "packets" => capture.pkts.len(),
                "skipped" => capture.skipped,
            );

            let mut replayer = Replayer::start(cfg, &log)?;
            for spec in &authorize {
                replayer.authorize(spec)?;
            }

            let recs: Vec<_> =
                capture.pkts.iter().map(|pkt| replayer.feed(pkt)).collect();
            let summary = replayer.finish()?;

            if !quiet {
                print_records(&recs)?;
                println!();
            }

            if state {
                print_state(&summary.state)?;
                println!();
            }

            print_stats(&summary.stats)?;

            for err in &summary.stop.errors {
                eprintln!("teardown: {err}");
            }
        }
    }

    Ok(())
}
