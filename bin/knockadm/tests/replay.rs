// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Replay captures written to disk through a live gate.

use knock_test_utils::pcap::PcapBuilder;
use knock_test_utils::*;
use knockadm::AuthSpec;
use knockadm::Replayer;
use knockadm::capture::read_capture;
use pcap_parser::Linktype;
use std::path::PathBuf;

const CLIENT: &str = "10.0.0.5";
const STRANGER: &str = "10.0.0.9";
const SERVER: &str = "10.0.0.1";

fn capture_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("knockadm-{name}-{}.pcap", std::process::id()))
}

// A stranger's SYN, then the client's handshake and data.
fn conversation() -> Vec<Vec<u8>> {
    let client = ip(CLIENT);
    let server = ip(SERVER);
    vec![
        tcp_syn(ip(STRANGER), server, 41000, 1234),
        tcp_syn(client, server, 40000, 1234),
        tcp(server, client, 1234, 40000, TCP_SYN | TCP_ACK),
        tcp_ack(client, server, 40000, 1234),
        tcp_ack(ip(STRANGER), server, 41000, 1234),
    ]
}

fn replay(path: &PathBuf, auth: &[&str]) -> Vec<knockadm::ReplayRecord> {
    let capture = read_capture(path).unwrap();
    assert_eq!(capture.skipped, 0);

    let mut replayer =
        Replayer::start(GateCfg::default(), &discard_log()).unwrap();
    for spec in auth {
        replayer.authorize(&spec.parse::<AuthSpec>().unwrap()).unwrap();
    }

    let recs = capture.pkts.iter().map(|p| replayer.feed(p)).collect();
    let summary = replayer.finish().unwrap();
    assert!(summary.stop.is_clean());
    assert_eq!(summary.stop.drained, auth.len());
    recs
}

fn check(recs: &[knockadm::ReplayRecord]) {
    let got: Vec<_> = recs.iter().map(|r| (r.conn, r.verdict)).collect();
    assert_eq!(
        got,
        [
            (ConnState::New, Verdict::Drop),
            (ConnState::New, Verdict::Accept),
            (ConnState::EstablishedReply, Verdict::Accept),
            (ConnState::Established, Verdict::Accept),
            // The stranger never got a connection going.
            (ConnState::New, Verdict::Drop),
        ]
    );
}

#[test]
fn replay_raw_capture() {
    let path = capture_path("raw");
    let mut pcap = PcapBuilder::new(&path);
    for pkt in conversation() {
        pcap.add_pkt(&pkt);
    }
    pcap.finish();

    let recs = replay(&path, &[CLIENT]);
    check(&recs);
    assert_eq!(recs[1].meta.unwrap().dst_port, Some(1234));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn replay_ethernet_capture() {
    let path = capture_path("ether");
    let mut pcap = PcapBuilder::with_linktype(&path, Linktype::ETHERNET);
    for pkt in conversation() {
        pcap.add_pkt(&ethernet_frame(&pkt));
    }
    pcap.finish();

    let recs = replay(&path, &["10.0.0.5:1234"]);
    check(&recs);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn replay_without_authorization() {
    let client = ip(CLIENT);
    let server = ip(SERVER);
    let path = capture_path("unauth");
    let mut pcap = PcapBuilder::new(&path);
    pcap.add_pkt(&tcp_syn(client, server, 40000, 1234));
    pcap.add_pkt(&tcp_ack(client, server, 40000, 1234));
    pcap.add_pkt(&tcp_syn(client, server, 40000, 22));
    pcap.finish();

    let recs = replay(&path, &[]);
    let got: Vec<_> = recs.iter().map(|r| (r.conn, r.verdict)).collect();
    assert_eq!(
        got,
        [
            (ConnState::New, Verdict::Drop),
            // Nothing was admitted, so there is no flow to belong to.
            (ConnState::New, Verdict::Drop),
            (ConnState::New, Verdict::Accept),
        ]
    );
    std::fs::remove_file(&path).unwrap();
}
