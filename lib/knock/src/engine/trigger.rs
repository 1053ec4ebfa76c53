// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Trigger reception and authorization.
//!
//! How a trigger is recognized and validated is up to the
//! [`TriggerSource`]; by the time one is handed to the listener it is
//! already trusted. The listener's only job is to turn it into a state
//! table insert via the [`Authorizer`], which is the one write entry
//! point into the table.

use super::stat::GateStats;
use super::state_table::StateEntry;
use super::state_table::StateTable;
use crate::ddi::sync::TaskCtl;
use crate::ddi::time::Moment;
use core::fmt;
use core::time::Duration;
use knock_api::IpAddr;
use knock_api::KnockError;
use knock_api::PortSel;
use slog::Logger;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::thread::JoinHandle;

pub const LISTENER_NAME: &str = "knock-trigger";

/// A validated request to authorize `addr` for `port`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Trigger {
    pub addr: IpAddr,
    pub port: PortSel,
}

impl Trigger {
    pub fn new(addr: IpAddr, port: PortSel) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.addr, self.port)
    }
}

/// A source of validated triggers.
///
/// The listener polls its source with a timeout so that it can notice
/// cancellation; an implementation must return within roughly
/// `timeout` even when nothing arrives.
pub trait TriggerSource: Send {
    /// Wait up to `timeout` for the next trigger.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    fn recv_trigger(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Trigger>, KnockError>;
}

/// A trigger source fed over a std channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Trigger>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::Sender<Trigger>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl TriggerSource for ChannelSource {
    fn recv_trigger(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Trigger>, KnockError> {
        match self.rx.recv_timeout(timeout) {
            Ok(trigger) => Ok(Some(trigger)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(KnockError::Trigger("channel disconnected".to_string()))
            }
        }
    }
}

/// Inserts authorizations into the state table.
#[derive(Clone)]
pub struct Authorizer {
    table: Arc<StateTable>,
    stats: Arc<GateStats>,
    log: Logger,
}

impl Authorizer {
    pub fn new(
        table: Arc<StateTable>,
        stats: Arc<GateStats>,
        log: &Logger,
    ) -> Self {
        Self { table, stats, log: log.new(o!("component" => "authorizer")) }
    }

    /// Authorize `addr` for `port` as of now, refreshing any existing
    /// authorization for the same pair.
    pub fn authorize(
        &self,
        addr: IpAddr,
        port: PortSel,
    ) -> Result<(), KnockError> {
        self.authorize_at(addr, port, Moment::now())
    }

    /// Authorize `addr` for `port` as of `now`.
    ///
    /// # Errors
    ///
    /// The authorization fails closed: if the table is full
    /// ([`KnockError::MaxCapacity`]) or closed
    /// ([`KnockError::BadState`]) nothing is inserted.
    pub fn authorize_at(
        &self,
        addr: IpAddr,
        port: PortSel,
        now: Moment,
    ) -> Result<(), KnockError> {
        let entry = StateEntry::new(addr, port, now);

        match self.table.insert(entry) {
            Ok(()) => {
                self.stats.authorized.incr();
                info!(self.log, "source authorized"; "key" => %entry);
                Ok(())
            }

            Err(e) => {
                self.stats.auth_rejected.incr();
                warn!(self.log, "authorization refused";
                    "key" => %entry,
                    "err" => %e,
                );
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer").field("table", &self.table).finish()
    }
}

/// The thread that drains a [`TriggerSource`] into the [`Authorizer`].
#[derive(Debug)]
pub struct TriggerListener {
    name: String,
    ctl: Arc<TaskCtl>,
    hdl: Option<JoinHandle<()>>,
}

impl TriggerListener {
    /// Spawn the listener thread.
    ///
    /// An error from the source is logged and the listener backs off
    /// for one `poll` before trying again; it only exits when
    /// stopped.
    pub fn start(
        name: &str,
        source: Box<dyn TriggerSource>,
        authorizer: Authorizer,
        poll: Duration,
        log: &Logger,
    ) -> Result<Self, KnockError> {
        if poll.is_zero() {
            return Err(KnockError::BadConfig(
                "trigger poll interval must be non-zero".to_string(),
            ));
        }

        let ctl = Arc::new(TaskCtl::new());
        let task_ctl = ctl.clone();
        let log = log.new(o!("component" => "listener"));
        let task_log = log.clone();
        let mut source = source;

        let hdl = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _exit = task_ctl.exit_guard();
                listen(
                    &task_ctl,
                    source.as_mut(),
                    &authorizer,
                    poll,
                    &task_log,
                );
            })
            .map_err(|e| KnockError::TaskStart {
                task: name.to_string(),
                msg: e.to_string(),
            })?;

        info!(log, "trigger listener started"; "name" => name);
        Ok(Self { name: name.to_string(), ctl, hdl: Some(hdl) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the listener, waiting up to `grace` for it to exit.
    ///
    /// # Errors
    ///
    /// If the thread is still inside its source after `grace` it is
    /// detached and [`KnockError::StopTimeout`] is returned. It never
    /// takes another trigger from the source.
    pub fn stop(mut self, grace: Duration) -> Result<(), KnockError> {
        self.shutdown(grace)
    }

    fn shutdown(&mut self, grace: Duration) -> Result<(), KnockError> {
        let Some(hdl) = self.hdl.take() else {
            return Ok(());
        };

        self.ctl.cancel();
        if self.ctl.wait_exited(grace) {
            let _ = hdl.join();
            Ok(())
        } else {
            Err(KnockError::StopTimeout {
                task: self.name.clone(),
                grace_ms: grace.as_millis() as u64,
            })
        }
    }
}

impl Drop for TriggerListener {
    fn drop(&mut self) {
        let _ = self.shutdown(Duration::from_secs(1));
    }
}

fn listen(
    ctl: &TaskCtl,
    source: &mut dyn TriggerSource,
    authorizer: &Authorizer,
    poll: Duration,
    log: &Logger,
) {
    // Only the first error of a run is logged.
    let mut failing = false;

    while !ctl.is_cancelled() {
        match source.recv_trigger(poll) {
            Ok(Some(trigger)) => {
                if failing {
                    info!(log, "trigger source recovered");
                    failing = false;
                }

                // A cancelled listener takes no further action, even
                // on a trigger it has already received.
                if ctl.is_cancelled() {
                    break;
                }

                // Failures are logged and counted by the authorizer.
                let _ = authorizer.authorize(trigger.addr, trigger.port);
            }

            Ok(None) => {
                if failing {
                    info!(log, "trigger source recovered");
                    failing = false;
                }
            }

            Err(e) => {
                if !failing {
                    warn!(log, "trigger source failed"; "err" => %e);
                    failing = true;
                }

                if ctl.sleep_unless_cancelled(poll) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::num::NonZeroU32;
    use std::time::Instant;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn authorizer(limit: u32) -> (Authorizer, Arc<StateTable>, Arc<GateStats>) {
        let table = Arc::new(StateTable::new(NonZeroU32::new(limit).unwrap()));
        let stats = Arc::new(GateStats::new());
        let auth = Authorizer::new(table.clone(), stats.clone(), &discard());
        (auth, table, stats)
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition never met");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn authorize_is_idempotent() {
        let (auth, table, stats) = authorizer(4);
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        let t0 = Moment::now();
        let t1 = t0 + Duration::from_secs(10);

        auth.authorize_at(addr, PortSel::Port(1234), t0).unwrap();
        auth.authorize_at(addr, PortSel::Port(1234), t1).unwrap();
        assert_eq!(table.num_entries(), 1);
        let key = knock_api::AuthKey::new(addr, PortSel::Port(1234));
        assert_eq!(table.lookup(&key).unwrap().inserted_at(), t1);
        assert_eq!(stats.snapshot().authorized, 2);
    }

    #[test]
    fn authorize_fails_closed() {
        let (auth, table, stats) = authorizer(1);
        auth.authorize("10.0.0.1".parse().unwrap(), PortSel::Any).unwrap();
        let res = auth.authorize("10.0.0.2".parse().unwrap(), PortSel::Any);
        assert_eq!(res, Err(KnockError::MaxCapacity(1)));
        assert_eq!(table.num_entries(), 1);
        assert_eq!(stats.snapshot().auth_rejected, 1);

        table.close();
        let res = auth.authorize("10.0.0.1".parse().unwrap(), PortSel::Any);
        assert!(matches!(res, Err(KnockError::BadState(_))));
    }

    #[test]
    fn channel_source() {
        let (tx, mut src) = ChannelSource::new();
        let t = Trigger::new("10.0.0.5".parse().unwrap(), PortSel::Port(22));
        tx.send(t).unwrap();
        assert_eq!(src.recv_trigger(Duration::from_millis(10)), Ok(Some(t)));
        assert_eq!(src.recv_trigger(Duration::from_millis(10)), Ok(None));
        drop(tx);
        assert!(matches!(
            src.recv_trigger(Duration::from_millis(10)),
            Err(KnockError::Trigger(_))
        ));
    }

    #[test]
    fn listener_inserts_and_stops() {
        let (auth, table, _) = authorizer(16);
        let (tx, src) = ChannelSource::new();
        let listener = TriggerListener::start(
            "listener-test",
            Box::new(src),
            auth,
            Duration::from_millis(10),
            &discard(),
        )
        .unwrap();
        assert_eq!(listener.name(), "listener-test");

        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        tx.send(Trigger::new(addr, PortSel::Port(1234))).unwrap();
        wait_for(|| table.is_authorized(addr, 1234));

        listener.stop(Duration::from_secs(5)).unwrap();

        // Nothing is taken from the source once stopped.
        let late: IpAddr = "10.0.0.6".parse().unwrap();
        let _ = tx.send(Trigger::new(late, PortSel::Any));
        thread::sleep(Duration::from_millis(50));
        assert!(!table.is_authorized(late, 1234));
    }

    #[test]
    fn listener_survives_source_errors() {
        let (auth, _, _) = authorizer(16);
        let (tx, src) = ChannelSource::new();
        drop(tx);

        let listener = TriggerListener::start(
            "listener-err",
            Box::new(src),
            auth,
            Duration::from_millis(10),
            &discard(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(!listener.ctl.has_exited());
        listener.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn zero_poll_refused() {
        let (auth, _, _) = authorizer(16);
        let (_tx, src) = ChannelSource::new();
        let res = TriggerListener::start(
            "listener-zero",
            Box::new(src),
            auth,
            Duration::ZERO,
            &discard(),
        );
        assert!(matches!(res, Err(KnockError::BadConfig(_))));
    }
}
