// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The gate context.
//!
//! A [`KnockCtx`] owns every piece of process-wide gate state: the
//! state table, the counters, the decision function, and (while
//! running) the reaper, the trigger listener and the ingress hook
//! registration. A context is used once:
//!
//! ```text
//! Init --start()--> Running --stop()--> Stopped
//!   |                                      ^
//!   +-----------start() fails--------------+
//! ```
//!
//! Stopping seals the state table before anything else, after which
//! nothing can modify it again.

use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use crate::engine::gate::PacketGate;
use crate::engine::reaper::Reaper;
use crate::engine::stat::GateStats;
use crate::engine::state_table::StateTable;
use crate::engine::state_table::Ttl;
use crate::engine::trigger::Authorizer;
use crate::engine::trigger::LISTENER_NAME;
use crate::engine::trigger::TriggerListener;
use crate::provider::IngressFn;
use crate::provider::IngressProvider;
use crate::provider::Providers;
use core::fmt;
use core::num::NonZeroU32;
use knock_api::ConnState;
use knock_api::DumpStateResp;
use knock_api::GateCfg;
use knock_api::GateStatsSnap;
use knock_api::KnockError;
use slog::Logger;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;

type Result<T> = core::result::Result<T, KnockError>;

struct Running {
    ingress: Arc<dyn IngressProvider>,
    listener: TriggerListener,
    reaper: Reaper,
}

enum CtxState {
    Init,
    Running(Running),
    Stopped,
}

impl CtxState {
    fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running(_) => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// The outcome of [`KnockCtx::stop`].
///
/// Teardown always runs to completion; anything that went wrong along
/// the way is collected here rather than cutting it short.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StopReport {
    /// Authorizations discarded when the table was closed.
    pub drained: usize,
    pub errors: Vec<KnockError>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct KnockCtx {
    cfg: GateCfg,
    table: Arc<StateTable>,
    stats: Arc<GateStats>,
    gate: Arc<PacketGate>,
    authorizer: Authorizer,
    state: KMutex<CtxState>,
    log: Logger,
}

impl KnockCtx {
    /// Create a new context from a configuration.
    ///
    /// # Errors
    ///
    /// The configuration is validated first; see
    /// [`GateCfg::validate`].
    pub fn new(cfg: GateCfg, log: &Logger) -> Result<Self> {
        cfg.validate()?;

        let limit = NonZeroU32::new(cfg.max_entries).ok_or_else(|| {
            KnockError::BadConfig("max_entries must be non-zero".to_string())
        })?;
        let table = Arc::new(StateTable::new(limit));
        let stats = Arc::new(GateStats::new());
        let gate = Arc::new(PacketGate::new(
            table.clone(),
            &cfg.protected_ports(),
            stats.clone(),
        ));
        let ports = format!("{:?}", gate.protected_ports());
        let log = log.new(o!("gate" => ports));
        let authorizer = Authorizer::new(table.clone(), stats.clone(), &log);

        Ok(Self {
            cfg,
            table,
            stats,
            gate,
            authorizer,
            state: KMutex::new(CtxState::Init),
            log,
        })
    }

    /// Start the gate: the reaper, then the trigger listener, and
    /// finally the ingress hook.
    ///
    /// # Errors
    ///
    /// Calling this on a context that is not freshly created is
    /// [`KnockError::BadState`]. If any piece fails to start, the
    /// pieces already started are torn down, the context moves to
    /// stopped, and the error is returned.
    pub fn start(&self, providers: Providers) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, CtxState::Init) {
            return Err(KnockError::BadState(format!(
                "cannot start a context that is {}",
                state.name()
            )));
        }

        match self.start_tasks(providers) {
            Ok(running) => {
                *state = CtxState::Running(running);
                info!(self.log, "gate started";
                    "timeout_ms" => self.cfg.timeout_ms,
                    "max_entries" => self.cfg.max_entries,
                );
                Ok(())
            }

            Err(e) => {
                *state = CtxState::Stopped;
                self.table.close();
                error!(self.log, "gate failed to start"; "err" => %e);
                Err(e)
            }
        }
    }

    fn start_tasks(&self, providers: Providers) -> Result<Running> {
        let grace = self.cfg.shutdown_grace();
        let Providers { ingress, trigger } = providers;

        let reaper = Reaper::start(
            self.table.clone(),
            Ttl::new_millis(self.cfg.timeout_ms),
            self.stats.clone(),
            &self.log,
        )?;

        let listener = match TriggerListener::start(
            LISTENER_NAME,
            trigger,
            self.authorizer.clone(),
            self.cfg.trigger_poll(),
            &self.log,
        ) {
            Ok(listener) => listener,
            Err(e) => {
                self.log_rollback(reaper.stop(grace));
                return Err(e);
            }
        };

        let gate = self.gate.clone();
        let hook: IngressFn = Arc::new(move |pkt: &[u8], conn: ConnState| {
            gate.process(pkt, conn)
        });
        if let Err(e) = ingress.register(hook) {
            self.log_rollback(listener.stop(grace));
            self.log_rollback(reaper.stop(grace));
            return Err(e);
        }

        Ok(Running { ingress, listener, reaper })
    }

    fn log_rollback(&self, res: Result<()>) {
        if let Err(e) = res {
            warn!(self.log, "rollback incomplete"; "err" => %e);
        }
    }

    /// Stop the gate.
    ///
    /// The table is sealed against mutation first. The listener is
    /// then stopped, then the reaper. The table is then closed, and
    /// finally the ingress hook is unregistered.
    ///
    /// # Errors
    ///
    /// Only a context that is running can be stopped; anything else is
    /// [`KnockError::BadState`]. Failures during teardown do not
    /// return an error, they are listed in the [`StopReport`].
    pub fn stop(&self) -> Result<StopReport> {
        let mut state = self.state.lock();
        let running = match core::mem::replace(&mut *state, CtxState::Stopped)
        {
            CtxState::Running(running) => running,
            other => {
                let name = other.name();
                *state = other;
                return Err(KnockError::BadState(format!(
                    "cannot stop a context that is {name}"
                )));
            }
        };

        let report = self.teardown(running);
        if report.is_clean() {
            info!(self.log, "gate stopped"; "drained" => report.drained);
        } else {
            for e in &report.errors {
                warn!(self.log, "gate teardown"; "err" => %e);
            }
        }

        Ok(report)
    }

    fn teardown(&self, running: Running) -> StopReport {
        let grace = self.cfg.shutdown_grace();
        let Running { ingress, listener, reaper } = running;
        let mut report = StopReport::default();

        // Nothing may change the table once teardown has begun, even
        // through an authorizer handle or a listener that outlives its
        // grace period.
        self.table.seal();

        if let Err(e) = listener.stop(grace) {
            report.errors.push(e);
        }

        if let Err(e) = reaper.stop(grace) {
            report.errors.push(e);
        }

        report.drained = self.table.close();
        ingress.unregister();
        report
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), CtxState::Running(_))
    }

    pub fn cfg(&self) -> &GateCfg {
        &self.cfg
    }

    /// The decision function the ingress hook runs.
    pub fn gate(&self) -> &Arc<PacketGate> {
        &self.gate
    }

    /// The write entry point into the state table, for callers that
    /// validate triggers themselves.
    pub fn authorizer(&self) -> Authorizer {
        self.authorizer.clone()
    }

    pub fn stats(&self) -> GateStatsSnap {
        self.stats.snapshot()
    }

    pub fn dump_state(&self) -> DumpStateResp {
        DumpStateResp {
            timeout_ms: self.cfg.timeout_ms,
            limit: self.table.get_limit().get(),
            entries: self.table.dump(Moment::now()),
        }
    }
}

impl Drop for KnockCtx {
    fn drop(&mut self) {
        let state =
            core::mem::replace(&mut *self.state.lock(), CtxState::Stopped);
        if let CtxState::Running(running) = state {
            let _ = self.teardown(running);
        }
    }
}

impl fmt::Debug for KnockCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnockCtx")
            .field("cfg", &self.cfg)
            .field("state", &self.state.lock().name())
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::trigger::ChannelSource;
    use crate::engine::trigger::Trigger;
    use crate::engine::trigger::TriggerSource;
    use crate::provider::LocalIngress;
    use core::time::Duration;
    use knock_api::IpAddr;
    use knock_api::PortSel;
    use knock_api::Verdict;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn local_providers()
    -> (Arc<LocalIngress>, mpsc::Sender<Trigger>, Providers) {
        let ingress = Arc::new(LocalIngress::new());
        let (tx, src) = ChannelSource::new();
        let providers =
            Providers { ingress: ingress.clone(), trigger: Box::new(src) };
        (ingress, tx, providers)
    }

    struct FailingIngress;

    impl IngressProvider for FailingIngress {
        fn register(&self, _hook: IngressFn) -> Result<()> {
            Err(KnockError::Hook("no receive path".to_string()))
        }

        fn unregister(&self) {}
    }

    #[test]
    fn lifecycle() {
        let ctx = KnockCtx::new(GateCfg::default(), &discard()).unwrap();
        let (ingress, tx, providers) = local_providers();
        assert!(!ingress.is_registered());

        ctx.start(providers).unwrap();
        assert!(ctx.is_running());
        assert!(ingress.is_registered());

        let src: IpAddr = "10.0.0.5".parse().unwrap();
        let verdict = ctx.gate().decide(src, 1234, ConnState::New);
        assert_eq!(verdict, Verdict::Drop);

        tx.send(Trigger::new(src, PortSel::Port(1234))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while ctx.dump_state().entries.is_empty() {
            assert!(Instant::now() < deadline, "trigger never applied");
            thread::sleep(Duration::from_millis(5));
        }

        let dump = ctx.dump_state();
        assert_eq!(dump.timeout_ms, 30_000);
        assert_eq!(dump.limit, 8192);
        assert_eq!(dump.entries[0].addr, src);
        let verdict = ctx.gate().decide(src, 1234, ConnState::New);
        assert_eq!(verdict, Verdict::Accept);

        let report = ctx.stop().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.drained, 1);
        assert!(!ctx.is_running());
        assert!(!ingress.is_registered());
        assert!(ctx.dump_state().entries.is_empty());

        // No mutation after teardown.
        let res = ctx.authorizer().authorize(src, PortSel::Any);
        assert!(matches!(res, Err(KnockError::BadState(_))));
        assert_eq!(ctx.stats().authorized, 1);
    }

    #[test]
    fn single_use() {
        let ctx = KnockCtx::new(GateCfg::default(), &discard()).unwrap();
        assert!(matches!(ctx.stop(), Err(KnockError::BadState(_))));

        let (_ingress, _tx, providers) = local_providers();
        ctx.start(providers).unwrap();

        let (_ingress2, _tx2, again) = local_providers();
        assert!(matches!(ctx.start(again), Err(KnockError::BadState(_))));

        ctx.stop().unwrap();
        assert!(matches!(ctx.stop(), Err(KnockError::BadState(_))));

        let (_ingress3, _tx3, after) = local_providers();
        assert!(matches!(ctx.start(after), Err(KnockError::BadState(_))));
    }

    #[test]
    fn hook_failure_rolls_back() {
        let ctx = KnockCtx::new(GateCfg::default(), &discard()).unwrap();
        let (_tx, src) = ChannelSource::new();
        let providers = Providers {
            ingress: Arc::new(FailingIngress),
            trigger: Box::new(src),
        };

        let err = ctx.start(providers).unwrap_err();
        assert!(matches!(err, KnockError::Hook(_)));
        assert!(!ctx.is_running());

        // Everything was torn down, including the table.
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        let res = ctx.authorizer().authorize(addr, PortSel::Port(22));
        assert!(matches!(res, Err(KnockError::BadState(_))));
    }

    #[test]
    fn bad_config_refused() {
        let cfg = GateCfg { timeout_ms: 0, ..Default::default() };
        assert!(matches!(
            KnockCtx::new(cfg, &discard()),
            Err(KnockError::BadConfig(_))
        ));

        let cfg = GateCfg {
            additional_ports: (2000..2010).collect(),
            ..Default::default()
        };
        assert_eq!(
            KnockCtx::new(cfg, &discard()).unwrap_err(),
            KnockError::MaxPorts { count: 11, max: 10 }
        );
    }

    // A source that stays inside `recv_trigger` until released,
    // whatever the poll timeout.
    struct HeldSource {
        release: mpsc::Receiver<()>,
    }

    impl TriggerSource for HeldSource {
        fn recv_trigger(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<Trigger>> {
            let _ = self.release.recv_timeout(Duration::from_secs(10));
            Ok(None)
        }
    }

    #[test]
    fn no_insert_once_stop_begins() {
        let cfg = GateCfg { shutdown_grace_ms: 10_000, ..Default::default() };
        let ctx = KnockCtx::new(cfg, &discard()).unwrap();
        let (release, held) = mpsc::channel();
        let ingress = Arc::new(LocalIngress::new());
        ctx.start(Providers {
            ingress: ingress.clone(),
            trigger: Box::new(HeldSource { release: held }),
        })
        .unwrap();

        let early: IpAddr = "10.0.0.5".parse().unwrap();
        let late: IpAddr = "10.0.0.9".parse().unwrap();
        let authorizer = ctx.authorizer();
        authorizer.authorize(early, PortSel::Any).unwrap();

        let report = thread::scope(|s| {
            let stopper = s.spawn(|| ctx.stop());

            // The listener cannot exit until released, so the stop is
            // still in progress while we wait for the seal.
            let deadline = Instant::now() + Duration::from_secs(5);
            while !ctx.table.is_closed() {
                assert!(Instant::now() < deadline, "table never sealed");
                thread::sleep(Duration::from_millis(5));
            }

            let res = authorizer.authorize(late, PortSel::Any);
            assert!(matches!(res, Err(KnockError::BadState(_))));
            let res = authorizer.authorize(early, PortSel::Any);
            assert!(matches!(res, Err(KnockError::BadState(_))));

            release.send(()).unwrap();
            stopper.join().unwrap()
        })
        .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.drained, 1);
        assert_eq!(ctx.stats().authorized, 1);
        assert_eq!(ctx.stats().auth_rejected, 2);
        assert!(!ingress.is_registered());
    }

    #[test]
    fn drop_stops_running_ctx() {
        let (ingress, _tx, providers) = local_providers();
        {
            let ctx = KnockCtx::new(GateCfg::default(), &discard()).unwrap();
            ctx.start(providers).unwrap();
            assert!(ingress.is_registered());
        }
        assert!(!ingress.is_registered());
    }
}
