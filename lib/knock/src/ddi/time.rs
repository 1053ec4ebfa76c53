// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Moments, periodics, etc.

use super::sync::TaskCtl;
use core::ops::Add;
use core::time::Duration;
use knock_api::KnockError;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
///
/// Moments are monotonic; they never go backwards and are unaffected
/// by changes to the wall clock.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. A moment earlier than `earlier` yields zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

/// An interval designed specifically for a [`Periodic`].
///
/// A zero interval would turn the periodic into a busy loop, so it is
/// rejected at construction.
#[derive(Clone, Copy, Debug)]
pub struct Interval(Duration);

impl Interval {
    pub const fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn from_duration(dur: Duration) -> Result<Self, KnockError> {
        if dur.is_zero() {
            return Err(KnockError::BadConfig(
                "periodic interval must be non-zero".to_string(),
            ));
        }

        Ok(Self(dur))
    }

    pub fn from_millis(ms: u64) -> Result<Self, KnockError> {
        Self::from_duration(Duration::from_millis(ms))
    }
}

/// Execute a callback periodically on a dedicated thread.
///
/// The `Box<T>` is owned by the periodic and the callback is passed an
/// `&mut T`. The first call happens one interval after creation, and
/// call `n` is due `n` intervals after creation regardless of how
/// long earlier calls took. The
/// wait between calls is cancellable; a call that is in flight when
/// the periodic is cancelled is allowed to finish.
///
/// NOTE: A periodic **cannot** implement `Clone` as it represents a
/// unique resource on the system.
#[derive(Debug)]
pub struct Periodic {
    name: String,
    interval: Interval,
    ctl: Arc<TaskCtl>,
    hdl: Option<JoinHandle<()>>,
}

impl Periodic {
    /// Create a new periodic.
    ///
    /// # Errors
    ///
    /// If the backing thread cannot be spawned,
    /// [`KnockError::TaskStart`] is returned and the callback is never
    /// run.
    pub fn new<T: Send + 'static>(
        name: &str,
        cb: fn(&mut T),
        arg: Box<T>,
        interval: Interval,
    ) -> Result<Self, KnockError> {
        let ctl = Arc::new(TaskCtl::new());
        let task_ctl = ctl.clone();
        let period = interval.as_duration();
        let mut arg = arg;

        let hdl = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _exit = task_ctl.exit_guard();
                let mut next = Instant::now() + period;
                while !task_ctl.sleep_until_unless_cancelled(next) {
                    cb(&mut arg);

                    // Ticks stay on a fixed schedule; ticks missed
                    // while the callback overran are skipped.
                    let now = Instant::now();
                    next += period;
                    while next <= now {
                        next += period;
                    }
                }
            })
            .map_err(|e| KnockError::TaskStart {
                task: name.to_string(),
                msg: e.to_string(),
            })?;

        Ok(Self { name: name.to_string(), interval, ctl, hdl: Some(hdl) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Cancel the periodic, waiting up to `grace` for an in-flight
    /// callback to finish.
    ///
    /// # Errors
    ///
    /// If the thread has not exited within `grace` it is detached and
    /// [`KnockError::StopTimeout`] is returned. The callback will not
    /// be invoked again either way.
    pub fn cancel(mut self, grace: Duration) -> Result<(), KnockError> {
        self.stop(grace)
    }

    fn stop(&mut self, grace: Duration) -> Result<(), KnockError> {
        let Some(hdl) = self.hdl.take() else {
            return Ok(());
        };

        self.ctl.cancel();
        if self.ctl.wait_exited(grace) {
            // The thread has released everything it owned; joining
            // only reaps it.
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

impl Drop for Periodic {
    fn drop(&mut self) {
        let _ = self.stop(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ddi::sync::KMutex;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    #[test]
    fn moment_delta() {
        let now = Moment::now();
        let later = now + Duration::from_millis(30_050);
        assert_eq!(later.delta_as_millis(now), 30_050);
        // Never negative.
        assert_eq!(now.delta_as_millis(later), 0);
    }

    #[test]
    fn bad_interval() {
        assert!(Interval::from_duration(Duration::ZERO).is_err());
        assert!(Interval::from_millis(0).is_err());
    }

    #[test]
    fn good_interval() {
        let x = Interval::from_millis(1_500).unwrap();
        assert_eq!(x.as_duration(), Duration::new(1, 500_000_000));
    }

    fn bump(count: &mut Arc<AtomicU64>) {
        count.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn periodic_fires_and_cancels() {
        let count = Arc::new(AtomicU64::new(0));
        let p = Periodic::new(
            "periodic-test",
            bump,
            Box::new(count.clone()),
            Interval::from_millis(10).unwrap(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while count.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "periodic never fired");
            thread::sleep(Duration::from_millis(5));
        }

        p.cancel(Duration::from_secs(5)).unwrap();
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[test]
    fn cancel_is_prompt() {
        let count = Arc::new(AtomicU64::new(0));
        let p = Periodic::new(
            "periodic-long",
            bump,
            Box::new(count.clone()),
            Interval::from_millis(60_000).unwrap(),
        )
        .unwrap();

        let start = Instant::now();
        p.cancel(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    fn record(calls: &mut Arc<KMutex<Vec<Instant>>>) {
        calls.lock().push(Instant::now());
        thread::sleep(Duration::from_millis(80));
    }

    #[test]
    fn periodic_does_not_drift() {
        let calls = Arc::new(KMutex::new(vec![]));
        let start = Instant::now();
        let p = Periodic::new(
            "periodic-slow",
            record,
            Box::new(calls.clone()),
            Interval::from_millis(100).unwrap(),
        )
        .unwrap();

        let deadline = start + Duration::from_secs(10);
        while calls.lock().len() < 4 {
            assert!(Instant::now() < deadline, "periodic never fired");
            thread::sleep(Duration::from_millis(5));
        }
        p.cancel(Duration::from_secs(5)).unwrap();

        // Sleeping a full period after each 80ms callback would put
        // the fourth call at 640ms.
        let fourth = calls.lock()[3].duration_since(start);
        assert!(fourth >= Duration::from_millis(400), "{fourth:?}");
        assert!(fourth < Duration::from_millis(550), "{fourth:?}");
    }

    fn stall(_: &mut ()) {
        thread::sleep(Duration::from_millis(500));
    }

    #[test]
    fn cancel_reports_stuck_callback() {
        let p = Periodic::new(
            "periodic-stall",
            stall,
            Box::new(()),
            Interval::from_millis(10).unwrap(),
        )
        .unwrap();

        // Give the first callback a chance to start.
        thread::sleep(Duration::from_millis(100));
        let res = p.cancel(Duration::from_millis(1));
        assert!(matches!(res, Err(KnockError::StopTimeout { .. })));
    }
}
