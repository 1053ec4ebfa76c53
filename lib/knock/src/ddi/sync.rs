// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
//!
//! The gate must keep making decisions even if some other thread
//! panicked while holding a lock, so none of these wrappers propagate
//! lock poisoning: a poisoned lock is simply taken over.
use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

/// A mutex wrapper whose guard can be handed to a [`KCondvar`].
///
/// We name it `KMutex` on purpose: the API is not quite that of the
/// std `Mutex` (no poisoning is surfaced), and using the same name
/// would hide that.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KMutex<T> {
    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

impl<T: Default> Default for KMutex<T> {
    fn default() -> Self {
        KMutex::new(T::default())
    }
}

/// A reader-writer lock.
///
/// Any number of readers may hold the lock at once; a writer excludes
/// everyone else for the duration of its guard.
pub struct KRwLock<T> {
    inner: RwLock<T>,
}

impl<T: Default> Default for KRwLock<T> {
    fn default() -> Self {
        KRwLock::new(T::default())
    }
}

pub struct KRwLockReadGuard<'a, T: 'a> {
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct KRwLockWriteGuard<'a, T: 'a> {
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for KRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for KRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KRwLock<T> {
    pub fn new(val: T) -> Self {
        KRwLock { inner: RwLock::new(val) }
    }

    pub fn read(&self) -> KRwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        KRwLockReadGuard { guard }
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, T> {
        let guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        KRwLockWriteGuard { guard }
    }
}

pub struct KCondvar {
    cv: Condvar,
}

impl Default for KCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl KCondvar {
    pub fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    /// Wait to be notified, or for `dur` to elapse. Spurious wakeups
    /// are possible; callers must recheck their condition.
    pub fn wait_timeout<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
        dur: Duration,
    ) -> KMutexGuard<'a, T> {
        let (guard, _) = self
            .cv
            .wait_timeout(lock.guard, dur)
            .unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

#[derive(Default)]
struct TaskState {
    cancelled: bool,
    exited: bool,
}

/// Cancellation and exit signalling between a background task and
/// its owner.
///
/// The owner calls [`TaskCtl::cancel`] and then
/// [`TaskCtl::wait_exited`]; the task polls
/// [`TaskCtl::sleep_unless_cancelled`] (or
/// [`TaskCtl::is_cancelled`]) and holds an [`ExitGuard`] for its whole
/// lifetime, so that exit is signalled even if the task body panics.
#[derive(Default)]
pub struct TaskCtl {
    state: KMutex<TaskState>,
    cv: KCondvar,
}

impl TaskCtl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Sleep for `dur` unless cancelled first.
    ///
    /// Returns `true` if the task has been cancelled.
    pub fn sleep_unless_cancelled(&self, dur: Duration) -> bool {
        self.sleep_until_unless_cancelled(Instant::now() + dur)
    }

    /// Sleep until `deadline` unless cancelled first.
    ///
    /// Returns `true` if the task has been cancelled.
    pub fn sleep_until_unless_cancelled(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();

        loop {
            if state.cancelled {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            state = self.cv.wait_timeout(state, deadline - now);
        }
    }

    /// Wait up to `grace` for the task to exit.
    ///
    /// Returns `true` if the task has exited.
    pub fn wait_exited(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut state = self.state.lock();

        loop {
            if state.exited {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            state = self.cv.wait_timeout(state, deadline - now);
        }
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().exited
    }

    fn mark_exited(&self) {
        self.state.lock().exited = true;
        self.cv.notify_all();
    }

    /// Create the guard a task holds while it runs.
    pub fn exit_guard(&self) -> ExitGuard<'_> {
        ExitGuard { ctl: self }
    }
}

impl core::fmt::Debug for TaskCtl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskCtl")
            .field("cancelled", &self.is_cancelled())
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Marks the owning task as exited when dropped.
pub struct ExitGuard<'a> {
    ctl: &'a TaskCtl,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.ctl.mark_exited();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn cancel_wakes_sleeper() {
        let ctl = Arc::new(TaskCtl::new());
        let ctl2 = ctl.clone();
        let start = Instant::now();

        let hdl = thread::spawn(move || {
            let _guard = ctl2.exit_guard();
            ctl2.sleep_unless_cancelled(Duration::from_secs(60))
        });

        ctl.cancel();
        assert!(ctl.wait_exited(Duration::from_secs(10)));
        assert!(hdl.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn default_locks() {
        let lock: KRwLock<Option<u32>> = KRwLock::default();
        assert_eq!(*lock.read(), None);
        *lock.write() = Some(7);
        assert_eq!(*lock.read(), Some(7));

        let m: KMutex<Vec<u8>> = KMutex::default();
        assert!(m.lock().is_empty());
    }

    #[test]
    fn sleep_until_deadline() {
        let ctl = TaskCtl::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!ctl.sleep_until_unless_cancelled(deadline));
        assert!(Instant::now() >= deadline);

        // A deadline already passed returns at once.
        assert!(!ctl.sleep_until_unless_cancelled(deadline));
        ctl.cancel();
        assert!(ctl.sleep_until_unless_cancelled(deadline));
    }

    #[test]
    fn sleep_times_out() {
        let ctl = TaskCtl::new();
        assert!(!ctl.sleep_unless_cancelled(Duration::from_millis(10)));
        assert!(!ctl.is_cancelled());
    }

    #[test]
    fn exit_on_panic() {
        let ctl = Arc::new(TaskCtl::new());
        let ctl2 = ctl.clone();

        let res = thread::spawn(move || {
            let _guard = ctl2.exit_guard();
            panic!("task body failed");
        })
        .join();

        assert!(res.is_err());
        assert!(ctl.has_exited());
    }

    #[test]
    fn rwlock_survives_poison() {
        let lock = Arc::new(KRwLock::new(5u32));
        let lock2 = lock.clone();

        let _ = thread::spawn(move || {
            let _guard = lock2.write();
            panic!("poison the lock");
        })
        .join();

        assert_eq!(*lock.read(), 5);
        *lock.write() = 6;
        assert_eq!(*lock.read(), 6);
    }
}
