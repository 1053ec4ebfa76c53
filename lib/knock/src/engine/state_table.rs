// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The authorization state table.
//!
//! The table maps an [`AuthKey`] (source address plus port) to the
//! [`StateEntry`] created when that source was authorized. It is
//! shared by three parties:
//!
//! * the packet path, which only ever reads (via [`StateTable::lookup`]
//!   and [`StateTable::is_authorized`]),
//! * the trigger listener, the sole inserter,
//! * the reaper, the sole remover of stale entries.
//!
//! Entries are small `Copy` values. A reader always walks away with
//! its own copy, so there is no way for it to observe an entry that is
//! being removed: it either saw the entry before the removal took the
//! write lock, or it sees nothing after.
//!
//! Every write-side critical section is a single map mutation. In
//! particular a sweep never holds the write lock across the whole
//! table: it snapshots under the read lock and then removes each
//! expired key on its own.

use super::super::ddi::sync::KRwLock;
use super::super::ddi::time::MILLIS;
use super::super::ddi::time::Moment;
use core::fmt;
use core::num::NonZeroU32;
use knock_api::AuthKey;
use knock_api::IpAddr;
use knock_api::KnockError;
use knock_api::PortSel;
use knock_api::StateEntryDump;
use std::collections::BTreeMap;

type Result<T> = core::result::Result<T, KnockError>;

/// The Time To Live in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ttl(u64);

impl Ttl {
    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    /// Has an entry inserted at `inserted_at` outlived this TTL as of
    /// `now`?
    pub fn is_expired(&self, inserted_at: Moment, now: Moment) -> bool {
        now.delta_as_millis(inserted_at) >= self.0
    }

    /// Create a new TTL based on seconds.
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }

    /// Create a new TTL based on milliseconds.
    pub const fn new_millis(millis: u64) -> Self {
        Ttl(millis)
    }
}

/// A single authorized source.
///
/// An entry is never modified once created. Refreshing an
/// authorization replaces the entry wholesale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StateEntry {
    addr: IpAddr,
    port: PortSel,
    inserted_at: Moment,
}

impl StateEntry {
    pub fn new(addr: IpAddr, port: PortSel, inserted_at: Moment) -> Self {
        Self { addr, port, inserted_at }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> PortSel {
        self.port
    }

    pub fn inserted_at(&self) -> Moment {
        self.inserted_at
    }

    pub fn key(&self) -> AuthKey {
        AuthKey::new(self.addr, self.port)
    }

    pub fn is_expired(&self, now: Moment, ttl: Ttl) -> bool {
        ttl.is_expired(self.inserted_at, now)
    }

    fn dump(&self, now: Moment) -> StateEntryDump {
        StateEntryDump {
            addr: self.addr,
            port: self.port,
            age_ms: now.delta_as_millis(self.inserted_at),
        }
    }
}

impl fmt::Display for StateEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Default)]
struct TableInner {
    // Once closed the table is empty and stays empty: every further
    // mutation is refused.
    closed: bool,
    map: BTreeMap<AuthKey, StateEntry>,
}

pub struct StateTable {
    limit: NonZeroU32,
    inner: KRwLock<TableInner>,
}

impl fmt::Debug for StateTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StateTable")
            .field("limit", &self.limit)
            .field("closed", &inner.closed)
            .field("entries", &inner.map.len())
            .finish()
    }
}

impl StateTable {
    pub fn new(limit: NonZeroU32) -> Self {
        Self { limit, inner: KRwLock::new(TableInner::default()) }
    }

    /// Add an entry to the table, replacing (and thereby refreshing)
    /// any existing entry with the same key.
    ///
    /// # Errors
    ///
    /// If the key is not already present and the table is at max
    /// capacity, [`KnockError::MaxCapacity`] is returned and no
    /// modification is made to the table.
    ///
    /// If the table has been closed, [`KnockError::BadState`] is
    /// returned.
    pub fn insert(&self, entry: StateEntry) -> Result<()> {
        let key = entry.key();
        let mut inner = self.inner.write();

        if inner.closed {
            return Err(KnockError::BadState("state table closed".to_string()));
        }

        if inner.map.len() >= self.limit.get() as usize
            && !inner.map.contains_key(&key)
        {
            return Err(KnockError::MaxCapacity(u64::from(self.limit.get())));
        }

        inner.map.insert(key, entry);
        Ok(())
    }

    /// Get a copy of the entry for a given key, if one exists.
    pub fn lookup(&self, key: &AuthKey) -> Option<StateEntry> {
        self.inner.read().map.get(key).copied()
    }

    /// Is `addr` authorized for `port`, either explicitly or via a
    /// wildcard authorization?
    ///
    /// Both keys are checked under a single read lock.
    pub fn is_authorized(&self, addr: IpAddr, port: u16) -> bool {
        let inner = self.inner.read();
        inner.map.contains_key(&AuthKey::new(addr, PortSel::Port(port)))
            || inner.map.contains_key(&AuthKey::new(addr, PortSel::Any))
    }

    /// Remove the entry for `key`, returning whether one was present.
    pub fn remove(&self, key: &AuthKey) -> bool {
        let mut inner = self.inner.write();
        if inner.closed {
            return false;
        }
        inner.map.remove(key).is_some()
    }

    /// Remove the entry for `key` only if it is expired as of `now`.
    ///
    /// The check is repeated under the write lock, so an entry that
    /// was refreshed after the caller decided to remove it survives.
    /// Returns the removed entry.
    pub fn remove_expired(
        &self,
        key: &AuthKey,
        now: Moment,
        ttl: Ttl,
    ) -> Option<StateEntry> {
        let mut inner = self.inner.write();
        if inner.closed {
            return None;
        }

        let expired =
            inner.map.get(key).is_some_and(|entry| entry.is_expired(now, ttl));

        if expired { inner.map.remove(key) } else { None }
    }

    /// Copy out every entry currently in the table.
    ///
    /// Entries inserted while the copy is being taken either appear in
    /// it or do not; every entry returned was live at the time of the
    /// copy.
    pub fn for_each_snapshot(&self) -> Vec<(AuthKey, StateEntry)> {
        let inner = self.inner.read();
        inner.map.iter().map(|(k, e)| (*k, *e)).collect()
    }

    /// Remove every entry that has expired as of `now`, returning the
    /// removed entries.
    pub fn expire(&self, now: Moment, ttl: Ttl) -> Vec<StateEntry> {
        let candidates: Vec<AuthKey> = self
            .for_each_snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.is_expired(now, ttl))
            .map(|(key, _)| key)
            .collect();

        candidates
            .iter()
            .filter_map(|key| self.remove_expired(key, now, ttl))
            .collect()
    }

    /// Refuse all further mutation, leaving the entries in place to be
    /// read until [`StateTable::close`].
    pub fn seal(&self) {
        self.inner.write().closed = true;
    }

    /// Drop every entry and refuse all further mutation.
    ///
    /// Returns the number of entries that were drained.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.write();
        inner.closed = true;
        let drained = inner.map.len();
        inner.map = BTreeMap::new();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    pub fn dump(&self, now: Moment) -> Vec<StateEntryDump> {
        self.for_each_snapshot()
            .into_iter()
            .map(|(_, entry)| entry.dump(now))
            .collect()
    }

    /// Get the maximum number of entries this table may hold.
    pub fn get_limit(&self) -> NonZeroU32 {
        self.limit
    }

    /// Get the number of entries in this table.
    pub fn num_entries(&self) -> u32 {
        self.inner.read().map.len() as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::time::Duration;

    pub const TABLE_SIZE: Option<NonZeroU32> = NonZeroU32::new(16);
    const TTL: Ttl = Ttl::new_seconds(30);

    fn entry(addr: &str, port: PortSel, at: Moment) -> StateEntry {
        StateEntry::new(addr.parse().unwrap(), port, at)
    }

    #[test]
    fn insert_lookup_remove() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let now = Moment::now();
        let e = entry("10.0.0.5", PortSel::Port(1234), now);

        table.insert(e).unwrap();
        assert_eq!(table.num_entries(), 1);
        assert_eq!(table.lookup(&e.key()), Some(e));
        assert!(table.is_authorized(e.addr(), 1234));
        assert!(!table.is_authorized(e.addr(), 1235));

        assert!(table.remove(&e.key()));
        assert!(!table.remove(&e.key()));
        assert_eq!(table.lookup(&e.key()), None);
        assert_eq!(table.num_entries(), 0);
    }

    #[test]
    fn wildcard_port() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let e = entry("fd00::5", PortSel::Any, Moment::now());
        table.insert(e).unwrap();
        assert!(table.is_authorized(e.addr(), 22));
        assert!(table.is_authorized(e.addr(), 1234));
        assert!(!table.is_authorized("fd00::6".parse().unwrap(), 22));
    }

    #[test]
    fn refresh_replaces() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let t0 = Moment::now();
        let t1 = t0 + Duration::from_secs(20);
        let first = entry("10.0.0.5", PortSel::Port(1234), t0);
        let second = entry("10.0.0.5", PortSel::Port(1234), t1);

        table.insert(first).unwrap();
        table.insert(second).unwrap();
        assert_eq!(table.num_entries(), 1);
        assert_eq!(table.lookup(&first.key()).unwrap().inserted_at(), t1);

        // The refreshed entry outlives the original window.
        let expired = table.expire(t0 + Duration::from_secs(31), TTL);
        assert!(expired.is_empty());
        assert_eq!(table.num_entries(), 1);
    }

    #[test]
    fn max_capacity() {
        let table = StateTable::new(NonZeroU32::new(2).unwrap());
        let now = Moment::now();
        table.insert(entry("10.0.0.1", PortSel::Port(1), now)).unwrap();
        table.insert(entry("10.0.0.2", PortSel::Port(1), now)).unwrap();

        let err = table
            .insert(entry("10.0.0.3", PortSel::Port(1), now))
            .unwrap_err();
        assert_eq!(err, KnockError::MaxCapacity(2));
        assert_eq!(table.num_entries(), 2);

        // Refreshing an existing key is always allowed.
        table.insert(entry("10.0.0.2", PortSel::Port(1), now)).unwrap();
    }

    #[test]
    fn expire_boundary() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let t0 = Moment::now();
        let e = entry("10.0.0.5", PortSel::Port(1234), t0);
        table.insert(e).unwrap();

        // Never removed before the TTL has elapsed.
        let early = t0 + Duration::from_millis(29_999);
        assert!(table.expire(early, TTL).is_empty());
        assert_eq!(table.num_entries(), 1);

        // Removed at exactly the TTL.
        let expired = table.expire(t0 + Duration::from_millis(30_000), TTL);
        assert_eq!(expired, vec![e]);
        assert_eq!(table.num_entries(), 0);
    }

    #[test]
    fn remove_expired_rechecks() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let t0 = Moment::now();
        let stale = entry("10.0.0.5", PortSel::Port(1234), t0);
        table.insert(stale).unwrap();

        let now = t0 + Duration::from_secs(40);
        let snap = table.for_each_snapshot();
        assert_eq!(snap.len(), 1);

        // Refreshed between the snapshot and the removal.
        let fresh = entry("10.0.0.5", PortSel::Port(1234), now);
        table.insert(fresh).unwrap();

        assert_eq!(table.remove_expired(&snap[0].0, now, TTL), None);
        assert_eq!(table.lookup(&fresh.key()), Some(fresh));
    }

    #[test]
    fn close_drains_and_refuses() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let now = Moment::now();
        let e = entry("10.0.0.5", PortSel::Port(1234), now);
        table.insert(e).unwrap();
        table.insert(entry("10.0.0.6", PortSel::Any, now)).unwrap();

        assert_eq!(table.close(), 2);
        assert!(table.is_closed());
        assert_eq!(table.num_entries(), 0);
        assert!(matches!(table.insert(e), Err(KnockError::BadState(_))));
        assert!(!table.remove(&e.key()));
        assert!(!table.is_authorized(e.addr(), 1234));
    }

    #[test]
    fn seal_freezes_contents() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let t0 = Moment::now();
        let e = entry("10.0.0.5", PortSel::Port(1234), t0);
        table.insert(e).unwrap();

        table.seal();
        assert!(table.is_closed());

        // Still readable, but nothing is added, refreshed or removed.
        assert!(table.is_authorized(e.addr(), 1234));
        let other = entry("10.0.0.9", PortSel::Any, t0);
        assert!(matches!(table.insert(other), Err(KnockError::BadState(_))));
        assert!(matches!(table.insert(e), Err(KnockError::BadState(_))));
        assert!(!table.remove(&e.key()));
        let later = t0 + Duration::from_secs(60);
        assert!(table.expire(later, TTL).is_empty());
        assert_eq!(table.num_entries(), 1);

        assert_eq!(table.close(), 1);
        assert_eq!(table.num_entries(), 0);
    }

    #[test]
    fn dump_ages() {
        let table = StateTable::new(TABLE_SIZE.unwrap());
        let t0 = Moment::now();
        table.insert(entry("10.0.0.5", PortSel::Port(1234), t0)).unwrap();
        let dump = table.dump(t0 + Duration::from_millis(100));
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].age_ms, 100);
        assert_eq!(dump[0].port, PortSel::Port(1234));
    }
}
