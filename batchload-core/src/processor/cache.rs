// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, hash::Hash, mem, sync::Arc};

use batchload_base::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::{EntryState, RequestResult};
use crate::notifier::Changed;

pub(super) type Waiter<V> = oneshot::Sender<RequestResult<V>>;

/// Everything the processor knows about one key.
struct CacheEntry<V> {
    /// `None` until the entry settles for the first time. Afterwards, `Some(None)` records
    /// that the resource does not exist.
    value: Option<Option<Arc<V>>>,
    state: EntryState,
    from_cache: bool,
    /// Set by `invalidate`. An invalidated entry is never served as fresh.
    invalidated: bool,
    /// The largest refresh hint seen for this key.
    refresh_id: Option<u64>,
    /// Bumped whenever a fetch is started or the value is replaced externally. A fetch
    /// result is only applied if the epoch did not move since the fetch started.
    epoch: u64,
    last_resolved_at: Option<Instant>,
    /// Consecutive provisional values received.
    provisional_count: u32,
    waiters: Vec<Waiter<V>>,
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self {
            value: None,
            state: EntryState::Idle,
            from_cache: false,
            invalidated: false,
            refresh_id: None,
            epoch: 0,
            last_resolved_at: None,
            provisional_count: 0,
            waiters: Vec::new(),
        }
    }
}

impl<V> CacheEntry<V> {
    fn is_stale_for(&self, refresh_id: Option<u64>) -> bool {
        match (refresh_id, self.refresh_id) {
            (Some(requested), Some(seen)) => requested > seen,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn is_fresh(&self, refresh_id: Option<u64>, ttl: Option<Duration>, now: Instant) -> bool {
        if self.state != EntryState::Resolved || self.invalidated {
            return false;
        }
        if self.is_stale_for(refresh_id) {
            return false;
        }
        match (ttl, self.last_resolved_at) {
            (Some(ttl), Some(resolved_at)) => now.saturating_duration_since(resolved_at) < ttl,
            _ => true,
        }
    }

    fn record_refresh_id(&mut self, refresh_id: Option<u64>) {
        if let Some(requested) = refresh_id {
            self.refresh_id = Some(self.refresh_id.map_or(requested, |seen| seen.max(requested)));
        }
    }

    fn add_waiter(&mut self) -> oneshot::Receiver<RequestResult<V>> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(sender);
        receiver
    }
}

/// How `CacheStore::request` handled a key.
#[derive(Debug)]
pub(super) enum Lookup<V> {
    /// The cached value is fresh.
    Hit(Option<Arc<V>>),
    /// A fetch for the key is already queued or in flight.
    Joined(oneshot::Receiver<RequestResult<V>>),
    /// The entry moved to `Pending`. The caller must enqueue the key with `epoch`.
    Armed {
        epoch: u64,
        receiver: oneshot::Receiver<RequestResult<V>>,
        /// The value the entry held, if it had settled before.
        previous: Option<Option<Arc<V>>>,
    },
}

/// What settling a fetch result requires from the caller, once the lock is released.
pub(super) struct Settled<V> {
    pub waiters: Vec<Waiter<V>>,
    /// Set if the result was applied and subscribers must hear about it.
    pub changed: Option<Changed<V>>,
    /// Set if a provisional value was stored and should be re-requested later.
    pub refresh: bool,
}

impl<V> Default for Settled<V> {
    fn default() -> Self {
        Self {
            waiters: Vec::new(),
            changed: None,
            refresh: false,
        }
    }
}

/// The cache entries of a processor. Entries are never evicted.
pub(super) struct CacheStore<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: Option<Duration>,
}

impl<K: Clone + Eq + Hash, V> CacheStore<K, V> {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Serves a fresh value, joins a pending fetch, or arms a new one.
    /// With `force`, a resolved value is never considered fresh.
    pub fn request(&mut self, key: K, refresh_id: Option<u64>, force: bool) -> Lookup<V> {
        self.request_at(key, refresh_id, force, Instant::now())
    }

    /// Same as `request`, judging the time to live at `now`.
    pub fn request_at(
        &mut self,
        key: K,
        refresh_id: Option<u64>,
        force: bool,
        now: Instant,
    ) -> Lookup<V> {
        let entry = self.entries.entry(key).or_default();
        if entry.state == EntryState::Pending {
            entry.record_refresh_id(refresh_id);
            return Lookup::Joined(entry.add_waiter());
        }
        if !force && entry.is_fresh(refresh_id, self.ttl, now) {
            return Lookup::Hit(entry.value.clone().flatten());
        }
        let previous = entry.value.clone();
        entry.state = EntryState::Pending;
        entry.invalidated = false;
        entry.epoch += 1;
        entry.record_refresh_id(refresh_id);
        Lookup::Armed {
            epoch: entry.epoch,
            receiver: entry.add_waiter(),
            previous,
        }
    }

    /// Applies the result of the fetch started at `epoch`.
    ///
    /// If the entry was written or invalidated in the meantime, the waiters still receive
    /// `result` but the stored value is left alone.
    pub fn settle(
        &mut self,
        key: &K,
        epoch: u64,
        result: &RequestResult<V>,
        provisional: bool,
        max_provisional_refreshes: u32,
    ) -> Settled<V> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Settled::default();
        };
        let waiters = mem::take(&mut entry.waiters);
        if entry.epoch != epoch {
            entry.state = if entry.invalidated || entry.value.is_none() {
                EntryState::Idle
            } else {
                EntryState::Resolved
            };
            return Settled {
                waiters,
                ..Settled::default()
            };
        }
        entry.last_resolved_at = Some(Instant::now());
        match result {
            Ok(value) => {
                entry.state = EntryState::Resolved;
                entry.value = Some(value.clone());
                entry.from_cache = false;
                let mut refresh = false;
                if provisional {
                    entry.provisional_count += 1;
                    refresh = entry.provisional_count <= max_provisional_refreshes;
                } else {
                    entry.provisional_count = 0;
                }
                Settled {
                    waiters,
                    changed: Some(Changed {
                        value: value.clone(),
                        from_cache: false,
                    }),
                    refresh,
                }
            }
            Err(_) => {
                entry.state = EntryState::Failed;
                entry.value = Some(None);
                entry.provisional_count = 0;
                Settled {
                    waiters,
                    changed: Some(Changed {
                        value: None,
                        from_cache: false,
                    }),
                    refresh: false,
                }
            }
        }
    }

    /// Stores `value` as if it had been fetched. A fetch already in flight keeps the entry
    /// pending, but its result will not overwrite `value`.
    pub fn write(&mut self, key: K, value: Option<Arc<V>>, from_cache: bool) -> Changed<V> {
        let entry = self.entries.entry(key).or_default();
        entry.epoch += 1;
        entry.value = Some(value.clone());
        entry.from_cache = from_cache;
        entry.invalidated = false;
        entry.provisional_count = 0;
        entry.last_resolved_at = Some(Instant::now());
        if entry.state != EntryState::Pending {
            entry.state = EntryState::Resolved;
        }
        Changed { value, from_cache }
    }

    /// Marks the entry stale. The stored value stays readable until it is replaced.
    /// Returns `false` if the key was never seen.
    pub fn invalidate(&mut self, key: &K) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.invalidated = true;
        if entry.state == EntryState::Pending {
            entry.epoch += 1;
        } else {
            entry.state = EntryState::Idle;
        }
        true
    }

    pub fn get(&self, key: &K) -> Option<Option<Arc<V>>> {
        self.entries.get(key).and_then(|entry| entry.value.clone())
    }

    pub fn is_from_cache(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.from_cache)
    }

    pub fn state(&self, key: &K) -> EntryState {
        self.entries
            .get(key)
            .map_or(EntryState::Idle, |entry| entry.state)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{fetch::FetchError, processor::RequestError};

    fn armed_epoch(lookup: Lookup<&'static str>) -> u64 {
        match lookup {
            Lookup::Armed { epoch, .. } => epoch,
            _ => panic!("expected a new fetch to be armed"),
        }
    }

    fn resolved(store: &mut CacheStore<u64, &'static str>, key: u64, value: &'static str) {
        let epoch = armed_epoch(store.request(key, None, false));
        store.settle(&key, epoch, &Ok(Some(Arc::new(value))), false, 0);
    }

    #[test]
    fn test_pending_entry_is_joined() {
        let mut store = CacheStore::<u64, &'static str>::new(None);
        let epoch = armed_epoch(store.request(1, None, false));
        assert_eq!(store.state(&1), EntryState::Pending);
        assert_matches!(store.request(1, None, false), Lookup::Joined(_));
        assert_matches!(store.request(1, Some(4), true), Lookup::Joined(_));

        let settled = store.settle(&1, epoch, &Ok(Some(Arc::new("a"))), false, 0);
        assert_eq!(settled.waiters.len(), 3);
        assert!(settled.changed.is_some());
        assert_eq!(store.state(&1), EntryState::Resolved);
    }

    #[test]
    fn test_resolved_entry_is_served_until_refresh_hint_increases() {
        let mut store = CacheStore::<u64, &'static str>::new(None);
        resolved(&mut store, 1, "a");
        assert_matches!(store.request(1, None, false), Lookup::Hit(Some(value)) if *value == "a");

        let epoch = armed_epoch(store.request(1, Some(1), false));
        store.settle(&1, epoch, &Ok(Some(Arc::new("b"))), false, 0);
        assert_matches!(store.request(1, Some(1), false), Lookup::Hit(Some(value)) if *value == "b");
        assert_matches!(store.request(1, Some(0), false), Lookup::Hit(_));
        assert_matches!(store.request(1, Some(2), false), Lookup::Armed { previous: Some(Some(value)), .. } if *value == "b");
    }

    #[test]
    fn test_failure_clears_value() {
        let mut store = CacheStore::<u64, &'static str>::new(None);
        let epoch = armed_epoch(store.request(1, None, false));
        let error: RequestResult<&'static str> =
            Err(RequestError::Key(FetchError::Network("reset".into())));
        store.settle(&1, epoch, &error, false, 0);
        assert_eq!(store.state(&1), EntryState::Failed);
        assert_eq!(store.get(&1), Some(None));

        resolved(&mut store, 2, "b");
        let epoch = armed_epoch(store.request(2, None, true));
        let settled = store.settle(&2, epoch, &error, false, 0);
        assert_matches!(settled.changed, Some(Changed { value: None, from_cache: false }));
        assert_eq!(store.state(&2), EntryState::Failed);
        assert_eq!(store.get(&2), Some(None));
    }

    #[test]
    fn test_write_during_fetch_wins() {
        let mut store = CacheStore::<u64, &'static str>::new(None);
        let epoch = armed_epoch(store.request(1, None, false));
        store.write(1, Some(Arc::new("written")), true);
        assert_eq!(store.state(&1), EntryState::Pending);
        assert!(store.is_from_cache(&1));

        let settled = store.settle(&1, epoch, &Ok(Some(Arc::new("fetched"))), false, 0);
        assert_eq!(settled.waiters.len(), 1);
        assert!(settled.changed.is_none());
        assert_eq!(store.state(&1), EntryState::Resolved);
        assert_matches!(store.get(&1), Some(Some(value)) if *value == "written");
    }

    #[test]
    fn test_invalidate() {
        let mut store = CacheStore::<u64, &'static str>::new(None);
        assert!(!store.invalidate(&1));

        resolved(&mut store, 1, "a");
        assert!(store.invalidate(&1));
        assert_eq!(store.state(&1), EntryState::Idle);
        assert_matches!(store.get(&1), Some(Some(_)));

        let epoch = armed_epoch(store.request(1, None, false));
        assert!(store.invalidate(&1));
        assert_eq!(store.state(&1), EntryState::Pending);
        let settled = store.settle(&1, epoch, &Ok(Some(Arc::new("b"))), false, 0);
        assert!(settled.changed.is_none());
        assert_eq!(store.state(&1), EntryState::Idle);
    }

    #[test]
    fn test_provisional_values_are_refreshed_a_bounded_number_of_times() {
        let mut store = CacheStore::<u64, &'static str>::new(None);
        let mut refreshes = 0;
        loop {
            let epoch = armed_epoch(store.request(1, None, true));
            let settled = store.settle(&1, epoch, &Ok(Some(Arc::new("pending"))), true, 3);
            if !settled.refresh {
                break;
            }
            refreshes += 1;
        }
        assert_eq!(refreshes, 3);

        let epoch = armed_epoch(store.request(1, None, true));
        store.settle(&1, epoch, &Ok(Some(Arc::new("final"))), false, 3);
        let epoch = armed_epoch(store.request(1, None, true));
        let settled = store.settle(&1, epoch, &Ok(Some(Arc::new("pending"))), true, 3);
        assert!(settled.refresh);
    }

    #[test]
    fn test_ttl_expiry() {
        let ttl = Duration::from_secs(60);
        let mut store = CacheStore::<u64, &'static str>::new(Some(ttl));
        resolved(&mut store, 1, "a");
        let now = Instant::now();
        assert_matches!(store.request_at(1, None, false, now), Lookup::Hit(_));
        assert_matches!(
            store.request_at(1, None, false, now + ttl / 2),
            Lookup::Hit(_)
        );
        assert_matches!(
            store.request_at(1, None, false, now + ttl),
            Lookup::Armed { .. }
        );
    }
}
