// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Change subscriptions, keyed by canonical resource key.

use std::{
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use batchload_base::util::traits::AutoTraits;
use dashmap::DashMap;
use tracing::trace;

/// Published when the value stored for a key changes.
#[derive(Debug)]
pub struct Changed<V> {
    /// The new value, or `None` if the resource is known not to exist.
    pub value: Option<Arc<V>>,
    /// Whether the value was written from an external cache rather than fetched.
    pub from_cache: bool,
}

/// Published when a key that already settled is about to be fetched again.
#[derive(Debug)]
pub struct Preparing<V> {
    /// The value stored before the new fetch.
    pub previous: Option<Arc<V>>,
}

#[cfg(not(web))]
pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
#[cfg(web)]
pub(crate) type Callback<T> = Arc<dyn Fn(&T)>;

#[cfg(not(web))]
type Release = Box<dyn FnOnce() + Send + Sync>;
#[cfg(web)]
type Release = Box<dyn FnOnce()>;

struct Listener<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: self.active.clone(),
            callback: self.callback.clone(),
        }
    }
}

/// Callbacks waiting for one kind of event, grouped by key.
/// Keys are evicted as soon as their last listener goes away.
pub(crate) struct Listeners<K, T> {
    inner: DashMap<K, Vec<Listener<T>>>,
    next_id: AtomicU64,
}

// `#[derive(Default)]` would require `T: Default`.
impl<K: Eq + Hash, T> Default for Listeners<K, T> {
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, T> Listeners<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug + AutoTraits,
    T: 'static,
{
    /// Registers `callback` for `key`. The returned guard removes it again.
    pub(crate) fn subscribe(self: &Arc<Self>, key: K, callback: Callback<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.inner.entry(key.clone()).or_default().push(Listener {
            id,
            active: active.clone(),
            callback,
        });
        let listeners = Arc::downgrade(self);
        Subscription::new(Box::new(move || {
            active.store(false, Ordering::Release);
            if let Some(listeners) = listeners.upgrade() {
                listeners.remove(&key, id);
            }
        }))
    }

    fn remove(&self, key: &K, id: u64) {
        let is_empty = {
            let Some(mut listeners) = self.inner.get_mut(key) else {
                return;
            };
            listeners.retain(|listener| listener.id != id);
            listeners.is_empty()
        };
        if is_empty {
            trace!(?key, "No more subscribers. Removing entry.");
            self.inner.remove_if(key, |_, listeners| listeners.is_empty());
        }
    }

    /// Invokes every listener of `key` with `event` and returns how many were called.
    ///
    /// Listeners run on a snapshot taken before the first call, without any lock held, so
    /// they may subscribe or unsubscribe freely. A listener removed during the
    /// notification is not called anymore.
    pub(crate) fn notify(&self, key: &K, event: &T) -> usize {
        let snapshot = match self.inner.get(key) {
            Some(listeners) => listeners.clone(),
            None => {
                trace!(?key, "Key has no subscribers.");
                return 0;
            }
        };
        let mut called = 0;
        for listener in snapshot {
            if listener.active.load(Ordering::Acquire) {
                (listener.callback)(event);
                called += 1;
            }
        }
        called
    }

    #[cfg(test)]
    pub(crate) fn count(&self, key: &K) -> usize {
        self.inner.get(key).map_or(0, |listeners| listeners.len())
    }
}

/// A registered callback. Dropping the guard, or calling [`Subscription::unsubscribe`],
/// removes the callback. Removal is idempotent and effective immediately.
#[must_use = "the callback is removed as soon as the subscription is dropped"]
pub struct Subscription {
    release: Option<Release>,
}

impl Subscription {
    fn new(release: Release) -> Self {
        Self {
            release: Some(release),
        }
    }

    /// Removes the callback.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
