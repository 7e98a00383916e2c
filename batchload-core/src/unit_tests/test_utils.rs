// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for batch fetchers.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use batchload_base::util::traits::AutoTraits;
use tokio::sync::Semaphore;

use crate::{
    fetch::{BatchFetcher, FetchError, FetchOutcome},
    resources::{
        profiles::{UserId, UserProfile},
        thumbnails::{Thumbnail, ThumbnailState},
    },
};

struct MockState<K, V> {
    outcomes: HashMap<K, FetchOutcome<V>>,
    batch_error: Option<FetchError>,
    batches: Vec<Vec<K>>,
}

/// A fetcher answering from a table of outcomes and recording every batch it receives.
///
/// Keys without an outcome are left out of the response. Clones share their state, so a
/// test can keep a handle after passing the fetcher to a processor.
pub struct MockFetcher<K, V> {
    state: Arc<Mutex<MockState<K, V>>>,
    gate: Option<Arc<Semaphore>>,
    provisional: Option<fn(&V) -> bool>,
}

impl<K, V> Clone for MockFetcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            gate: self.gate.clone(),
            provisional: self.provisional,
        }
    }
}

impl<K, V> Default for MockFetcher<K, V> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                outcomes: HashMap::new(),
                batch_error: None,
                batches: Vec::new(),
            })),
            gate: None,
            provisional: None,
        }
    }
}

impl<K: Clone + Eq + Hash, V: Clone> MockFetcher<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every fetch wait until [`MockFetcher::open_gate`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn with_provisional(mut self, provisional: fn(&V) -> bool) -> Self {
        self.provisional = Some(provisional);
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    pub fn set(&self, key: K, outcome: FetchOutcome<V>) {
        self.state.lock().unwrap().outcomes.insert(key, outcome);
    }

    pub fn set_found(&self, key: K, value: V) {
        self.set(key, FetchOutcome::Found(value));
    }

    /// Fails every following batch with `error`, or stops doing so.
    pub fn fail_batches(&self, error: Option<FetchError>) {
        self.state.lock().unwrap().batch_error = error;
    }

    /// The keys of every batch received so far.
    pub fn batches(&self) -> Vec<Vec<K>> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn fetched_keys(&self) -> usize {
        self.state.lock().unwrap().batches.iter().map(Vec::len).sum()
    }
}

impl<K, V> BatchFetcher for MockFetcher<K, V>
where
    K: Clone + Eq + Hash + AutoTraits,
    V: Clone + AutoTraits,
{
    type Key = K;
    type Value = V;

    async fn fetch_batch(
        &self,
        keys: Vec<K>,
    ) -> Result<HashMap<K, FetchOutcome<V>>, FetchError> {
        self.state.lock().unwrap().batches.push(keys.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("the gate is never closed")
                .forget();
        }
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.batch_error {
            return Err(error.clone());
        }
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let outcome = state.outcomes.get(&key)?.clone();
                Some((key, outcome))
            })
            .collect())
    }

    fn is_provisional(&self, value: &V) -> bool {
        self.provisional.is_some_and(|provisional| provisional(value))
    }
}

pub fn profile(id: u64, name: &str) -> UserProfile {
    UserProfile {
        id: UserId(id),
        name: name.to_owned(),
        display_name: name.to_owned(),
        has_verified_badge: false,
    }
}

pub fn thumbnail(target_id: u64, state: ThumbnailState) -> Thumbnail {
    let image_url = (state == ThumbnailState::Completed)
        .then(|| format!("https://thumbnails.example/{target_id}.png"));
    Thumbnail {
        target_id,
        state,
        image_url,
        version: None,
    }
}
