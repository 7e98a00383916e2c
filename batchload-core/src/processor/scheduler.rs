// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use batchload_base::{task, time::timer, util::traits::AutoTraits};
use futures::future;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use super::{
    batch::{BatchQueue, Enqueued, PendingBatch},
    cache::{CacheStore, Lookup},
    EntryState, ProcessorConfig, RequestError, RequestResult,
};
use crate::{
    canonical::{CanonicalRequest, KeyCanonicalizer},
    fetch::{BatchFetcher, FetchOutcome},
    notifier::{Changed, Listeners, Preparing, Subscription},
};

#[cfg(with_metrics)]
mod metrics {
    use std::sync::LazyLock;

    use batchload_base::prometheus_util::{
        exponential_bucket_interval, exponential_bucket_latencies, register_histogram_vec,
        register_int_counter_vec,
    };
    use prometheus::{HistogramVec, IntCounterVec};

    /// Counter for requests that were served from the cache
    pub(super) static REQUEST_CACHE_HIT: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec(
            "batch_processor_request_cache_hit_total",
            "Number of requests that were served from the cache",
            &["domain"],
        )
    });

    /// Counter for requests that joined a fetch already queued or in flight
    pub(super) static REQUEST_DEDUPLICATION: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec(
            "batch_processor_request_deduplication_total",
            "Number of requests that joined a pending fetch for the same resource",
            &["domain"],
        )
    });

    pub(super) static BATCHES_DISPATCHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec(
            "batch_processor_batches_dispatched_total",
            "Number of batches sent to the fetcher",
            &["domain"],
        )
    });

    pub(super) static FAILED_KEYS: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec(
            "batch_processor_failed_keys_total",
            "Number of keys whose fetch failed",
            &["domain"],
        )
    });

    pub(super) static BATCH_SIZE: LazyLock<HistogramVec> = LazyLock::new(|| {
        register_histogram_vec(
            "batch_processor_batch_size",
            "Number of keys per dispatched batch",
            &["domain"],
            exponential_bucket_interval(1.0, 1000.0),
        )
    });

    /// Histogram of batch fetch latencies (in milliseconds)
    pub(super) static FETCH_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
        register_histogram_vec(
            "batch_processor_fetch_latency_ms",
            "Time spent in the batch fetcher in milliseconds",
            &["domain"],
            exponential_bucket_latencies(30_000.0),
        )
    });
}

/// A request that either settled right away or waits for its batch.
enum Response<V> {
    Ready(RequestResult<V>),
    Waiting(oneshot::Receiver<RequestResult<V>>),
}

impl<V> Response<V> {
    async fn resolve(self) -> RequestResult<V> {
        match self {
            Response::Ready(result) => result,
            Response::Waiting(receiver) => receiver.await.unwrap_or(Err(RequestError::Dropped)),
        }
    }
}

/// Coalesces requests for resources of one domain into batched fetches.
///
/// Requests for the same canonical key share a single cache entry: while a fetch for the
/// key is queued or in flight, new requests wait for it instead of starting another one,
/// and once it resolved they are served from the cache. Keys requested within the batch
/// window are fetched together, in batches of at most `max_batch_size` keys.
///
/// Cloning a `BatchProcessor` yields another handle to the same cache.
pub struct BatchProcessor<C: KeyCanonicalizer, F: BatchFetcher> {
    inner: Arc<Inner<C, F>>,
}

impl<C: KeyCanonicalizer, F: BatchFetcher> Clone for BatchProcessor<C, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: KeyCanonicalizer, F: BatchFetcher> {
    canonicalizer: C,
    fetcher: F,
    config: ProcessorConfig,
    /// Never held across an await point or while callbacks run.
    state: Mutex<State<C::Key, F::Value>>,
    changed: Arc<Listeners<C::Key, Changed<F::Value>>>,
    preparing: Arc<Listeners<C::Key, Preparing<F::Value>>>,
}

struct State<K, V> {
    cache: CacheStore<K, V>,
    queue: BatchQueue<K>,
}

impl<C, F> BatchProcessor<C, F>
where
    C: KeyCanonicalizer,
    F: BatchFetcher<Key = C::Key> + AutoTraits,
    F::Value: AutoTraits,
{
    /// Creates a processor. Panics if `config.max_batch_size` is zero.
    pub fn new(canonicalizer: C, fetcher: F, config: ProcessorConfig) -> Self {
        let state = State {
            cache: CacheStore::new(config.cache_ttl()),
            queue: BatchQueue::new(config.max_batch_size),
        };
        Self {
            inner: Arc::new(Inner {
                canonicalizer,
                fetcher,
                config,
                state: Mutex::new(state),
                changed: Arc::default(),
                preparing: Arc::default(),
            }),
        }
    }

    pub fn canonicalizer(&self) -> &C {
        &self.inner.canonicalizer
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Requests one resource.
    ///
    /// The cache lookup and the enqueuing happen immediately; the returned future only
    /// waits for the outcome. It settles with `None` if the resource does not exist.
    #[instrument(level = "trace", skip_all, fields(domain = C::DOMAIN))]
    pub fn request(
        &self,
        request: &C::Request,
    ) -> impl Future<Output = RequestResult<F::Value>> + 'static {
        let canonical = self.inner.canonicalizer.canonicalize(request);
        self.inner.request(canonical, false).resolve()
    }

    /// Requests several resources and waits until all of them settled. The results are in
    /// the order of `requests`, and one failing resource does not affect the others.
    #[instrument(level = "trace", skip_all, fields(domain = C::DOMAIN, count = requests.len()))]
    pub fn request_batch(
        &self,
        requests: &[C::Request],
    ) -> impl Future<Output = Vec<RequestResult<F::Value>>> + 'static {
        let responses = requests
            .iter()
            .map(|request| {
                let canonical = self.inner.canonicalizer.canonicalize(request);
                self.inner.request(canonical, false)
            })
            .collect::<Vec<_>>();
        future::join_all(responses.into_iter().map(Response::resolve))
    }

    /// Returns the stored value without requesting anything: `None` if the entry never
    /// settled, `Some(None)` if the resource is known not to exist.
    pub fn get_if_cached(&self, request: &C::Request) -> Option<Option<Arc<F::Value>>> {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        self.inner.state.lock().unwrap().cache.get(&key)
    }

    /// Whether the entry for `request` settled at least once.
    pub fn is_cached(&self, request: &C::Request) -> bool {
        self.get_if_cached(request).is_some()
    }

    /// Whether the stored value was written from an external cache.
    pub fn is_from_cache(&self, request: &C::Request) -> bool {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        self.inner.state.lock().unwrap().cache.is_from_cache(&key)
    }

    pub fn entry_state(&self, request: &C::Request) -> EntryState {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        self.inner.state.lock().unwrap().cache.state(&key)
    }

    /// Marks the entry stale so that the next request fetches it again. A fetch already in
    /// flight still settles its waiters but its result is not stored.
    /// Returns `false` if the resource was never requested.
    pub fn invalidate(&self, request: &C::Request) -> bool {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        let found = self.inner.state.lock().unwrap().cache.invalidate(&key);
        trace!(?key, found, "invalidated entry");
        found
    }

    /// Stores `value` for `request` as if it had been fetched, and notifies subscribers.
    pub fn write(&self, request: &C::Request, value: Option<F::Value>, from_cache: bool) {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        let changed = self
            .inner
            .state
            .lock()
            .unwrap()
            .cache
            .write(key.clone(), value.map(Arc::new), from_cache);
        self.inner.changed.notify(&key, &changed);
    }

    /// Calls `callback` whenever a new value is stored for the resource, including values
    /// fetched for aliased requests.
    pub fn on_changed(
        &self,
        request: &C::Request,
        callback: impl Fn(&Changed<F::Value>) + AutoTraits,
    ) -> Subscription {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        self.inner.changed.subscribe(key, Arc::new(callback))
    }

    /// Calls `callback` with the previous value whenever the resource, after having
    /// settled, is about to be fetched again.
    pub fn on_preparing_next_request(
        &self,
        request: &C::Request,
        callback: impl Fn(&Preparing<F::Value>) + AutoTraits,
    ) -> Subscription {
        let key = self.inner.canonicalizer.canonicalize(request).key;
        self.inner.preparing.subscribe(key, Arc::new(callback))
    }
}

impl<C, F> Inner<C, F>
where
    C: KeyCanonicalizer,
    F: BatchFetcher<Key = C::Key> + AutoTraits,
    F::Value: AutoTraits,
{
    fn request(
        self: &Arc<Self>,
        canonical: CanonicalRequest<C::Key>,
        force: bool,
    ) -> Response<F::Value> {
        let CanonicalRequest {
            key, refresh_id, ..
        } = canonical;
        let (lookup, enqueued) = {
            let mut state = self.state.lock().unwrap();
            let lookup = state.cache.request(key.clone(), refresh_id, force);
            let enqueued = match &lookup {
                Lookup::Armed { epoch, .. } => Some(state.queue.push(key.clone(), *epoch)),
                Lookup::Hit(_) | Lookup::Joined(_) => None,
            };
            (lookup, enqueued)
        };
        let receiver = match lookup {
            Lookup::Hit(value) => {
                trace!(?key, "request served from cache");
                #[cfg(with_metrics)]
                metrics::REQUEST_CACHE_HIT
                    .with_label_values(&[C::DOMAIN])
                    .inc();
                return Response::Ready(Ok(value));
            }
            Lookup::Joined(receiver) => {
                trace!(?key, "request joined pending fetch");
                #[cfg(with_metrics)]
                metrics::REQUEST_DEDUPLICATION
                    .with_label_values(&[C::DOMAIN])
                    .inc();
                return Response::Waiting(receiver);
            }
            Lookup::Armed {
                receiver, previous, ..
            } => {
                // Subscribers hear about the refresh before its batch can possibly settle.
                if let Some(previous) = previous {
                    self.preparing.notify(&key, &Preparing { previous });
                }
                receiver
            }
        };
        match enqueued {
            Some(Enqueued::Opened { id }) => self.start_window(id),
            Some(Enqueued::Full(batch)) => {
                trace!(batch = batch.id, "batch is full");
                let _ = task::spawn(self.clone().dispatch(batch));
            }
            Some(Enqueued::Queued) | None => {}
        }
        Response::Waiting(receiver)
    }

    fn start_window(self: &Arc<Self>, id: u64) {
        let inner = self.clone();
        let _ = task::spawn(async move {
            timer::sleep(inner.config.batch_delay()).await;
            let batch = inner.state.lock().unwrap().queue.take(id);
            if let Some(batch) = batch {
                inner.dispatch(batch).await;
            }
        });
    }

    #[instrument(level = "debug", skip_all, fields(domain = C::DOMAIN, batch = batch.id, size = batch.keys.len()))]
    async fn dispatch(self: Arc<Self>, batch: PendingBatch<C::Key>) {
        let keys = batch
            .keys
            .iter()
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        debug!("dispatching batch");
        #[cfg(with_metrics)]
        let start = batchload_base::time::Instant::now();
        let result = self.fetcher.fetch_batch(keys).await;
        #[cfg(with_metrics)]
        {
            metrics::BATCHES_DISPATCHED
                .with_label_values(&[C::DOMAIN])
                .inc();
            metrics::BATCH_SIZE
                .with_label_values(&[C::DOMAIN])
                .observe(batch.keys.len() as f64);
            metrics::FETCH_LATENCY
                .with_label_values(&[C::DOMAIN])
                .observe(start.elapsed().as_secs_f64() * 1000.0);
        }
        match result {
            Ok(mut outcomes) => {
                for (key, epoch) in batch.keys {
                    let (result, provisional) = match outcomes.remove(&key) {
                        Some(FetchOutcome::Found(value)) => {
                            let provisional = self.fetcher.is_provisional(&value);
                            (Ok(Some(Arc::new(value))), provisional)
                        }
                        Some(FetchOutcome::NotFound) => (Ok(None), false),
                        Some(FetchOutcome::Failed(error)) => {
                            debug!(?key, %error, "fetch failed for key");
                            (Err(RequestError::Key(error)), false)
                        }
                        None => {
                            warn!(?key, "batch response is missing a requested key");
                            (Err(RequestError::MissingFromResponse), false)
                        }
                    };
                    self.settle(key, epoch, result, provisional);
                }
                if !outcomes.is_empty() {
                    debug!(
                        unrequested = outcomes.len(),
                        "ignoring results for keys that were not requested"
                    );
                }
            }
            Err(error) => {
                warn!(%error, "batch fetch failed");
                for (key, epoch) in batch.keys {
                    self.settle(key, epoch, Err(RequestError::Batch(error.clone())), false);
                }
            }
        }
    }

    fn settle(
        self: &Arc<Self>,
        key: C::Key,
        epoch: u64,
        result: RequestResult<F::Value>,
        provisional: bool,
    ) {
        #[cfg(with_metrics)]
        if result.is_err() {
            metrics::FAILED_KEYS.with_label_values(&[C::DOMAIN]).inc();
        }
        let settled = self.state.lock().unwrap().cache.settle(
            &key,
            epoch,
            &result,
            provisional,
            self.config.max_provisional_refreshes,
        );
        match &settled.changed {
            Some(changed) => {
                self.changed.notify(&key, changed);
            }
            None if result.is_ok() => trace!(?key, "discarding superseded fetch result"),
            None => {}
        }
        for waiter in settled.waiters {
            // The caller may have dropped its future.
            let _ = waiter.send(result.clone());
        }
        if settled.refresh {
            self.schedule_refresh(key);
        }
    }

    fn schedule_refresh(self: &Arc<Self>, key: C::Key) {
        let inner = self.clone();
        let _ = task::spawn(async move {
            timer::sleep(inner.config.provisional_refresh_delay()).await;
            trace!(?key, "re-requesting provisional value");
            let _ = inner.request(CanonicalRequest::new(key), true);
        });
    }
}

#[cfg(test)]
#[path = "../unit_tests/processor_tests.rs"]
mod processor_tests;
