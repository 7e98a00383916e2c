// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The batch processor: request coalescing, deduplication, caching and change publication.

mod batch;
mod cache;
mod scheduler;

use std::sync::Arc;

use batchload_base::time::Duration;
pub use scheduler::BatchProcessor;
use thiserror::Error;

use crate::fetch::FetchError;

pub const DEFAULT_BATCH_DELAY_MS: u64 = 10;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_PROVISIONAL_REFRESH_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_PROVISIONAL_REFRESHES: u32 = 5;

/// Configuration of a [`BatchProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorConfig {
    /// How long requests are collected before a batch is dispatched.
    #[serde(default = "default_batch_delay_ms")]
    #[arg(
        long = "batch-delay-ms",
        default_value_t = DEFAULT_BATCH_DELAY_MS,
        env = "BATCHLOAD_BATCH_DELAY_MS"
    )]
    pub batch_delay_ms: u64,

    /// The largest number of keys sent in a single batch. A full batch is dispatched
    /// immediately.
    #[serde(default = "default_max_batch_size")]
    #[arg(
        long = "max-batch-size",
        default_value_t = DEFAULT_MAX_BATCH_SIZE,
        env = "BATCHLOAD_MAX_BATCH_SIZE"
    )]
    pub max_batch_size: usize,

    /// How long a resolved value may be served from the cache. Values never expire if unset.
    #[serde(default)]
    #[arg(long = "cache-ttl-ms", env = "BATCHLOAD_CACHE_TTL_MS")]
    pub cache_ttl_ms: Option<u64>,

    /// Wait before re-requesting a provisional value.
    #[serde(default = "default_provisional_refresh_delay_ms")]
    #[arg(
        long = "provisional-refresh-delay-ms",
        default_value_t = DEFAULT_PROVISIONAL_REFRESH_DELAY_MS,
        env = "BATCHLOAD_PROVISIONAL_REFRESH_DELAY_MS"
    )]
    pub provisional_refresh_delay_ms: u64,

    /// How many times in a row a provisional value is re-requested before giving up.
    #[serde(default = "default_max_provisional_refreshes")]
    #[arg(
        long = "max-provisional-refreshes",
        default_value_t = DEFAULT_MAX_PROVISIONAL_REFRESHES,
        env = "BATCHLOAD_MAX_PROVISIONAL_REFRESHES"
    )]
    pub max_provisional_refreshes: u32,
}

fn default_batch_delay_ms() -> u64 {
    DEFAULT_BATCH_DELAY_MS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_provisional_refresh_delay_ms() -> u64 {
    DEFAULT_PROVISIONAL_REFRESH_DELAY_MS
}

fn default_max_provisional_refreshes() -> u32 {
    DEFAULT_MAX_PROVISIONAL_REFRESHES
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            cache_ttl_ms: None,
            provisional_refresh_delay_ms: DEFAULT_PROVISIONAL_REFRESH_DELAY_MS,
            max_provisional_refreshes: DEFAULT_MAX_PROVISIONAL_REFRESHES,
        }
    }
}

impl ProcessorConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }

    pub fn provisional_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.provisional_refresh_delay_ms)
    }
}

/// The lifecycle state of a cache entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Never requested, or invalidated since the last fetch.
    #[default]
    Idle,
    /// Queued in a batch or in flight.
    Pending,
    /// The last fetch succeeded, possibly with a negative result.
    Resolved,
    /// The last fetch failed.
    Failed,
}

/// Why a request did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Batch fetch failed: {0}")]
    Batch(FetchError),

    #[error("Fetch failed for this resource: {0}")]
    Key(FetchError),

    #[error("The batch response did not include this resource")]
    MissingFromResponse,

    #[error("The processor was dropped before the request settled")]
    Dropped,
}

/// The result a request settles with: a value, `None` if the resource does not exist, or
/// an error.
pub type RequestResult<V> = Result<Option<Arc<V>>, RequestError>;
