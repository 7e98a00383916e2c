// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The boundary between a processor and the network.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a batch fetch reports for one requested key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<V> {
    /// The resource exists.
    Found(V),
    /// The resource definitively does not exist.
    NotFound,
    /// The resource could not be fetched. Other keys of the same batch are unaffected.
    Failed(FetchError),
}

/// Errors reported by a batch fetcher, either for the whole batch or for a single key.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("Request rejected with code {code}: {message}")]
    Rejected { code: i32, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::Decode(error.to_string())
    }
}

/// Fetches many resources with a single network operation.
///
/// The returned map may list keys in any order. Every requested key should have an entry;
/// keys without one are failed by the processor.
#[allow(async_fn_in_trait)]
#[cfg_attr(not(web), trait_variant::make(Send))]
pub trait BatchFetcher {
    type Key;
    type Value;

    /// Fetches the resources identified by `keys`. The set is non-empty and no larger than
    /// the processor's configured batch limit.
    async fn fetch_batch(
        &self,
        keys: Vec<Self::Key>,
    ) -> Result<HashMap<Self::Key, FetchOutcome<Self::Value>>, FetchError>;

    /// Whether `value` is a placeholder that the remote side will replace later, e.g. a
    /// thumbnail still waiting for moderation. Provisional values are published and then
    /// re-requested after a delay.
    fn is_provisional(&self, _value: &Self::Value) -> bool {
        false
    }
}
