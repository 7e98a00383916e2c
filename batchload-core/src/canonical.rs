// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Turning requests into cache keys.

use std::{fmt::Debug, hash::Hash};

use batchload_base::util::traits::AutoTraits;
use thiserror::Error;

/// A request reduced to its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest<K> {
    /// The key of the resource, after any alias was applied.
    pub key: K,
    /// A UI hint asking for a re-fetch. It never contributes to the key, but a value newer
    /// than the last one seen for the key makes the cached entry stale.
    pub refresh_id: Option<u64>,
    /// Whether the request was remapped onto another resource.
    pub aliased: bool,
}

impl<K> CanonicalRequest<K> {
    /// Creates a canonical request for `key` without refresh hint.
    pub fn new(key: K) -> Self {
        CanonicalRequest {
            key,
            refresh_id: None,
            aliased: false,
        }
    }

    pub fn with_refresh_id(mut self, refresh_id: Option<u64>) -> Self {
        self.refresh_id = refresh_id;
        self
    }

    pub fn with_aliased(mut self, aliased: bool) -> Self {
        self.aliased = aliased;
        self
    }
}

/// Derives cache keys for one resource domain.
///
/// Implementations must be pure: the same request always yields the same key, and two
/// requests that only differ in fields which are not part of the resource's identity
/// yield the same key.
pub trait KeyCanonicalizer: AutoTraits {
    /// Name of the resource domain, used in logs and metrics.
    const DOMAIN: &'static str;

    /// The typed request accepted by the processor.
    type Request;

    /// The canonical identity of a resource.
    type Key: Clone + Eq + Hash + Debug + AutoTraits;

    /// Computes the canonical form of `request`.
    fn canonicalize(&self, request: &Self::Request) -> CanonicalRequest<Self::Key>;

    /// Returns `true` if both requests refer to the same underlying resource.
    fn is_alias(&self, first: &Self::Request, second: &Self::Request) -> bool {
        self.canonicalize(first).key == self.canonicalize(second).key
    }
}

/// A loosely-shaped request that cannot be turned into a typed request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRequest {
    #[error("Request is missing the identity field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid value {value:?} for request field `{field}`")]
    InvalidField { field: &'static str, value: String },
}

impl MalformedRequest {
    pub(crate) fn invalid(field: &'static str, value: impl ToString) -> Self {
        MalformedRequest::InvalidField {
            field,
            value: value.to_string(),
        }
    }
}
