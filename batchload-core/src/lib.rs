// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batched resource-request processors.
//!
//! A [`BatchProcessor`] accepts many individual requests for resources from uncoordinated
//! call sites, coalesces them into batched fetches, deduplicates concurrent requests for
//! the same resource, caches the results and republishes later changes to subscribers.
//! The [`resources`] module instantiates it for thumbnails, user profiles and asset
//! delivery locations.

pub mod canonical;
pub mod fetch;
pub mod notifier;
pub mod processor;
pub mod resources;
#[cfg(with_testing)]
#[path = "unit_tests/test_utils.rs"]
pub mod test_utils;

pub use canonical::{CanonicalRequest, KeyCanonicalizer, MalformedRequest};
pub use fetch::{BatchFetcher, FetchError, FetchOutcome};
pub use notifier::{Changed, Preparing, Subscription};
pub use processor::{BatchProcessor, EntryState, ProcessorConfig, RequestError};
