// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Download locations of assets, fetched through the asset delivery batch endpoint.

use std::{collections::HashMap, fmt};

use batchload_base::util::traits::AutoTraits;
use serde::{Deserialize, Serialize};

use crate::{
    canonical::{CanonicalRequest, KeyCanonicalizer, MalformedRequest},
    fetch::{BatchFetcher, FetchError, FetchOutcome},
    processor::{BatchProcessor, ProcessorConfig},
};

pub type AssetProcessor<A> = BatchProcessor<AssetCanonicalizer, AssetFetcher<A>>;

/// Error code the delivery endpoint uses for assets that do not exist.
pub const ASSET_NOT_FOUND: i32 = 404;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub u64);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub asset_id: AssetId,
    pub refresh_id: Option<u64>,
}

impl AssetRequest {
    pub fn new(asset_id: u64) -> Self {
        Self {
            asset_id: AssetId(asset_id),
            refresh_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAssetRequest {
    pub asset_id: Option<u64>,
    pub refresh_id: Option<u64>,
}

impl TryFrom<RawAssetRequest> for AssetRequest {
    type Error = MalformedRequest;

    fn try_from(raw: RawAssetRequest) -> Result<Self, Self::Error> {
        let asset_id = raw
            .asset_id
            .ok_or(MalformedRequest::MissingField("assetId"))?;
        if asset_id == 0 {
            return Err(MalformedRequest::invalid("assetId", asset_id));
        }
        Ok(AssetRequest {
            asset_id: AssetId(asset_id),
            refresh_id: raw.refresh_id,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssetCanonicalizer;

impl KeyCanonicalizer for AssetCanonicalizer {
    const DOMAIN: &'static str = "assets";

    type Request = AssetRequest;
    type Key = AssetId;

    fn canonicalize(&self, request: &AssetRequest) -> CanonicalRequest<AssetId> {
        CanonicalRequest::new(request.asset_id).with_refresh_id(request.refresh_id)
    }
}

/// Where an asset can be downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLocation {
    pub asset_id: AssetId,
    pub location: String,
    pub asset_type_id: Option<u32>,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeliveryRequest {
    pub request_id: String,
    pub asset_id: AssetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeliveryResponse {
    pub request_id: Option<String>,
    #[serde(default)]
    pub locations: Vec<AssetDeliveryLocation>,
    #[serde(default)]
    pub errors: Vec<AssetDeliveryError>,
    pub asset_type_id: Option<u32>,
    #[serde(default)]
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeliveryLocation {
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeliveryError {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Transport for the asset delivery batch endpoint.
#[allow(async_fn_in_trait)]
#[cfg_attr(not(web), trait_variant::make(Send))]
pub trait AssetDeliveryApi {
    async fn batch(
        &self,
        requests: Vec<AssetDeliveryRequest>,
    ) -> Result<Vec<AssetDeliveryResponse>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct AssetFetcher<A> {
    api: A,
}

impl<A> AssetFetcher<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

fn outcome(asset_id: AssetId, response: AssetDeliveryResponse) -> FetchOutcome<AssetLocation> {
    if let Some(error) = response.errors.into_iter().next() {
        if error.code == ASSET_NOT_FOUND {
            return FetchOutcome::NotFound;
        }
        return FetchOutcome::Failed(FetchError::Rejected {
            code: error.code,
            message: error.message,
        });
    }
    match response.locations.into_iter().next() {
        Some(location) => FetchOutcome::Found(AssetLocation {
            asset_id,
            location: location.location,
            asset_type_id: response.asset_type_id,
            is_archived: response.is_archived,
        }),
        None => FetchOutcome::NotFound,
    }
}

impl<A: AssetDeliveryApi + AutoTraits> BatchFetcher for AssetFetcher<A> {
    type Key = AssetId;
    type Value = AssetLocation;

    async fn fetch_batch(
        &self,
        keys: Vec<AssetId>,
    ) -> Result<HashMap<AssetId, FetchOutcome<AssetLocation>>, FetchError> {
        let requests = keys
            .iter()
            .map(|asset_id| AssetDeliveryRequest {
                request_id: asset_id.to_string(),
                asset_id: *asset_id,
            })
            .collect();
        let responses = self.api.batch(requests).await?;
        let mut outcomes = HashMap::new();
        for response in responses {
            let Some(asset_id) = response
                .request_id
                .as_deref()
                .and_then(|request_id| request_id.parse::<u64>().ok())
                .map(AssetId)
                .filter(|asset_id| keys.contains(asset_id))
            else {
                tracing::trace!(request_id = ?response.request_id, "ignoring unrequested asset");
                continue;
            };
            outcomes.insert(asset_id, outcome(asset_id, response));
        }
        Ok(outcomes)
    }
}

impl<A: AssetDeliveryApi + AutoTraits> AssetProcessor<A> {
    pub fn with_api(api: A, config: ProcessorConfig) -> Self {
        BatchProcessor::new(AssetCanonicalizer, AssetFetcher::new(api), config)
    }
}
