// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! User profiles, fetched through the multi-user lookup endpoint.

use std::{collections::HashMap, fmt};

use batchload_base::util::traits::AutoTraits;
use serde::{Deserialize, Serialize};

use crate::{
    canonical::{CanonicalRequest, KeyCanonicalizer, MalformedRequest},
    fetch::{BatchFetcher, FetchError, FetchOutcome},
    processor::{BatchProcessor, ProcessorConfig},
};

pub type ProfileProcessor<A> = BatchProcessor<ProfileCanonicalizer, ProfileFetcher<A>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    pub user_id: UserId,
    pub refresh_id: Option<u64>,
}

impl ProfileRequest {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id: UserId(user_id),
            refresh_id: None,
        }
    }

    pub fn with_refresh_id(mut self, refresh_id: u64) -> Self {
        self.refresh_id = Some(refresh_id);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProfileRequest {
    pub user_id: Option<u64>,
    pub refresh_id: Option<u64>,
}

impl TryFrom<RawProfileRequest> for ProfileRequest {
    type Error = MalformedRequest;

    fn try_from(raw: RawProfileRequest) -> Result<Self, Self::Error> {
        let user_id = raw
            .user_id
            .ok_or(MalformedRequest::MissingField("userId"))?;
        if user_id == 0 {
            return Err(MalformedRequest::invalid("userId", user_id));
        }
        Ok(ProfileRequest {
            user_id: UserId(user_id),
            refresh_id: raw.refresh_id,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileCanonicalizer;

impl KeyCanonicalizer for ProfileCanonicalizer {
    const DOMAIN: &'static str = "profiles";

    type Request = ProfileRequest;
    type Key = UserId;

    fn canonicalize(&self, request: &ProfileRequest) -> CanonicalRequest<UserId> {
        CanonicalRequest::new(request.user_id).with_refresh_id(request.refresh_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub has_verified_badge: bool,
}

/// Body of the multi-user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersRequest {
    pub user_ids: Vec<UserId>,
    pub exclude_banned_users: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UsersResponse {
    #[serde(default)]
    pub data: Vec<UserProfile>,
}

/// Transport for the multi-user lookup endpoint.
#[allow(async_fn_in_trait)]
#[cfg_attr(not(web), trait_variant::make(Send))]
pub trait UserApi {
    async fn get_users(&self, request: UsersRequest) -> Result<UsersResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ProfileFetcher<A> {
    api: A,
}

impl<A> ProfileFetcher<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

impl<A: UserApi + AutoTraits> BatchFetcher for ProfileFetcher<A> {
    type Key = UserId;
    type Value = UserProfile;

    async fn fetch_batch(
        &self,
        keys: Vec<UserId>,
    ) -> Result<HashMap<UserId, FetchOutcome<UserProfile>>, FetchError> {
        let request = UsersRequest {
            user_ids: keys.clone(),
            exclude_banned_users: false,
        };
        let response = self.api.get_users(request).await?;
        let mut profiles = response
            .data
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect::<HashMap<_, _>>();
        // Users that do not exist are simply left out of the response.
        Ok(keys
            .into_iter()
            .map(|id| {
                let outcome = profiles
                    .remove(&id)
                    .map_or(FetchOutcome::NotFound, FetchOutcome::Found);
                (id, outcome)
            })
            .collect())
    }
}

impl<A: UserApi + AutoTraits> ProfileProcessor<A> {
    pub fn with_api(api: A, config: ProcessorConfig) -> Self {
        BatchProcessor::new(ProfileCanonicalizer, ProfileFetcher::new(api), config)
    }
}
