// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use assert_matches::assert_matches;
use proptest::prelude::*;
use serde_json::json;
use test_case::test_case;

use super::{
    assets::{
        AssetDeliveryApi, AssetDeliveryRequest, AssetDeliveryResponse, AssetFetcher, AssetId,
        AssetLocation, AssetProcessor, AssetRequest, RawAssetRequest,
    },
    profiles::{
        ProfileFetcher, ProfileProcessor, ProfileRequest, RawProfileRequest, UserApi, UserId,
        UsersRequest, UsersResponse,
    },
    thumbnails::{
        demultiplex, RawThumbnailRequest, ThumbnailBatchApi, ThumbnailBatchRequest,
        ThumbnailBatchResponse, ThumbnailCanonicalizer, ThumbnailFetcher, ThumbnailFormat,
        ThumbnailKey, ThumbnailOverrides, ThumbnailRequest, ThumbnailSize, ThumbnailState,
        ThumbnailType,
    },
};
use crate::{
    canonical::{KeyCanonicalizer, MalformedRequest},
    fetch::{BatchFetcher, FetchError, FetchOutcome},
    processor::{ProcessorConfig, RequestError},
    test_utils::profile,
};

fn key(kind: ThumbnailType, target_id: u64, side: u32) -> ThumbnailKey {
    ThumbnailKey {
        kind,
        target_id,
        size: ThumbnailSize::new(side, side),
        format: ThumbnailFormat::Png,
        is_circular: false,
        token: None,
    }
}

#[test_case(ThumbnailType::AvatarHeadShot, 150 => 150 ; "supported size is kept")]
#[test_case(ThumbnailType::AvatarHeadShot, 200 => 352 ; "rounded up to next supported size")]
#[test_case(ThumbnailType::AvatarHeadShot, 1000 => 720 ; "clamped to largest head shot")]
#[test_case(ThumbnailType::AvatarBust, 110 => 150 ; "bust has no 110")]
#[test_case(ThumbnailType::AvatarBust, 720 => 420 ; "clamped to largest bust")]
#[test_case(ThumbnailType::GameIcon, 777 => 777 ; "unrestricted type")]
fn test_fit_size(kind: ThumbnailType, side: u32) -> u32 {
    let size = kind.fit_size(ThumbnailSize::new(side, side));
    assert_eq!(size.width, size.height);
    size.width
}

/// Tests that remapped requests land on a size the new type supports.
#[test]
fn test_remapped_request_is_resized() {
    let canonicalizer = ThumbnailCanonicalizer::new(
        ThumbnailOverrides::default().remap(ThumbnailType::AvatarHeadShot, ThumbnailType::AvatarBust),
    );
    let request =
        ThumbnailRequest::new(ThumbnailType::AvatarHeadShot, 9, ThumbnailSize::new(720, 720));
    let canonical = canonicalizer.canonicalize(&request);
    assert!(canonical.aliased);
    assert_eq!(canonical.key, key(ThumbnailType::AvatarBust, 9, 420));

    let explicit = ThumbnailRequest::new(ThumbnailType::Avatar, 9, ThumbnailSize::new(720, 720))
        .with_alias(ThumbnailType::AvatarHeadShot);
    assert_eq!(canonicalizer.canonicalize(&explicit).key, canonical.key);
}

/// Tests that cyclic remappings terminate.
#[test]
fn test_cyclic_overrides_terminate() {
    let overrides = ThumbnailOverrides::default()
        .remap(ThumbnailType::AvatarHeadShot, ThumbnailType::AvatarBust)
        .remap(ThumbnailType::AvatarBust, ThumbnailType::AvatarHeadShot);
    assert_eq!(
        overrides.resolve(ThumbnailType::AvatarHeadShot),
        ThumbnailType::AvatarHeadShot
    );
    assert_eq!(overrides.resolve(ThumbnailType::Asset), ThumbnailType::Asset);
}

#[test]
fn test_request_id_format() {
    let mut circular = key(ThumbnailType::AvatarHeadShot, 123, 150);
    circular.format = ThumbnailFormat::Webp;
    circular.is_circular = true;
    circular.token = Some("tok".into());
    assert_eq!(
        circular.request_id(),
        "123:tok:AvatarHeadShot:150x150:Webp:circular"
    );
    assert_eq!(
        key(ThumbnailType::GameIcon, 5, 512).request_id(),
        "5::GameIcon:512x512:Png:regular"
    );
}

/// Tests that an empty token is the same as no token, so one batch never carries two
/// keys with the same request id.
#[test]
fn test_empty_token_is_dropped() {
    let canonicalizer = ThumbnailCanonicalizer::default();
    let request = ThumbnailRequest::new(ThumbnailType::Avatar, 1, ThumbnailSize::new(48, 48));
    let plain = canonicalizer.canonicalize(&request).key;
    let empty = canonicalizer
        .canonicalize(&request.clone().with_token(""))
        .key;
    assert_eq!(plain, empty);
    assert_eq!(plain.token, None);

    let tokened = canonicalizer
        .canonicalize(&request.with_token("tok"))
        .key;
    let response: ThumbnailBatchResponse = serde_json::from_value(json!({
        "data": [
            { "requestId": plain.request_id(), "targetId": 1, "state": "Completed" },
            { "requestId": tokened.request_id(), "targetId": 1, "state": "Blocked" },
        ]
    }))
    .unwrap();
    let outcomes = demultiplex(vec![plain.clone(), tokened.clone()], response);
    assert_matches!(&outcomes[&plain], FetchOutcome::Found(t) if t.state == ThumbnailState::Completed);
    assert_matches!(&outcomes[&tokened], FetchOutcome::Found(t) if t.state == ThumbnailState::Blocked);
}

/// Tests that tokens containing the separator do not make request ids collide.
#[test]
fn test_request_ids_are_distinct_for_tokens_with_separator() {
    let mut first = key(ThumbnailType::Avatar, 1, 48);
    first.token = Some("a:Avatar:48x48:Png:regular".into());
    let mut second = key(ThumbnailType::Avatar, 1, 48);
    second.token = Some("a".into());
    let mut third = key(ThumbnailType::Avatar, 1, 48);
    third.token = Some("a:".into());
    let keys = [first, second, third, key(ThumbnailType::Avatar, 1, 48)];
    let ids = keys
        .iter()
        .map(ThumbnailKey::request_id)
        .collect::<BTreeSet<_>>();
    assert_eq!(ids.len(), keys.len());
}

/// Tests that keys are totally ordered, so they can be kept in sorted collections.
#[test]
fn test_keys_are_ordered() {
    let mut webp = key(ThumbnailType::GameIcon, 5, 512);
    webp.format = ThumbnailFormat::Webp;
    let png = key(ThumbnailType::GameIcon, 5, 512);
    let keys = BTreeSet::from([webp.clone(), png.clone(), png.clone()]);
    assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![png, webp]);
}

/// Tests that the order and presence of unrelated fields do not change the key.
#[test]
fn test_raw_requests_are_order_insensitive() {
    let first: RawThumbnailRequest = serde_json::from_value(json!({
        "type": "GameIcon",
        "targetId": 42,
        "size": "150x150",
        "refreshId": 3,
    }))
    .unwrap();
    let second: RawThumbnailRequest = serde_json::from_value(json!({
        "size": "150x150",
        "isCircular": false,
        "format": "png",
        "targetId": 42,
        "type": "GameIcon",
        "trackingTag": "sidebar",
    }))
    .unwrap();
    let canonicalizer = ThumbnailCanonicalizer::default();
    let first = ThumbnailRequest::try_from(first).unwrap();
    let second = ThumbnailRequest::try_from(second).unwrap();
    assert!(canonicalizer.is_alias(&first, &second));
    assert_eq!(canonicalizer.canonicalize(&first).refresh_id, Some(3));
}

#[test_case(json!({ "targetId": 1, "size": "48x48" }) => MalformedRequest::MissingField("type") ; "missing type")]
#[test_case(json!({ "type": "Avatar", "size": "48x48" }) => MalformedRequest::MissingField("targetId") ; "missing target")]
#[test_case(json!({ "type": "Avatar", "targetId": 1 }) => MalformedRequest::MissingField("size") ; "missing size")]
#[test_case(json!({ "type": "Banner", "targetId": 1, "size": "48x48" }) => MalformedRequest::InvalidField { field: "type", value: "Banner".into() } ; "unknown type")]
#[test_case(json!({ "type": "Avatar", "targetId": 1, "size": "big" }) => MalformedRequest::InvalidField { field: "size", value: "big".into() } ; "unparsable size")]
#[test_case(json!({ "type": "Avatar", "targetId": 0, "size": "48x48" }) => MalformedRequest::InvalidField { field: "targetId", value: "0".into() } ; "zero target")]
#[test_case(json!({ "type": "Avatar", "targetId": 1, "size": "48x48", "format": "gif" }) => MalformedRequest::InvalidField { field: "format", value: "gif".into() } ; "unknown format")]
fn test_malformed_thumbnail_request(raw: serde_json::Value) -> MalformedRequest {
    let raw: RawThumbnailRequest = serde_json::from_value(raw).unwrap();
    ThumbnailRequest::try_from(raw).unwrap_err()
}

#[test]
fn test_malformed_profile_and_asset_requests() {
    assert_eq!(
        ProfileRequest::try_from(RawProfileRequest::default()),
        Err(MalformedRequest::MissingField("userId"))
    );
    assert_eq!(
        AssetRequest::try_from(RawAssetRequest {
            asset_id: Some(0),
            refresh_id: None,
        }),
        Err(MalformedRequest::InvalidField {
            field: "assetId",
            value: "0".into()
        })
    );
    let raw: RawProfileRequest =
        serde_json::from_value(json!({ "refreshId": 2, "userId": 42 })).unwrap();
    assert_eq!(
        ProfileRequest::try_from(raw),
        Ok(ProfileRequest::new(42).with_refresh_id(2))
    );
}

proptest! {
    /// Refresh hints never contribute to the key.
    #[test]
    fn test_refresh_id_is_not_part_of_key(
        target_id in 1u64..,
        side in 1u32..1024,
        first in proptest::option::of(any::<u64>()),
        second in proptest::option::of(any::<u64>()),
    ) {
        let canonicalizer = ThumbnailCanonicalizer::default();
        let size = ThumbnailSize::new(side, side);
        let mut a = ThumbnailRequest::new(ThumbnailType::BadgeIcon, target_id, size);
        let mut b = a.clone();
        a.refresh_id = first;
        b.refresh_id = second;
        prop_assert_eq!(canonicalizer.canonicalize(&a).key, canonicalizer.canonicalize(&b).key);
        prop_assert_eq!(canonicalizer.canonicalize(&a).refresh_id, first);
    }
}

#[test]
fn test_thumbnail_batch_request_wire_format() {
    let mut key = key(ThumbnailType::GroupIcon, 77, 420);
    key.token = Some("secret".into());
    let request = ThumbnailBatchRequest::from(&key);
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({
            "requestId": "77:secret:GroupIcon:420x420:Png:regular",
            "type": "GroupIcon",
            "targetId": 77,
            "size": "420x420",
            "format": "Png",
            "isCircular": false,
            "token": "secret",
        })
    );
}

fn thumbnail_response() -> ThumbnailBatchResponse {
    serde_json::from_value(json!({
        "data": [
            {
                "requestId": "1::GameIcon:150x150:Png:regular",
                "targetId": 1,
                "state": "Completed",
                "imageUrl": "https://thumbnails.example/1.png",
                "version": "TN3",
            },
            {
                "requestId": "2::GameIcon:150x150:Png:regular",
                "targetId": 2,
                "errorCode": 11,
                "errorMessage": "The requested Ids are invalid",
            },
            {
                "requestId": "3::GameIcon:150x150:Png:regular",
                "targetId": 3,
                "state": "Pending",
                "imageUrl": "",
            },
            {
                "requestId": "99::GameIcon:150x150:Png:regular",
                "targetId": 99,
                "state": "Completed",
            },
            {
                "requestId": "4::GameIcon:150x150:Png:regular",
                "targetId": 4,
                "state": "SomethingNew",
            },
        ]
    }))
    .unwrap()
}

/// Tests that batch results are matched to keys by request id.
#[test]
fn test_demultiplex_thumbnails() {
    let keys = (1..=5)
        .map(|id| key(ThumbnailType::GameIcon, id, 150))
        .collect::<Vec<_>>();
    let outcomes = demultiplex(keys.clone(), thumbnail_response());

    assert_eq!(outcomes.len(), 4);
    let completed = assert_matches!(&outcomes[&keys[0]], FetchOutcome::Found(thumbnail) => thumbnail);
    assert_eq!(completed.state, ThumbnailState::Completed);
    assert!(completed.is_final());
    assert_eq!(completed.version.as_deref(), Some("TN3"));
    assert_eq!(
        outcomes[&keys[1]],
        FetchOutcome::Failed(FetchError::Rejected {
            code: 11,
            message: "The requested Ids are invalid".into()
        })
    );
    let pending = assert_matches!(&outcomes[&keys[2]], FetchOutcome::Found(thumbnail) => thumbnail);
    assert!(!pending.is_final());
    assert_eq!(pending.image_url, None);
    assert_matches!(
        &outcomes[&keys[3]],
        FetchOutcome::Found(thumbnail) if thumbnail.state == ThumbnailState::Unknown
    );
    assert!(!outcomes.contains_key(&keys[4]));
}

#[derive(Clone, Default)]
struct MockThumbnailApi {
    requests: Arc<Mutex<Vec<Vec<ThumbnailBatchRequest>>>>,
}

impl ThumbnailBatchApi for MockThumbnailApi {
    async fn post_batch(
        &self,
        requests: Vec<ThumbnailBatchRequest>,
    ) -> Result<ThumbnailBatchResponse, FetchError> {
        self.requests.lock().unwrap().push(requests);
        Ok(thumbnail_response())
    }
}

#[tokio::test]
async fn test_thumbnail_fetcher() {
    let api = MockThumbnailApi::default();
    let fetcher = ThumbnailFetcher::new(api.clone());
    let keys = vec![
        key(ThumbnailType::GameIcon, 1, 150),
        key(ThumbnailType::GameIcon, 3, 150),
    ];

    let outcomes = fetcher.fetch_batch(keys.clone()).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    let pending = assert_matches!(&outcomes[&keys[1]], FetchOutcome::Found(thumbnail) => thumbnail);
    assert!(fetcher.is_provisional(pending));

    let requests = api.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0][0].request_id, keys[0].request_id());
}

#[derive(Clone, Default)]
struct MockUserApi {
    requests: Arc<Mutex<Vec<UsersRequest>>>,
}

impl UserApi for MockUserApi {
    async fn get_users(&self, request: UsersRequest) -> Result<UsersResponse, FetchError> {
        // Only even ids exist.
        let data = request
            .user_ids
            .iter()
            .filter(|id| id.0 % 2 == 0)
            .map(|id| profile(id.0, &format!("user{id}")))
            .collect();
        self.requests.lock().unwrap().push(request);
        Ok(UsersResponse { data })
    }
}

#[test]
fn test_users_request_wire_format() {
    let request = UsersRequest {
        user_ids: vec![UserId(1), UserId(2)],
        exclude_banned_users: false,
    };
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({ "userIds": [1, 2], "excludeBannedUsers": false })
    );
    let response: UsersResponse = serde_json::from_value(json!({
        "data": [{ "id": 2, "name": "builder", "displayName": "Builder", "hasVerifiedBadge": true }]
    }))
    .unwrap();
    assert!(response.data[0].has_verified_badge);
}

#[tokio::test]
async fn test_profile_fetcher_reports_missing_users() {
    let fetcher = ProfileFetcher::new(MockUserApi::default());
    let outcomes = fetcher
        .fetch_batch(vec![UserId(1), UserId(2)])
        .await
        .unwrap();
    assert_eq!(outcomes[&UserId(1)], FetchOutcome::NotFound);
    assert_eq!(outcomes[&UserId(2)], FetchOutcome::Found(profile(2, "user2")));
}

/// Tests a profile processor on top of a user API, from request to negative cache entry.
#[tokio::test(start_paused = true)]
async fn test_profile_processor() {
    let api = MockUserApi::default();
    let processor = ProfileProcessor::with_api(api.clone(), ProcessorConfig::default());
    let results = processor
        .request_batch(&[ProfileRequest::new(1), ProfileRequest::new(4)])
        .await;
    assert_eq!(results[0], Ok(None));
    assert_eq!(results[1].as_ref().unwrap().as_ref().unwrap().name, "user4");
    assert!(processor.is_cached(&ProfileRequest::new(1)));
    assert_eq!(api.requests.lock().unwrap().len(), 1);
}

struct MockAssetApi;

impl AssetDeliveryApi for MockAssetApi {
    async fn batch(
        &self,
        requests: Vec<AssetDeliveryRequest>,
    ) -> Result<Vec<AssetDeliveryResponse>, FetchError> {
        let responses = requests
            .iter()
            .map(|request| match request.asset_id.0 {
                404 => json!({ "requestId": request.request_id, "errors": [{ "code": 404, "message": "Not found" }] }),
                403 => json!({ "requestId": request.request_id, "errors": [{ "code": 403, "message": "Forbidden" }] }),
                500 => json!({ "requestId": "unrelated", "locations": [{ "location": "https://assets.example/0" }] }),
                id => json!({
                    "requestId": request.request_id,
                    "locations": [{ "location": format!("https://assets.example/{id}") }],
                    "assetTypeId": 1,
                }),
            })
            .collect::<Vec<_>>();
        Ok(serde_json::from_value(json!(responses))?)
    }
}

#[tokio::test]
async fn test_asset_fetcher_isolates_errors() {
    let fetcher = AssetFetcher::new(MockAssetApi);
    let outcomes = fetcher
        .fetch_batch(vec![AssetId(1), AssetId(403), AssetId(404), AssetId(500)])
        .await
        .unwrap();
    assert_eq!(
        outcomes[&AssetId(1)],
        FetchOutcome::Found(AssetLocation {
            asset_id: AssetId(1),
            location: "https://assets.example/1".into(),
            asset_type_id: Some(1),
            is_archived: false,
        })
    );
    assert_eq!(
        outcomes[&AssetId(403)],
        FetchOutcome::Failed(FetchError::Rejected {
            code: 403,
            message: "Forbidden".into()
        })
    );
    assert_eq!(outcomes[&AssetId(404)], FetchOutcome::NotFound);
    assert!(!outcomes.contains_key(&AssetId(500)));
}

#[tokio::test(start_paused = true)]
async fn test_asset_processor_missing_response() {
    let processor = AssetProcessor::with_api(MockAssetApi, ProcessorConfig::default());
    let results = processor
        .request_batch(&[AssetRequest::new(7), AssetRequest::new(500)])
        .await;
    assert_eq!(
        results[0].as_ref().unwrap().as_ref().unwrap().location,
        "https://assets.example/7"
    );
    assert_eq!(results[1], Err(RequestError::MissingFromResponse));
}
