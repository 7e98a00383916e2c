// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thumbnails of avatars, games, groups, badges and catalog items.

use std::{collections::HashMap, fmt, str::FromStr};

use batchload_base::util::traits::AutoTraits;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    canonical::{CanonicalRequest, KeyCanonicalizer, MalformedRequest},
    fetch::{BatchFetcher, FetchError, FetchOutcome},
    processor::{BatchProcessor, ProcessorConfig},
};

/// A processor for thumbnails fetched through `A`.
pub type ThumbnailProcessor<A> = BatchProcessor<ThumbnailCanonicalizer, ThumbnailFetcher<A>>;

/// The kind of thumbnail, as named by the batch API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThumbnailType {
    Avatar,
    AvatarHeadShot,
    AvatarBust,
    Asset,
    BadgeIcon,
    BundleThumbnail,
    GameIcon,
    GamePass,
    GameThumbnail,
    GroupIcon,
    Outfit,
}

const fn square(side: u32) -> ThumbnailSize {
    ThumbnailSize {
        width: side,
        height: side,
    }
}

static HEAD_SHOT_SIZES: [ThumbnailSize; 11] = [
    square(48),
    square(50),
    square(60),
    square(75),
    square(100),
    square(110),
    square(150),
    square(180),
    square(352),
    square(420),
    square(720),
];

static BUST_SIZES: [ThumbnailSize; 9] = [
    square(48),
    square(50),
    square(60),
    square(75),
    square(100),
    square(150),
    square(180),
    square(352),
    square(420),
];

impl ThumbnailType {
    const ALL: [ThumbnailType; 11] = [
        ThumbnailType::Avatar,
        ThumbnailType::AvatarHeadShot,
        ThumbnailType::AvatarBust,
        ThumbnailType::Asset,
        ThumbnailType::BadgeIcon,
        ThumbnailType::BundleThumbnail,
        ThumbnailType::GameIcon,
        ThumbnailType::GamePass,
        ThumbnailType::GameThumbnail,
        ThumbnailType::GroupIcon,
        ThumbnailType::Outfit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ThumbnailType::Avatar => "Avatar",
            ThumbnailType::AvatarHeadShot => "AvatarHeadShot",
            ThumbnailType::AvatarBust => "AvatarBust",
            ThumbnailType::Asset => "Asset",
            ThumbnailType::BadgeIcon => "BadgeIcon",
            ThumbnailType::BundleThumbnail => "BundleThumbnail",
            ThumbnailType::GameIcon => "GameIcon",
            ThumbnailType::GamePass => "GamePass",
            ThumbnailType::GameThumbnail => "GameThumbnail",
            ThumbnailType::GroupIcon => "GroupIcon",
            ThumbnailType::Outfit => "Outfit",
        }
    }

    /// The sizes the API serves for this type, in increasing order, if it is restricted.
    pub fn supported_sizes(self) -> Option<&'static [ThumbnailSize]> {
        match self {
            ThumbnailType::AvatarHeadShot => Some(&HEAD_SHOT_SIZES),
            ThumbnailType::AvatarBust => Some(&BUST_SIZES),
            _ => None,
        }
    }

    /// The smallest supported size that covers `size`, or the largest supported size.
    pub fn fit_size(self, size: ThumbnailSize) -> ThumbnailSize {
        let Some(sizes) = self.supported_sizes() else {
            return size;
        };
        sizes
            .iter()
            .find(|candidate| candidate.width >= size.width && candidate.height >= size.height)
            .or(sizes.last())
            .copied()
            .unwrap_or(size)
    }
}

impl fmt::Display for ThumbnailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThumbnailType {
    type Err = MalformedRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MalformedRequest::invalid("type", s))
    }
}

/// Pixel dimensions, written `150x150` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ThumbnailSize {
    type Err = MalformedRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MalformedRequest::invalid("size", s);
        let (width, height) = s.split_once('x').ok_or_else(invalid)?;
        let width = width.parse::<u32>().map_err(|_| invalid())?;
        let height = height.parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl Serialize for ThumbnailSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ThumbnailSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ThumbnailFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ThumbnailFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ThumbnailFormat::Png => "Png",
            ThumbnailFormat::Jpeg => "Jpeg",
            ThumbnailFormat::Webp => "Webp",
        }
    }
}

impl fmt::Display for ThumbnailFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThumbnailFormat {
    type Err = MalformedRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ThumbnailFormat::Png),
            "jpeg" | "jpg" => Ok(ThumbnailFormat::Jpeg),
            "webp" => Ok(ThumbnailFormat::Webp),
            _ => Err(MalformedRequest::invalid("format", s)),
        }
    }
}

/// A request for one thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub kind: ThumbnailType,
    pub target_id: u64,
    pub size: ThumbnailSize,
    pub format: ThumbnailFormat,
    pub is_circular: bool,
    /// Opaque access token for resources that are not public.
    pub token: Option<String>,
    /// Serve this request with a thumbnail of another type.
    pub alias: Option<ThumbnailType>,
    pub refresh_id: Option<u64>,
}

impl ThumbnailRequest {
    pub fn new(kind: ThumbnailType, target_id: u64, size: ThumbnailSize) -> Self {
        Self {
            kind,
            target_id,
            size,
            format: ThumbnailFormat::default(),
            is_circular: false,
            token: None,
            alias: None,
            refresh_id: None,
        }
    }

    pub fn with_format(mut self, format: ThumbnailFormat) -> Self {
        self.format = format;
        self
    }

    pub fn circular(mut self) -> Self {
        self.is_circular = true;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_alias(mut self, alias: ThumbnailType) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn with_refresh_id(mut self, refresh_id: u64) -> Self {
        self.refresh_id = Some(refresh_id);
        self
    }
}

/// A thumbnail request as received from untyped callers, e.g. deserialized from a
/// message. Field order and unknown fields are irrelevant.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawThumbnailRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub target_id: Option<u64>,
    pub size: Option<String>,
    pub format: Option<String>,
    pub is_circular: Option<bool>,
    pub token: Option<String>,
    pub alias: Option<String>,
    pub refresh_id: Option<u64>,
}

impl TryFrom<RawThumbnailRequest> for ThumbnailRequest {
    type Error = MalformedRequest;

    fn try_from(raw: RawThumbnailRequest) -> Result<Self, Self::Error> {
        let kind = raw
            .kind
            .ok_or(MalformedRequest::MissingField("type"))?
            .parse::<ThumbnailType>()?;
        let target_id = raw
            .target_id
            .ok_or(MalformedRequest::MissingField("targetId"))?;
        if target_id == 0 {
            return Err(MalformedRequest::invalid("targetId", target_id));
        }
        let size = raw
            .size
            .ok_or(MalformedRequest::MissingField("size"))?
            .parse::<ThumbnailSize>()?;
        let format = raw
            .format
            .as_deref()
            .map(str::parse::<ThumbnailFormat>)
            .transpose()?
            .unwrap_or_default();
        let alias = raw
            .alias
            .as_deref()
            .map(str::parse::<ThumbnailType>)
            .transpose()?;
        Ok(ThumbnailRequest {
            kind,
            target_id,
            size,
            format,
            is_circular: raw.is_circular.unwrap_or(false),
            token: raw.token.filter(|token| !token.is_empty()),
            alias,
            refresh_id: raw.refresh_id,
        })
    }
}

/// The identity of a thumbnail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThumbnailKey {
    pub kind: ThumbnailType,
    pub target_id: u64,
    pub size: ThumbnailSize,
    pub format: ThumbnailFormat,
    pub is_circular: bool,
    pub token: Option<String>,
}

impl ThumbnailKey {
    /// The identifier the batch API echoes back with each result. Only the token may
    /// contain `:`, so distinct keys with non-empty tokens get distinct ids.
    pub fn request_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ThumbnailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.target_id,
            self.token.as_deref().unwrap_or_default(),
            self.kind,
            self.size,
            self.format,
            if self.is_circular { "circular" } else { "regular" },
        )
    }
}

/// Feature-flag driven remapping of thumbnail types, e.g. serving head shots as busts.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailOverrides {
    remaps: HashMap<ThumbnailType, ThumbnailType>,
}

impl ThumbnailOverrides {
    pub fn remap(mut self, from: ThumbnailType, to: ThumbnailType) -> Self {
        self.remaps.insert(from, to);
        self
    }

    /// Follows the remappings starting at `kind`. Cycles stop after every remapping was
    /// applied once.
    pub fn resolve(&self, mut kind: ThumbnailType) -> ThumbnailType {
        for _ in 0..self.remaps.len() {
            match self.remaps.get(&kind) {
                Some(&next) if next != kind => kind = next,
                _ => break,
            }
        }
        kind
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThumbnailCanonicalizer {
    overrides: ThumbnailOverrides,
}

impl ThumbnailCanonicalizer {
    pub fn new(overrides: ThumbnailOverrides) -> Self {
        Self { overrides }
    }
}

impl KeyCanonicalizer for ThumbnailCanonicalizer {
    const DOMAIN: &'static str = "thumbnails";

    type Request = ThumbnailRequest;
    type Key = ThumbnailKey;

    fn canonicalize(&self, request: &ThumbnailRequest) -> CanonicalRequest<ThumbnailKey> {
        let kind = self
            .overrides
            .resolve(request.alias.unwrap_or(request.kind));
        let aliased = kind != request.kind;
        // A remapped type may not be served at the requested size.
        let size = if aliased {
            kind.fit_size(request.size)
        } else {
            request.size
        };
        let key = ThumbnailKey {
            kind,
            target_id: request.target_id,
            size,
            format: request.format,
            is_circular: request.is_circular,
            token: request.token.clone().filter(|token| !token.is_empty()),
        };
        CanonicalRequest::new(key)
            .with_refresh_id(request.refresh_id)
            .with_aliased(aliased)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThumbnailState {
    Completed,
    Pending,
    InReview,
    Blocked,
    Error,
    TemporarilyUnavailable,
    #[serde(other)]
    Unknown,
}

/// A resolved thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub target_id: u64,
    pub state: ThumbnailState,
    pub image_url: Option<String>,
    pub version: Option<String>,
}

impl Thumbnail {
    /// Whether the API will not replace this thumbnail on its own.
    pub fn is_final(&self) -> bool {
        !matches!(
            self.state,
            ThumbnailState::Pending | ThumbnailState::InReview
        )
    }
}

/// One entry of the body posted to the thumbnail batch endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailBatchRequest {
    pub request_id: String,
    #[serde(rename = "type")]
    pub kind: ThumbnailType,
    pub target_id: u64,
    pub size: ThumbnailSize,
    pub format: ThumbnailFormat,
    pub is_circular: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl From<&ThumbnailKey> for ThumbnailBatchRequest {
    fn from(key: &ThumbnailKey) -> Self {
        Self {
            request_id: key.request_id(),
            kind: key.kind,
            target_id: key.target_id,
            size: key.size,
            format: key.format,
            is_circular: key.is_circular,
            token: key.token.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ThumbnailBatchResponse {
    #[serde(default)]
    pub data: Vec<ThumbnailBatchResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailBatchResult {
    pub request_id: Option<String>,
    #[serde(default)]
    pub target_id: u64,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: String,
    pub state: Option<ThumbnailState>,
    pub image_url: Option<String>,
    pub version: Option<String>,
}

/// Transport for the thumbnail batch endpoint.
#[allow(async_fn_in_trait)]
#[cfg_attr(not(web), trait_variant::make(Send))]
pub trait ThumbnailBatchApi {
    async fn post_batch(
        &self,
        requests: Vec<ThumbnailBatchRequest>,
    ) -> Result<ThumbnailBatchResponse, FetchError>;
}

/// Adapts a [`ThumbnailBatchApi`] to a [`BatchFetcher`].
#[derive(Debug, Clone)]
pub struct ThumbnailFetcher<A> {
    api: A,
}

impl<A> ThumbnailFetcher<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

/// Matches the results of a batch to the requested keys by request id. Results for
/// unknown ids are ignored; keys without a result are left out.
pub fn demultiplex(
    keys: Vec<ThumbnailKey>,
    response: ThumbnailBatchResponse,
) -> HashMap<ThumbnailKey, FetchOutcome<Thumbnail>> {
    let mut keys = keys
        .into_iter()
        .map(|key| (key.request_id(), key))
        .collect::<HashMap<_, _>>();
    let mut outcomes = HashMap::new();
    for result in response.data {
        let Some(key) = result
            .request_id
            .as_deref()
            .and_then(|request_id| keys.remove(request_id))
        else {
            tracing::trace!(request_id = ?result.request_id, "ignoring unrequested thumbnail");
            continue;
        };
        let outcome = if result.error_code != 0 {
            FetchOutcome::Failed(FetchError::Rejected {
                code: result.error_code,
                message: result.error_message,
            })
        } else if let Some(state) = result.state {
            FetchOutcome::Found(Thumbnail {
                target_id: result.target_id,
                state,
                image_url: result.image_url.filter(|url| !url.is_empty()),
                version: result.version,
            })
        } else {
            FetchOutcome::Failed(FetchError::Decode(format!(
                "thumbnail {} has no state",
                key.request_id()
            )))
        };
        outcomes.insert(key, outcome);
    }
    outcomes
}

impl<A: ThumbnailBatchApi + AutoTraits> BatchFetcher for ThumbnailFetcher<A> {
    type Key = ThumbnailKey;
    type Value = Thumbnail;

    async fn fetch_batch(
        &self,
        keys: Vec<ThumbnailKey>,
    ) -> Result<HashMap<ThumbnailKey, FetchOutcome<Thumbnail>>, FetchError> {
        let requests = keys.iter().map(ThumbnailBatchRequest::from).collect();
        let response = self.api.post_batch(requests).await?;
        Ok(demultiplex(keys, response))
    }

    fn is_provisional(&self, thumbnail: &Thumbnail) -> bool {
        !thumbnail.is_final()
    }
}

impl<A: ThumbnailBatchApi + AutoTraits> ThumbnailProcessor<A> {
    /// Creates a thumbnail processor on top of `api`.
    pub fn with_api(
        api: A,
        overrides: ThumbnailOverrides,
        config: ProcessorConfig,
    ) -> Self {
        BatchProcessor::new(
            ThumbnailCanonicalizer::new(overrides),
            ThumbnailFetcher::new(api),
            config,
        )
    }
}
