//! Source adapter contracts for Google Places and the FSA ratings API, with
//! live HTTP clients and fixture-backed offline implementations.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lvd_core::normalize::{
    extract_postcode, infer_borough, infer_cuisines, infer_dietary_tags, VenueText,
};
use lvd_core::{FsaMatch, FsaStatus, GeoPoint, NormalizedVenue, Photo, PhotoSource};
use lvd_storage::{retry_with_backoff, BackoffPolicy, FetchError, HttpFetcher};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lvd-adapters";

pub const GOOGLE_SOURCE_ID: &str = "google-places";
pub const FSA_SOURCE_ID: &str = "fsa";

pub const GOOGLE_PLACES_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place";
pub const FSA_API_BASE_URL: &str = "https://api.ratings.food.gov.uk";

pub const DEFAULT_DETAILS_FIELDS: &str = "place_id,name,formatted_address,geometry,rating,\
user_ratings_total,price_level,opening_hours,website,formatted_phone_number,\
international_phone_number,photos,types,editorial_summary,business_status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{api} returned {status}{}", message_suffix(.message))]
    ApiStatus {
        api: &'static str,
        status: String,
        message: Option<String>,
    },
    #[error("building request url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

impl AdapterError {
    /// Quota responses that deserve another attempt after backing off.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::ApiStatus { status, .. } if status == "OVER_QUERY_LIMIT")
    }
}

// ---------------------------------------------------------------------------
// Raw Google Places shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatLngRaw {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRaw {
    pub location: LatLngRaw,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OpeningHoursRaw {
    #[serde(default)]
    pub open_now: Option<bool>,
    #[serde(default)]
    pub weekday_text: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPhoto {
    pub photo_reference: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub html_attributions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorialSummaryRaw {
    #[serde(default)]
    pub overview: Option<String>,
}

/// One place as the Places API returns it. Every field except `place_id` may
/// be absent depending on the endpoint and requested fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawGooglePlace {
    pub place_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub vicinity: Option<String>,
    #[serde(default)]
    pub geometry: Option<GeometryRaw>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub user_ratings_total: Option<u32>,
    #[serde(default)]
    pub price_level: Option<u8>,
    #[serde(default)]
    pub opening_hours: Option<OpeningHoursRaw>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub formatted_phone_number: Option<String>,
    #[serde(default)]
    pub international_phone_number: Option<String>,
    #[serde(default)]
    pub photos: Vec<RawPhoto>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub editorial_summary: Option<EditorialSummaryRaw>,
    #[serde(default)]
    pub business_status: Option<String>,
}

impl RawGooglePlace {
    pub fn is_permanently_closed(&self) -> bool {
        self.business_status.as_deref() == Some("CLOSED_PERMANENTLY")
    }

    /// Overlays a Place Details result; details win where present.
    pub fn with_details(self, details: RawGooglePlace) -> RawGooglePlace {
        RawGooglePlace {
            place_id: self.place_id,
            name: details.name.or(self.name),
            formatted_address: details.formatted_address.or(self.formatted_address),
            vicinity: details.vicinity.or(self.vicinity),
            geometry: details.geometry.or(self.geometry),
            rating: details.rating.or(self.rating),
            user_ratings_total: details.user_ratings_total.or(self.user_ratings_total),
            price_level: details.price_level.or(self.price_level),
            opening_hours: details.opening_hours.or(self.opening_hours),
            website: details.website.or(self.website),
            formatted_phone_number: details
                .formatted_phone_number
                .or(self.formatted_phone_number),
            international_phone_number: details
                .international_phone_number
                .or(self.international_phone_number),
            photos: if details.photos.is_empty() {
                self.photos
            } else {
                details.photos
            },
            types: if details.types.is_empty() {
                self.types
            } else {
                details.types
            },
            editorial_summary: details.editorial_summary.or(self.editorial_summary),
            business_status: details.business_status.or(self.business_status),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextSearchResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<RawGooglePlace>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailsResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<RawGooglePlace>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSearchRequest {
    pub query: String,
    pub location: Option<GeoPoint>,
    pub radius_m: Option<u32>,
    pub max_pages: usize,
}

/// Maps a Places API status to "has results", "empty", or an error.
pub fn check_google_status(
    status: &str,
    error_message: Option<&str>,
) -> Result<bool, AdapterError> {
    match status {
        "OK" => Ok(true),
        "ZERO_RESULTS" | "NOT_FOUND" => Ok(false),
        other => Err(AdapterError::ApiStatus {
            api: "google-places",
            status: other.to_string(),
            message: error_message.map(str::to_string),
        }),
    }
}

// ---------------------------------------------------------------------------
// Raw FSA shapes
// ---------------------------------------------------------------------------

/// The FSA API has served `RatingValue` as both string and number.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => s,
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFsaEstablishment {
    #[serde(rename = "FHRSID")]
    pub fhrsid: u64,
    #[serde(rename = "BusinessName", default)]
    pub business_name: String,
    #[serde(rename = "BusinessType", default)]
    pub business_type: Option<String>,
    #[serde(rename = "AddressLine1", default)]
    pub address_line1: Option<String>,
    #[serde(rename = "AddressLine2", default)]
    pub address_line2: Option<String>,
    #[serde(rename = "AddressLine3", default)]
    pub address_line3: Option<String>,
    #[serde(rename = "AddressLine4", default)]
    pub address_line4: Option<String>,
    #[serde(rename = "PostCode", default)]
    pub post_code: Option<String>,
    #[serde(rename = "RatingValue", default, deserialize_with = "string_or_number")]
    pub rating_value: String,
    #[serde(rename = "RatingDate", default)]
    pub rating_date: Option<String>,
    #[serde(rename = "LocalAuthorityName", default)]
    pub local_authority_name: String,
}

impl RawFsaEstablishment {
    pub fn address_text(&self) -> String {
        [
            &self.address_line1,
            &self.address_line2,
            &self.address_line3,
            &self.address_line4,
            &self.post_code,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ")
    }

    pub fn to_match(&self, match_score: f64) -> FsaMatch {
        let (rating_value, status) = FsaStatus::classify(&self.rating_value);
        FsaMatch {
            fhrsid: self.fhrsid,
            business_name: self.business_name.clone(),
            rating_value,
            rating_text: self.rating_value.clone(),
            status,
            authority: self.local_authority_name.clone(),
            inspection_date: self.rating_date.clone().filter(|d| !d.trim().is_empty()),
            match_score,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FsaSearchResponse {
    #[serde(default)]
    pub establishments: Vec<RawFsaEstablishment>,
}

// ---------------------------------------------------------------------------
// Source traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PlacesSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// All pages of one text search, up to `request.max_pages`.
    async fn text_search(
        &self,
        ctx: &AdapterContext,
        request: &TextSearchRequest,
    ) -> Result<Vec<RawGooglePlace>, AdapterError>;

    async fn place_details(
        &self,
        ctx: &AdapterContext,
        place_id: &str,
    ) -> Result<Option<RawGooglePlace>, AdapterError>;
}

#[async_trait]
pub trait HygieneSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// `address` may be a postcode, an area name, or empty.
    async fn search_establishments(
        &self,
        ctx: &AdapterContext,
        name: &str,
        address: &str,
    ) -> Result<Vec<RawFsaEstablishment>, AdapterError>;

    async fn establishment_by_id(
        &self,
        ctx: &AdapterContext,
        fhrsid: u64,
    ) -> Result<Option<RawFsaEstablishment>, AdapterError>;
}

fn decode<T: DeserializeOwned>(bytes: &[u8], context: &str) -> Result<T, AdapterError> {
    serde_json::from_slice(bytes).map_err(|source| AdapterError::Decode {
        context: context.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Google Places client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GooglePlacesConfig {
    pub api_key: String,
    pub base_url: String,
    pub details_fields: String,
    pub page_token_delay: Duration,
    pub quota_backoff: BackoffPolicy,
}

impl GooglePlacesConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GOOGLE_PLACES_BASE_URL.to_string(),
            details_fields: DEFAULT_DETAILS_FIELDS.to_string(),
            page_token_delay: Duration::from_secs(2),
            quota_backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GooglePlacesClient {
    http: Arc<HttpFetcher>,
    config: GooglePlacesConfig,
}

impl GooglePlacesClient {
    pub fn new(http: Arc<HttpFetcher>, config: GooglePlacesConfig) -> Self {
        Self { http, config }
    }

    fn text_search_url(
        &self,
        request: &TextSearchRequest,
        page_token: Option<&str>,
    ) -> Result<Url, AdapterError> {
        let endpoint = format!("{}/textsearch/json", self.config.base_url);
        let mut params = vec![("key", self.config.api_key.clone())];
        match page_token {
            Some(token) => params.push(("pagetoken", token.to_string())),
            None => {
                params.push(("query", request.query.clone()));
                if let Some(location) = request.location {
                    params.push(("location", format!("{},{}", location.lat, location.lng)));
                }
                if let Some(radius) = request.radius_m {
                    params.push(("radius", radius.to_string()));
                }
            }
        }
        Ok(Url::parse_with_params(&endpoint, &params)?)
    }

    fn details_url(&self, place_id: &str) -> Result<Url, AdapterError> {
        let endpoint = format!("{}/details/json", self.config.base_url);
        Ok(Url::parse_with_params(
            &endpoint,
            &[
                ("place_id", place_id),
                ("fields", self.config.details_fields.as_str()),
                ("key", self.config.api_key.as_str()),
            ],
        )?)
    }

    /// One text-search page; quota errors (and not-yet-valid page tokens) are
    /// retried with backoff.
    async fn text_search_page(
        &self,
        ctx: &AdapterContext,
        url: &Url,
        is_page_token: bool,
    ) -> Result<TextSearchResponse, AdapterError> {
        retry_with_backoff(
            &self.config.quota_backoff,
            |_attempt| async move {
                let fetched = self
                    .http
                    .fetch_bytes(ctx.run_id, GOOGLE_SOURCE_ID, url.as_str(), &[])
                    .await?;
                let page: TextSearchResponse = decode(&fetched.body, "places text search")?;
                check_google_status(&page.status, page.error_message.as_deref())?;
                Ok(page)
            },
            |err: &AdapterError| {
                err.is_rate_limited()
                    || (is_page_token
                        && matches!(err, AdapterError::ApiStatus { status, .. } if status == "INVALID_REQUEST"))
            },
        )
        .await
    }
}

#[async_trait]
impl PlacesSource for GooglePlacesClient {
    fn source_id(&self) -> &'static str {
        GOOGLE_SOURCE_ID
    }

    async fn text_search(
        &self,
        ctx: &AdapterContext,
        request: &TextSearchRequest,
    ) -> Result<Vec<RawGooglePlace>, AdapterError> {
        let mut places = Vec::new();
        let mut page_token: Option<String> = None;

        for page_index in 0..request.max_pages.max(1) {
            if page_token.is_some() {
                // Tokens only become valid a short while after being issued.
                tokio::time::sleep(self.config.page_token_delay).await;
            }
            let url = self.text_search_url(request, page_token.as_deref())?;
            let page = self
                .text_search_page(ctx, &url, page_token.is_some())
                .await?;
            debug!(
                query = %request.query,
                page_index,
                results = page.results.len(),
                "places text search page"
            );
            places.extend(page.results);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(places)
    }

    async fn place_details(
        &self,
        ctx: &AdapterContext,
        place_id: &str,
    ) -> Result<Option<RawGooglePlace>, AdapterError> {
        let url = self.details_url(place_id)?;
        let url = &url;
        retry_with_backoff(
            &self.config.quota_backoff,
            |_attempt| async move {
                let fetched = self
                    .http
                    .fetch_bytes(ctx.run_id, GOOGLE_SOURCE_ID, url.as_str(), &[])
                    .await?;
                let details: DetailsResponse = decode(&fetched.body, "place details")?;
                if check_google_status(&details.status, details.error_message.as_deref())? {
                    Ok(details.result)
                } else {
                    Ok(None)
                }
            },
            AdapterError::is_rate_limited,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// FSA client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FsaClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    page_size: usize,
}

impl FsaClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: 20,
        }
    }

    const HEADERS: [(&'static str, &'static str); 2] =
        [("x-api-version", "2"), ("accept", "application/json")];
}

#[async_trait]
impl HygieneSource for FsaClient {
    fn source_id(&self) -> &'static str {
        FSA_SOURCE_ID
    }

    async fn search_establishments(
        &self,
        ctx: &AdapterContext,
        name: &str,
        address: &str,
    ) -> Result<Vec<RawFsaEstablishment>, AdapterError> {
        let endpoint = format!("{}/Establishments", self.base_url);
        let page_size = self.page_size.to_string();
        let mut params = vec![("name", name), ("pageSize", page_size.as_str())];
        if !address.trim().is_empty() {
            params.push(("address", address));
        }
        let url = Url::parse_with_params(&endpoint, &params)?;
        let fetched = self
            .http
            .fetch_bytes(ctx.run_id, FSA_SOURCE_ID, url.as_str(), &Self::HEADERS)
            .await?;
        let response: FsaSearchResponse = decode(&fetched.body, "fsa establishments search")?;
        Ok(response.establishments)
    }

    async fn establishment_by_id(
        &self,
        ctx: &AdapterContext,
        fhrsid: u64,
    ) -> Result<Option<RawFsaEstablishment>, AdapterError> {
        let url = format!("{}/Establishments/{fhrsid}", self.base_url);
        match self
            .http
            .fetch_bytes(ctx.run_id, FSA_SOURCE_ID, &url, &Self::HEADERS)
            .await
        {
            Ok(fetched) => Ok(Some(decode(&fetched.body, "fsa establishment")?)),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixture-backed sources
// ---------------------------------------------------------------------------

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a captured text-search response from `<root>/google/text_search.json`.
#[derive(Debug, Clone)]
pub struct FixturePlacesSource {
    places: Vec<RawGooglePlace>,
}

impl FixturePlacesSource {
    pub fn load(fixtures_root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let response: TextSearchResponse =
            read_json_file(fixtures_root.as_ref().join("google").join("text_search.json"))?;
        Ok(Self::from_places(response.results))
    }

    pub fn from_places(places: Vec<RawGooglePlace>) -> Self {
        Self { places }
    }
}

#[async_trait]
impl PlacesSource for FixturePlacesSource {
    fn source_id(&self) -> &'static str {
        "google-places-fixture"
    }

    async fn text_search(
        &self,
        _ctx: &AdapterContext,
        _request: &TextSearchRequest,
    ) -> Result<Vec<RawGooglePlace>, AdapterError> {
        Ok(self.places.clone())
    }

    async fn place_details(
        &self,
        _ctx: &AdapterContext,
        place_id: &str,
    ) -> Result<Option<RawGooglePlace>, AdapterError> {
        Ok(self.places.iter().find(|p| p.place_id == place_id).cloned())
    }
}

/// Serves establishments from `<root>/fsa/establishments.json`, filtering them
/// roughly the way the live search does: any name word of 3+ letters must
/// appear in the business name, and the address text must appear in the
/// establishment's address or postcode.
#[derive(Debug, Clone)]
pub struct FixtureHygieneSource {
    establishments: Vec<RawFsaEstablishment>,
}

impl FixtureHygieneSource {
    pub fn load(fixtures_root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let response: FsaSearchResponse =
            read_json_file(fixtures_root.as_ref().join("fsa").join("establishments.json"))?;
        Ok(Self::from_establishments(response.establishments))
    }

    pub fn from_establishments(establishments: Vec<RawFsaEstablishment>) -> Self {
        Self { establishments }
    }
}

fn squash(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

#[async_trait]
impl HygieneSource for FixtureHygieneSource {
    fn source_id(&self) -> &'static str {
        "fsa-fixture"
    }

    async fn search_establishments(
        &self,
        _ctx: &AdapterContext,
        name: &str,
        address: &str,
    ) -> Result<Vec<RawFsaEstablishment>, AdapterError> {
        let words = name
            .split_whitespace()
            .map(squash)
            .filter(|w| w.len() > 2)
            .collect::<Vec<_>>();
        let wanted_address = squash(address);
        Ok(self
            .establishments
            .iter()
            .filter(|e| {
                let business = squash(&e.business_name);
                words.iter().any(|w| business.contains(w.as_str()))
            })
            .filter(|e| wanted_address.is_empty() || squash(&e.address_text()).contains(&wanted_address))
            .cloned()
            .collect())
    }

    async fn establishment_by_id(
        &self,
        _ctx: &AdapterContext,
        fhrsid: u64,
    ) -> Result<Option<RawFsaEstablishment>, AdapterError> {
        Ok(self
            .establishments
            .iter()
            .find(|e| e.fhrsid == fhrsid)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Raw → normalized
// ---------------------------------------------------------------------------

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Canonical-shape fields for one Google place. `area` is the search area the
/// place was found under, if any.
pub fn normalize_place(
    raw: &RawGooglePlace,
    area: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> NormalizedVenue {
    let name = non_empty(&raw.name);
    let address = non_empty(&raw.formatted_address).or_else(|| non_empty(&raw.vicinity));
    let description = raw
        .editorial_summary
        .as_ref()
        .and_then(|s| s.overview.as_deref());
    let text = VenueText {
        name: name.as_deref().unwrap_or_default(),
        types: &raw.types,
        description,
    };

    NormalizedVenue {
        place_id: raw.place_id.clone(),
        postcode: address.as_deref().and_then(extract_postcode),
        borough: address.as_deref().map(infer_borough),
        area: area.map(str::to_string),
        location: raw.geometry.as_ref().map(|g| GeoPoint {
            lat: g.location.lat,
            lng: g.location.lng,
        }),
        cuisines: infer_cuisines(&text),
        dietary_tags: Some(infer_dietary_tags(&text)),
        rating: raw.rating,
        user_ratings_total: raw.user_ratings_total,
        price_level: raw.price_level,
        website: non_empty(&raw.website),
        phone: non_empty(&raw.formatted_phone_number)
            .or_else(|| non_empty(&raw.international_phone_number)),
        opening_hours: raw
            .opening_hours
            .as_ref()
            .map(|h| h.weekday_text.clone())
            .unwrap_or_default(),
        types: raw.types.clone(),
        photos: raw
            .photos
            .iter()
            .map(|p| Photo {
                photo_reference: p.photo_reference.clone(),
                width: p.width,
                height: p.height,
                attributions: p.html_attributions.clone(),
                source: PhotoSource::GooglePlaces,
            })
            .collect(),
        fsa: None,
        verified_google_at: Some(fetched_at),
        verified_fsa_at: None,
        name,
        address,
    }
}
