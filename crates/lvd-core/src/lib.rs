//! Canonical venue model, coverage statistics and normalization for LVD.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod normalize;
pub mod validate;

pub const CRATE_NAME: &str = "lvd-core";

pub const FSA_BUSINESS_URL_BASE: &str = "https://ratings.food.gov.uk/business/en-GB";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DietaryTags {
    pub halal: bool,
    pub vegan: bool,
    pub vegetarian: bool,
    pub gluten_free: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoSource {
    GooglePlaces,
    Manual,
}

/// Image descriptor with provenance. Order within a venue is display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub photo_reference: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub attributions: Vec<String>,
    pub source: PhotoSource,
}

/// Interpretation of the FSA `RatingValue` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsaStatus {
    Rated,
    Exempt,
    AwaitingInspection,
    AwaitingPublication,
    Other,
}

impl FsaStatus {
    /// Splits a raw `RatingValue` into a numeric rating (0-5) and a status.
    pub fn classify(rating_value: &str) -> (Option<u8>, FsaStatus) {
        let trimmed = rating_value.trim();
        if let Ok(n) = trimmed.parse::<u8>() {
            if n <= 5 {
                return (Some(n), FsaStatus::Rated);
            }
        }
        let folded = trimmed
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let status = match folded.as_str() {
            "exempt" => FsaStatus::Exempt,
            "awaitinginspection" => FsaStatus::AwaitingInspection,
            "awaitingpublication" => FsaStatus::AwaitingPublication,
            _ => FsaStatus::Other,
        };
        (None, status)
    }
}

/// Result of linking a venue to one FSA establishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsaMatch {
    pub fhrsid: u64,
    pub business_name: String,
    pub rating_value: Option<u8>,
    pub rating_text: String,
    pub status: FsaStatus,
    pub authority: String,
    pub inspection_date: Option<String>,
    pub match_score: f64,
}

impl FsaMatch {
    pub fn fsa_url(&self) -> String {
        fsa_url_for(self.fhrsid)
    }
}

pub fn fsa_url_for(fhrsid: u64) -> String {
    format!("{FSA_BUSINESS_URL_BASE}/{fhrsid}")
}

/// Canonical venue record, keyed by Google `place_id`.
///
/// Field names are a public contract with the site; add fields, never rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub place_id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub borough: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub cuisines: BTreeSet<String>,
    #[serde(default)]
    pub dietary_tags: DietaryTags,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub user_ratings_total: Option<u32>,
    #[serde(default)]
    pub price_level: Option<u8>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub opening_hours: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub fsa_fhrsid: Option<u64>,
    #[serde(default)]
    pub fsa_rating: Option<u8>,
    #[serde(default)]
    pub fsa_rating_text: Option<String>,
    #[serde(default)]
    pub fsa_status: Option<FsaStatus>,
    #[serde(default)]
    pub fsa_authority: Option<String>,
    #[serde(default)]
    pub fsa_rating_date: Option<String>,
    #[serde(default)]
    pub fsa_url: Option<String>,
    #[serde(default)]
    pub fsa_match_score: Option<f64>,
    #[serde(rename = "lastVerifiedGoogle", default)]
    pub last_verified_google: Option<DateTime<Utc>>,
    #[serde(rename = "lastVerifiedFSA", default)]
    pub last_verified_fsa: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Venue {
    /// Writes the whole FSA group from one match.
    pub fn apply_fsa_match(&mut self, m: &FsaMatch, verified_at: DateTime<Utc>) {
        self.fsa_fhrsid = Some(m.fhrsid);
        self.fsa_rating = m.rating_value;
        self.fsa_rating_text = Some(m.rating_text.clone());
        self.fsa_status = Some(m.status);
        self.fsa_authority = Some(m.authority.clone());
        self.fsa_rating_date = m.inspection_date.clone();
        self.fsa_url = Some(m.fsa_url());
        self.fsa_match_score = Some(m.match_score);
        self.last_verified_fsa = Some(verified_at);
    }

    pub fn has_fsa_match(&self) -> bool {
        self.fsa_fhrsid.is_some()
    }
}

/// Freshly normalized record headed for the merger. Only `place_id` is required;
/// a `None` field means "unknown in this fetch", never "clear it".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedVenue {
    pub place_id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub postcode: Option<String>,
    pub borough: Option<String>,
    pub area: Option<String>,
    pub location: Option<GeoPoint>,
    pub cuisines: BTreeSet<String>,
    pub dietary_tags: Option<DietaryTags>,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<u32>,
    pub price_level: Option<u8>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub opening_hours: Vec<String>,
    pub types: Vec<String>,
    pub photos: Vec<Photo>,
    pub fsa: Option<FsaMatch>,
    pub verified_google_at: Option<DateTime<Utc>>,
    pub verified_fsa_at: Option<DateTime<Utc>>,
}

impl NormalizedVenue {
    /// FSA-only update for an existing venue.
    pub fn fsa_update(place_id: impl Into<String>, m: FsaMatch, at: DateTime<Utc>) -> Self {
        Self {
            place_id: place_id.into(),
            fsa: Some(m),
            verified_fsa_at: Some(at),
            ..Default::default()
        }
    }
}

/// Populated-field counts over the whole venue list. Derived, never edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coverage {
    pub total: usize,
    pub rating: usize,
    pub fsa_rating: usize,
    pub photos: usize,
    pub website: usize,
    pub phone: usize,
    pub postcode: usize,
    pub opening_hours: usize,
}

impl Coverage {
    pub fn compute(venues: &[Venue]) -> Self {
        let count = |pred: fn(&Venue) -> bool| venues.iter().filter(|v| pred(v)).count();
        Self {
            total: venues.len(),
            rating: count(|v| v.rating.is_some()),
            fsa_rating: count(|v| v.fsa_rating.is_some()),
            photos: count(|v| !v.photos.is_empty()),
            website: count(|v| v.website.is_some()),
            phone: count(|v| v.phone.is_some()),
            postcode: count(|v| v.postcode.is_some()),
            opening_hours: count(|v| !v.opening_hours.is_empty()),
        }
    }

    pub fn report(&self) -> CoverageReport {
        let fields = [
            ("rating", self.rating),
            ("fsa_rating", self.fsa_rating),
            ("photos", self.photos),
            ("website", self.website),
            ("phone", self.phone),
            ("postcode", self.postcode),
            ("opening_hours", self.opening_hours),
        ]
        .into_iter()
        .map(|(name, count)| FieldCoverage {
            field: name.to_string(),
            count,
            percent: percent(count, self.total),
        })
        .collect();
        CoverageReport {
            total: self.total,
            fields,
        }
    }
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = count as f64 * 100.0 / total as f64;
    (raw * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCoverage {
    pub field: String,
    pub count: usize,
    pub percent: f64,
}

/// Per-field population percentages. Advisory gating input for downstream steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub total: usize,
    pub fields: Vec<FieldCoverage>,
}

impl CoverageReport {
    pub fn field(&self, name: &str) -> Option<&FieldCoverage> {
        self.fields.iter().find(|f| f.field == name)
    }

    /// Fields whose population percentage is below `min_percent`.
    pub fn below(&self, min_percent: f64) -> Vec<&FieldCoverage> {
        self.fields.iter().filter(|f| f.percent < min_percent).collect()
    }

    pub fn meets(&self, min_percent: f64) -> bool {
        self.below(min_percent).is_empty()
    }
}

/// Root document of `venues.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueDataset {
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "totalVenues")]
    pub total_venues: usize,
    pub coverage: Coverage,
    pub venues: Vec<Venue>,
}

impl VenueDataset {
    pub fn new(venues: Vec<Venue>, last_updated: DateTime<Utc>) -> Self {
        Self {
            last_updated,
            total_venues: venues.len(),
            coverage: Coverage::compute(&venues),
            venues,
        }
    }

    pub fn empty(now: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), now)
    }

    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json_vec(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn find(&self, place_id: &str) -> Option<&Venue> {
        self.venues.iter().find(|v| v.place_id == place_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    fn venue(place_id: &str) -> Venue {
        Venue {
            place_id: place_id.into(),
            slug: format!("v-{place_id}"),
            name: "V".into(),
            address: None,
            postcode: None,
            borough: None,
            area: None,
            location: None,
            cuisines: BTreeSet::new(),
            dietary_tags: DietaryTags::default(),
            rating: None,
            user_ratings_total: None,
            price_level: None,
            website: None,
            phone: None,
            opening_hours: vec![],
            types: vec![],
            photos: vec![],
            fsa_fhrsid: None,
            fsa_rating: None,
            fsa_rating_text: None,
            fsa_status: None,
            fsa_authority: None,
            fsa_rating_date: None,
            fsa_url: None,
            fsa_match_score: None,
            last_verified_google: None,
            last_verified_fsa: None,
            created_at: ts(1),
            updated_at: ts(1),
        }
    }

    #[test]
    fn fsa_rating_values_split_into_number_and_status() {
        assert_eq!(FsaStatus::classify("5"), (Some(5), FsaStatus::Rated));
        assert_eq!(FsaStatus::classify(" 0 "), (Some(0), FsaStatus::Rated));
        assert_eq!(FsaStatus::classify("Exempt"), (None, FsaStatus::Exempt));
        assert_eq!(
            FsaStatus::classify("AwaitingInspection"),
            (None, FsaStatus::AwaitingInspection)
        );
        assert_eq!(
            FsaStatus::classify("Awaiting Publication"),
            (None, FsaStatus::AwaitingPublication)
        );
        assert_eq!(FsaStatus::classify("7"), (None, FsaStatus::Other));
        assert_eq!(FsaStatus::classify("Pass"), (None, FsaStatus::Other));
    }

    #[test]
    fn coverage_counts_populated_fields() {
        let mut a = venue("a");
        a.rating = Some(4.5);
        a.fsa_rating = Some(5);
        let mut b = venue("b");
        b.website = Some("https://b.example".into());
        let c = venue("c");

        let coverage = Coverage::compute(&[a, b, c]);
        assert_eq!(coverage.total, 3);
        assert_eq!(coverage.rating, 1);
        assert_eq!(coverage.fsa_rating, 1);
        assert_eq!(coverage.website, 1);
        assert_eq!(coverage.photos, 0);

        let report = coverage.report();
        assert_eq!(report.field("rating").unwrap().percent, 33.3);
        assert!(!report.meets(50.0));
        assert!(Coverage::default().report().meets(0.0));
    }

    #[test]
    fn dataset_serializes_contract_field_names() {
        let mut v = venue("abc123");
        v.apply_fsa_match(
            &FsaMatch {
                fhrsid: 42,
                business_name: "V".into(),
                rating_value: Some(4),
                rating_text: "4".into(),
                status: FsaStatus::Rated,
                authority: "Hackney".into(),
                inspection_date: Some("2025-01-02T00:00:00".into()),
                match_score: 1.0,
            },
            ts(2),
        );
        let dataset = VenueDataset::new(vec![v], ts(3));
        let json: serde_json::Value =
            serde_json::from_slice(&dataset.to_json_vec().unwrap()).unwrap();

        assert_eq!(json["totalVenues"], 1);
        assert!(json["lastUpdated"].is_string());
        assert_eq!(json["coverage"]["fsa_rating"], 1);
        let venue = &json["venues"][0];
        assert_eq!(venue["place_id"], "abc123");
        assert_eq!(venue["fsa_url"], "https://ratings.food.gov.uk/business/en-GB/42");
        assert_eq!(venue["fsa_status"], "rated");
        assert!(venue["lastVerifiedFSA"].is_string());
        assert!(venue["lastVerifiedGoogle"].is_null());
        assert!(venue["createdAt"].is_string());
    }
}
