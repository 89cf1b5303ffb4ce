//! Structural checks over the raw bytes of a dataset document.
//!
//! Runs on `serde_json::Value` first so a document that no longer fits the
//! typed model still produces a useful list of problems.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{Coverage, VenueDataset};

const REQUIRED_STRING_FIELDS: &[&str] = &["place_id", "name", "slug"];
const FSA_GROUP_FIELDS: &[&str] = &[
    "fsa_fhrsid",
    "fsa_rating_text",
    "fsa_status",
    "fsa_authority",
    "fsa_url",
    "lastVerifiedFSA",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    InvalidJson { message: String },
    NotAnObject,
    MissingVenuesArray,
    CountMismatch { stored: Option<u64>, actual: usize },
    DuplicatePlaceId { place_id: String },
    DuplicateSlug { slug: String },
    MissingField { index: usize, field: String },
    BadTimestamps { place_id: String },
    PartialFsaData { place_id: String },
    CoverageMismatch,
    Schema { message: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { message } => write!(f, "invalid JSON: {message}"),
            Self::NotAnObject => write!(f, "document root is not an object"),
            Self::MissingVenuesArray => write!(f, "missing `venues` array"),
            Self::CountMismatch { stored, actual } => write!(
                f,
                "totalVenues {} does not match venues.length {actual}",
                stored.map(|n| n.to_string()).unwrap_or_else(|| "<missing>".into())
            ),
            Self::DuplicatePlaceId { place_id } => write!(f, "duplicate place_id {place_id}"),
            Self::DuplicateSlug { slug } => write!(f, "duplicate slug {slug}"),
            Self::MissingField { index, field } => {
                write!(f, "venue #{index} missing required field `{field}`")
            }
            Self::BadTimestamps { place_id } => {
                write!(f, "{place_id}: createdAt/updatedAt missing or updatedAt < createdAt")
            }
            Self::PartialFsaData { place_id } => {
                write!(f, "{place_id}: FSA fields partially populated")
            }
            Self::CoverageMismatch => write!(f, "stored coverage differs from recomputed coverage"),
            Self::Schema { message } => write!(f, "schema: {message}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub venue_count: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!("ok ({} venues)", self.venue_count);
        }
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn validate_dataset_bytes(bytes: &[u8]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(err) => {
            report.issues.push(ValidationIssue::InvalidJson {
                message: err.to_string(),
            });
            return report;
        }
    };
    let Some(root) = value.as_object() else {
        report.issues.push(ValidationIssue::NotAnObject);
        return report;
    };
    let Some(venues) = root.get("venues").and_then(Value::as_array) else {
        report.issues.push(ValidationIssue::MissingVenuesArray);
        return report;
    };
    report.venue_count = venues.len();

    let stored = root.get("totalVenues").and_then(Value::as_u64);
    if stored != Some(venues.len() as u64) {
        report.issues.push(ValidationIssue::CountMismatch {
            stored,
            actual: venues.len(),
        });
    }

    let mut place_ids = HashSet::new();
    let mut slugs = HashSet::new();
    for (index, venue) in venues.iter().enumerate() {
        for field in REQUIRED_STRING_FIELDS {
            let present = venue
                .get(*field)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if !present {
                report.issues.push(ValidationIssue::MissingField {
                    index,
                    field: field.to_string(),
                });
            }
        }

        let place_id = venue
            .get("place_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !place_id.is_empty() && !place_ids.insert(place_id.clone()) {
            report.issues.push(ValidationIssue::DuplicatePlaceId {
                place_id: place_id.clone(),
            });
        }
        if let Some(slug) = venue.get("slug").and_then(Value::as_str) {
            if !slug.is_empty() && !slugs.insert(slug.to_string()) {
                report.issues.push(ValidationIssue::DuplicateSlug {
                    slug: slug.to_string(),
                });
            }
        }

        if !timestamps_ordered(venue) {
            report.issues.push(ValidationIssue::BadTimestamps {
                place_id: place_id.clone(),
            });
        }
        if !fsa_group_consistent(venue) {
            report.issues.push(ValidationIssue::PartialFsaData { place_id });
        }
    }

    if !report.is_valid() {
        return report;
    }

    match serde_json::from_value::<VenueDataset>(value) {
        Ok(dataset) => {
            if dataset.coverage != Coverage::compute(&dataset.venues) {
                report.issues.push(ValidationIssue::CoverageMismatch);
            }
        }
        Err(err) => report.issues.push(ValidationIssue::Schema {
            message: err.to_string(),
        }),
    }
    report
}

fn timestamp(venue: &Value, field: &str) -> Option<DateTime<Utc>> {
    venue
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn timestamps_ordered(venue: &Value) -> bool {
    match (timestamp(venue, "createdAt"), timestamp(venue, "updatedAt")) {
        (Some(created), Some(updated)) => updated >= created,
        _ => false,
    }
}

fn fsa_group_consistent(venue: &Value) -> bool {
    let populated = FSA_GROUP_FIELDS
        .iter()
        .filter(|field| venue.get(**field).is_some_and(|v| !v.is_null()))
        .count();
    let rating_set = venue.get("fsa_rating").is_some_and(|v| !v.is_null());
    match populated {
        0 => !rating_set,
        n => n == FSA_GROUP_FIELDS.len(),
    }
}
