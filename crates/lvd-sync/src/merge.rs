//! Pure merge of a normalized batch into the canonical venue list.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use lvd_core::normalize::{generate_slug, DEFAULT_CUISINE};
use lvd_core::{NormalizedVenue, Venue, VenueDataset};
use serde::Serialize;
use strsim::jaro_winkler;

use crate::matcher::comparable_name;

pub const DUPLICATE_SIMILARITY_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingPlaceId,
    MissingName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub place_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlugRename {
    pub place_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub dataset: VenueDataset,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<SkippedRecord>,
    pub renamed_slugs: Vec<SlugRename>,
}

/// Merges `incoming` into `existing` keyed by `place_id`.
///
/// Known values are never replaced by unknown ones, `createdAt` is never
/// touched, and slugs are made unique over the whole result. Existing order is
/// kept; new venues are appended in batch order.
pub fn merge_batch(
    existing: Vec<Venue>,
    incoming: Vec<NormalizedVenue>,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut venues = existing;
    let mut index: HashMap<String, usize> = venues
        .iter()
        .enumerate()
        .map(|(i, v)| (v.place_id.clone(), i))
        .collect();

    let mut added = Vec::new();
    let mut added_set = HashSet::new();
    let mut updated = Vec::new();
    let mut updated_set = HashSet::new();
    let mut skipped = Vec::new();

    for record in incoming {
        let place_id = record.place_id.trim().to_string();
        if place_id.is_empty() {
            skipped.push(SkippedRecord {
                place_id: record.place_id,
                reason: SkipReason::MissingPlaceId,
            });
            continue;
        }

        if let Some(&i) = index.get(&place_id) {
            merge_into(&mut venues[i], record, now);
            if !added_set.contains(&place_id) && updated_set.insert(place_id.clone()) {
                updated.push(place_id);
            }
            continue;
        }

        match new_venue(place_id.clone(), record, now) {
            Some(venue) => {
                index.insert(place_id.clone(), venues.len());
                venues.push(venue);
                added_set.insert(place_id.clone());
                added.push(place_id);
            }
            None => skipped.push(SkippedRecord {
                place_id,
                reason: SkipReason::MissingName,
            }),
        }
    }

    for venue in &mut venues {
        if venue.slug.trim().is_empty() {
            venue.slug = generate_slug(&venue.name, &venue.place_id);
        }
    }
    let renamed_slugs = resolve_slug_collisions(&mut venues);

    MergeOutcome {
        dataset: VenueDataset::new(venues, now),
        added,
        updated,
        skipped,
        renamed_slugs,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn keep_known<T>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

fn keep_non_empty<T>(current: &mut Vec<T>, incoming: Vec<T>) {
    if !incoming.is_empty() {
        *current = incoming;
    }
}

fn is_default_cuisine_only(cuisines: &std::collections::BTreeSet<String>) -> bool {
    cuisines.len() == 1 && cuisines.contains(DEFAULT_CUISINE)
}

fn merge_into(venue: &mut Venue, incoming: NormalizedVenue, now: DateTime<Utc>) {
    if let Some(name) = non_blank(incoming.name) {
        venue.name = name;
    }
    keep_known(&mut venue.address, non_blank(incoming.address));
    keep_known(&mut venue.postcode, non_blank(incoming.postcode));
    keep_known(&mut venue.borough, non_blank(incoming.borough));
    keep_known(&mut venue.area, non_blank(incoming.area));
    keep_known(&mut venue.location, incoming.location);
    keep_known(&mut venue.rating, incoming.rating);
    keep_known(&mut venue.user_ratings_total, incoming.user_ratings_total);
    keep_known(&mut venue.price_level, incoming.price_level);
    keep_known(&mut venue.website, non_blank(incoming.website));
    keep_known(&mut venue.phone, non_blank(incoming.phone));

    // A bare fallback tag carries no information about a venue already tagged.
    let fallback_only = is_default_cuisine_only(&incoming.cuisines);
    if !incoming.cuisines.is_empty() && !(fallback_only && !venue.cuisines.is_empty()) {
        venue.cuisines = incoming.cuisines;
    }
    if let Some(tags) = incoming.dietary_tags {
        venue.dietary_tags = tags;
    }
    keep_non_empty(&mut venue.opening_hours, incoming.opening_hours);
    keep_non_empty(&mut venue.types, incoming.types);
    keep_non_empty(&mut venue.photos, incoming.photos);

    if let Some(m) = &incoming.fsa {
        venue.apply_fsa_match(m, incoming.verified_fsa_at.unwrap_or(now));
    }
    venue.last_verified_google = venue.last_verified_google.max(incoming.verified_google_at);
    venue.updated_at = venue.updated_at.max(now);
}

fn new_venue(place_id: String, incoming: NormalizedVenue, now: DateTime<Utc>) -> Option<Venue> {
    let name = non_blank(incoming.name)?.trim().to_string();
    let mut venue = Venue {
        slug: generate_slug(&name, &place_id),
        place_id,
        name,
        address: non_blank(incoming.address),
        postcode: non_blank(incoming.postcode),
        borough: non_blank(incoming.borough),
        area: non_blank(incoming.area),
        location: incoming.location,
        cuisines: incoming.cuisines,
        dietary_tags: incoming.dietary_tags.unwrap_or_default(),
        rating: incoming.rating,
        user_ratings_total: incoming.user_ratings_total,
        price_level: incoming.price_level,
        website: non_blank(incoming.website),
        phone: non_blank(incoming.phone),
        opening_hours: incoming.opening_hours,
        types: incoming.types,
        photos: incoming.photos,
        fsa_fhrsid: None,
        fsa_rating: None,
        fsa_rating_text: None,
        fsa_status: None,
        fsa_authority: None,
        fsa_rating_date: None,
        fsa_url: None,
        fsa_match_score: None,
        last_verified_google: incoming.verified_google_at,
        last_verified_fsa: None,
        created_at: now,
        updated_at: now,
    };
    if let Some(m) = &incoming.fsa {
        venue.apply_fsa_match(m, incoming.verified_fsa_at.unwrap_or(now));
    }
    Some(venue)
}

/// First holder of a slug keeps it; later holders get the smallest free
/// `-n` suffix, n >= 2.
pub fn resolve_slug_collisions(venues: &mut [Venue]) -> Vec<SlugRename> {
    let mut taken = HashSet::new();
    let mut collided = Vec::new();
    for (i, venue) in venues.iter().enumerate() {
        if !taken.insert(venue.slug.clone()) {
            collided.push(i);
        }
    }

    let mut renames = Vec::new();
    for i in collided {
        let base = venues[i].slug.clone();
        let mut n = 2usize;
        let slug = loop {
            let candidate = format!("{base}-{n}");
            if !taken.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        taken.insert(slug.clone());
        renames.push(SlugRename {
            place_id: venues[i].place_id.clone(),
            from: base,
            to: slug.clone(),
        });
        venues[i].slug = slug;
    }
    renames
}

/// Two place_ids that look like one venue. Reported, never merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateSuspect {
    pub place_id_a: String,
    pub place_id_b: String,
    pub name_a: String,
    pub name_b: String,
    pub postcode: String,
    pub similarity: f64,
}

pub fn find_duplicate_suspects(venues: &[Venue], threshold: f64) -> Vec<DuplicateSuspect> {
    let mut by_postcode: BTreeMap<String, Vec<&Venue>> = BTreeMap::new();
    for venue in venues {
        if let Some(postcode) = venue.postcode.as_deref().filter(|p| !p.is_empty()) {
            by_postcode
                .entry(postcode.to_uppercase())
                .or_default()
                .push(venue);
        }
    }

    let mut suspects = Vec::new();
    for (postcode, group) in by_postcode {
        for i in 0..group.len() {
            for j in (i + 1)..group.len() {
                let (a, b) = (group[i], group[j]);
                if a.place_id == b.place_id {
                    continue;
                }
                let similarity = jaro_winkler(&comparable_name(&a.name), &comparable_name(&b.name));
                if similarity >= threshold {
                    suspects.push(DuplicateSuspect {
                        place_id_a: a.place_id.clone(),
                        place_id_b: b.place_id.clone(),
                        name_a: a.name.clone(),
                        name_b: b.name.clone(),
                        postcode: postcode.clone(),
                        similarity,
                    });
                }
            }
        }
    }
    suspects
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lvd_core::validate::validate_dataset_bytes;
    use lvd_core::{FsaMatch, FsaStatus};
    use std::collections::BTreeSet;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    fn incoming(place_id: &str, name: &str) -> NormalizedVenue {
        NormalizedVenue {
            place_id: place_id.into(),
            name: Some(name.into()),
            address: Some("1 Test St, London N1 1AA, UK".into()),
            postcode: Some("N1 1AA".into()),
            borough: Some("Islington".into()),
            cuisines: BTreeSet::from(["cafe".to_string()]),
            verified_google_at: Some(ts(1)),
            ..Default::default()
        }
    }

    fn fsa(fhrsid: u64, rating: &str) -> FsaMatch {
        let (rating_value, status) = FsaStatus::classify(rating);
        FsaMatch {
            fhrsid,
            business_name: "Test Cafe Ltd".into(),
            rating_value,
            rating_text: rating.into(),
            status,
            authority: "Islington".into(),
            inspection_date: Some("2025-11-02T00:00:00".into()),
            match_score: 1.0,
        }
    }

    fn seeded(records: Vec<NormalizedVenue>) -> Vec<Venue> {
        merge_batch(Vec::new(), records, ts(1)).dataset.venues
    }

    #[test]
    fn new_place_becomes_a_venue() {
        let outcome = merge_batch(Vec::new(), vec![incoming("abc123", "Test Cafe")], ts(2));
        assert_eq!(outcome.added, vec!["abc123".to_string()]);
        let venue = &outcome.dataset.venues[0];
        assert!(venue.slug.starts_with("test-cafe-"));
        assert_eq!(venue.created_at, ts(2));
        assert_eq!(venue.updated_at, ts(2));
        assert_eq!(venue.fsa_rating, None);
        assert_eq!(outcome.dataset.total_venues, 1);
        assert_eq!(outcome.dataset.last_updated, ts(2));
    }

    #[test]
    fn known_values_survive_a_sparse_fetch() {
        let mut first = incoming("abc123", "Test Cafe");
        first.rating = Some(4.5);
        first.phone = Some("020 7946 0000".into());
        first.opening_hours = vec!["Monday: 8:00 AM – 5:00 PM".into()];
        let existing = seeded(vec![first]);

        let sparse = NormalizedVenue {
            place_id: "abc123".into(),
            website: Some("https://testcafe.example".into()),
            ..Default::default()
        };
        let outcome = merge_batch(existing, vec![sparse], ts(3));
        let venue = &outcome.dataset.venues[0];

        assert_eq!(venue.rating, Some(4.5));
        assert_eq!(venue.phone.as_deref(), Some("020 7946 0000"));
        assert_eq!(venue.opening_hours.len(), 1);
        assert_eq!(venue.website.as_deref(), Some("https://testcafe.example"));
        assert_eq!(venue.name, "Test Cafe");
        assert_eq!(outcome.updated, vec!["abc123".to_string()]);
    }

    #[test]
    fn merging_twice_is_the_same_as_merging_once() {
        let batch = vec![
            incoming("abc123", "Test Cafe"),
            incoming("def456", "Other Place"),
        ];
        let once = merge_batch(Vec::new(), batch.clone(), ts(2));
        let twice = merge_batch(once.dataset.venues.clone(), batch, ts(2));

        assert_eq!(once.dataset, twice.dataset);
        assert!(twice.added.is_empty());
        assert_eq!(twice.updated.len(), 2);
    }

    #[test]
    fn identity_and_timestamps_are_stable() {
        let existing = merge_batch(Vec::new(), vec![incoming("abc123", "Test Cafe")], ts(5)).dataset.venues;
        let mut renamed = incoming("abc123", "Test Cafe & Bakery");
        renamed.rating = Some(4.1);

        let later = merge_batch(existing.clone(), vec![renamed.clone()], ts(7));
        let venue = &later.dataset.venues[0];
        assert_eq!(venue.place_id, "abc123");
        assert_eq!(venue.created_at, ts(5));
        assert_eq!(venue.updated_at, ts(7));
        assert_eq!(venue.name, "Test Cafe & Bakery");
        assert_eq!(venue.slug, existing[0].slug);

        let clock_skew = merge_batch(later.dataset.venues, vec![renamed], ts(6));
        assert_eq!(clock_skew.dataset.venues[0].updated_at, ts(7));
    }

    #[test]
    fn slugs_stay_unique_across_the_whole_set() {
        let batch = vec![
            incoming("aaaa1234abcd", "Pizza Place"),
            incoming("bbbb1234abcd", "Pizza Place"),
            incoming("cccc1234abcd", "Pizza Place"),
        ];
        let outcome = merge_batch(Vec::new(), batch, ts(1));
        let slugs: Vec<_> = outcome.dataset.venues.iter().map(|v| v.slug.as_str()).collect();
        assert_eq!(
            slugs,
            vec!["pizza-place-1234abcd", "pizza-place-1234abcd-2", "pizza-place-1234abcd-3"]
        );
        assert_eq!(outcome.renamed_slugs.len(), 2);

        let again = merge_batch(
            outcome.dataset.venues,
            vec![incoming("dddd1234abcd", "Pizza Place")],
            ts(2),
        );
        let unique: HashSet<_> = again.dataset.venues.iter().map(|v| v.slug.clone()).collect();
        assert_eq!(unique.len(), again.dataset.venues.len());
        assert_eq!(again.dataset.venues[3].slug, "pizza-place-1234abcd-4");
        assert_eq!(again.dataset.venues[0].slug, "pizza-place-1234abcd");
    }

    #[test]
    fn unusable_records_are_skipped() {
        let nameless = NormalizedVenue {
            place_id: "nameless01".into(),
            ..Default::default()
        };
        let blank_id = incoming("  ", "Ghost");
        let outcome = merge_batch(Vec::new(), vec![nameless, blank_id], ts(1));
        assert!(outcome.dataset.venues.is_empty());
        assert_eq!(
            outcome.skipped.iter().map(|s| s.reason).collect::<Vec<_>>(),
            vec![SkipReason::MissingName, SkipReason::MissingPlaceId]
        );
    }

    #[test]
    fn fsa_group_is_written_as_a_whole() {
        let mut rated = incoming("abc123", "Test Cafe");
        rated.fsa = Some(fsa(77, "5"));
        rated.verified_fsa_at = Some(ts(2));
        let existing = seeded(vec![rated]);
        assert_eq!(existing[0].fsa_rating, Some(5));

        // A Google-only refresh leaves the FSA group alone.
        let refreshed = merge_batch(existing, vec![incoming("abc123", "Test Cafe")], ts(3));
        let venue = &refreshed.dataset.venues[0];
        assert_eq!(venue.fsa_fhrsid, Some(77));
        assert_eq!(venue.last_verified_fsa, Some(ts(2)));

        // A new match replaces every FSA field together.
        let update = NormalizedVenue::fsa_update("abc123", fsa(88, "Exempt"), ts(4));
        let outcome = merge_batch(refreshed.dataset.venues, vec![update], ts(4));
        let venue = &outcome.dataset.venues[0];
        assert_eq!(venue.fsa_fhrsid, Some(88));
        assert_eq!(venue.fsa_rating, None);
        assert_eq!(venue.fsa_status, Some(FsaStatus::Exempt));
        assert_eq!(venue.fsa_rating_text.as_deref(), Some("Exempt"));
        assert_eq!(
            venue.fsa_url.as_deref(),
            Some("https://ratings.food.gov.uk/business/en-GB/88")
        );
        assert_eq!(venue.last_verified_fsa, Some(ts(4)));
        assert!(validate_dataset_bytes(&outcome.dataset.to_json_vec().unwrap()).is_valid());
    }

    #[test]
    fn coverage_matches_the_merged_venues() {
        let mut a = incoming("a1", "Alpha");
        a.fsa = Some(fsa(1, "4"));
        let mut b = incoming("b2", "Bravo");
        b.fsa = Some(fsa(2, "AwaitingInspection"));
        let c = incoming("c3", "Charlie");
        let outcome = merge_batch(Vec::new(), vec![a, b, c], ts(1));

        let with_rating = outcome
            .dataset
            .venues
            .iter()
            .filter(|v| v.fsa_rating.is_some())
            .count();
        assert_eq!(outcome.dataset.coverage.fsa_rating, with_rating);
        assert_eq!(with_rating, 1);
        assert_eq!(outcome.dataset.coverage.total, 3);
    }

    #[test]
    fn fallback_cuisine_does_not_replace_real_tags() {
        let existing = seeded(vec![incoming("abc123", "Test Cafe")]);
        let mut vague = incoming("abc123", "Test Cafe");
        vague.cuisines = BTreeSet::from([DEFAULT_CUISINE.to_string()]);
        let outcome = merge_batch(existing, vec![vague], ts(2));
        assert_eq!(
            outcome.dataset.venues[0].cuisines,
            BTreeSet::from(["cafe".to_string()])
        );
    }

    #[test]
    fn duplicate_suspects_need_same_postcode_and_similar_name() {
        let mut far = incoming("p3", "Dishoom Shoreditch");
        far.postcode = Some("WC2H 9FB".into());
        let venues = seeded(vec![
            incoming("p1", "Dishoom Shoreditch"),
            incoming("p2", "Dishoom Shoreditch Ltd"),
            far,
            incoming("p4", "Nando's"),
        ]);

        let suspects = find_duplicate_suspects(&venues, DUPLICATE_SIMILARITY_THRESHOLD);
        assert_eq!(suspects.len(), 1);
        assert_eq!(suspects[0].place_id_a, "p1");
        assert_eq!(suspects[0].place_id_b, "p2");
        assert_eq!(suspects[0].postcode, "N1 1AA");
        assert_eq!(suspects[0].similarity, 1.0);
    }
}
