//! Links a Google venue to its FSA establishment by name and postcode.

use std::collections::HashSet;

use lvd_adapters::{AdapterContext, HygieneSource, RawFsaEstablishment};
use lvd_core::FsaMatch;
use serde::Serialize;
use tracing::{debug, warn};

/// Suffix and filler words that say nothing about which business it is.
pub const GENERIC_NAME_WORDS: &[&str] = &[
    "ltd",
    "limited",
    "plc",
    "restaurant",
    "cafe",
    "bar",
    "pub",
    "kitchen",
    "grill",
    "bistro",
    "brasserie",
    "and",
    "the",
    "&",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    /// A candidate is accepted only when its score is strictly above this.
    pub threshold: f64,
    pub exact_score: f64,
    pub containment_score: f64,
    /// Words this short or shorter are ignored by the overlap ratio.
    pub ignore_words_up_to: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            exact_score: 1.0,
            containment_score: 0.8,
            ignore_words_up_to: 2,
        }
    }
}

pub fn clean_name(name: &str) -> String {
    let lowered = name
        .to_lowercase()
        .replace('’', "'")
        .replace("'s", "")
        .replace('\'', "")
        .replace('&', " & ");
    lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '&' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|word| !GENERIC_NAME_WORDS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `clean_name`, or the lowercased raw name when every word is generic.
pub fn comparable_name(name: &str) -> String {
    let cleaned = clean_name(name);
    if cleaned.is_empty() {
        name.trim().to_lowercase()
    } else {
        cleaned
    }
}

fn significant_words<'a>(text: &'a str, config: &MatchConfig) -> HashSet<&'a str> {
    text.split_whitespace()
        .filter(|w| w.chars().count() > config.ignore_words_up_to)
        .collect()
}

/// Scores two already-cleaned names.
pub fn score_names(target: &str, candidate: &str, config: &MatchConfig) -> f64 {
    if target.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    if target == candidate {
        return config.exact_score;
    }
    if target.contains(candidate) || candidate.contains(target) {
        return config.containment_score;
    }
    let target_words = significant_words(target, config);
    let candidate_words = significant_words(candidate, config);
    let denominator = target_words.len().max(candidate_words.len());
    if denominator == 0 {
        return 0.0;
    }
    target_words.intersection(&candidate_words).count() as f64 / denominator as f64
}

/// Highest-scoring candidate above the threshold; earlier candidates win ties.
pub fn select_best<'a>(
    target: &str,
    candidates: &'a [RawFsaEstablishment],
    config: &MatchConfig,
) -> Option<(&'a RawFsaEstablishment, f64)> {
    let mut best: Option<(&RawFsaEstablishment, f64)> = None;
    for candidate in candidates {
        let score = score_names(target, &comparable_name(&candidate.business_name), config);
        if score >= config.exact_score {
            return Some((candidate, score));
        }
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }
    best.filter(|(_, score)| *score > config.threshold)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchStrategy {
    pub label: &'static str,
    pub address: String,
}

/// Address terms to try, most specific first, ending with a name-only search.
pub fn search_strategies(postcode: Option<&str>, area: Option<&str>) -> Vec<SearchStrategy> {
    let postcode = postcode.map(str::trim).filter(|p| !p.is_empty());
    let candidates = [
        ("postcode", postcode.map(str::to_string)),
        ("postcode_compact", postcode.map(|p| p.replace(' ', ""))),
        (
            "area",
            area.map(str::trim).filter(|a| !a.is_empty()).map(str::to_string),
        ),
    ];

    let mut seen = HashSet::new();
    let mut strategies = Vec::new();
    for (label, address) in candidates {
        let Some(address) = address else { continue };
        if seen.insert(address.to_lowercase()) {
            strategies.push(SearchStrategy { label, address });
        }
    }
    strategies.push(SearchStrategy {
        label: "name_only",
        address: String::new(),
    });
    strategies
}

#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    pub name: &'a str,
    pub postcode: Option<&'a str>,
    pub area: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MatchOutcome {
    pub matched: Option<FsaMatch>,
    pub strategy: Option<&'static str>,
    pub candidates: usize,
    pub failed_strategies: usize,
    pub attempted_strategies: usize,
}

impl MatchOutcome {
    /// Every strategy errored, so "no match" is not a real answer.
    pub fn all_failed(&self) -> bool {
        self.attempted_strategies > 0 && self.failed_strategies == self.attempted_strategies
    }
}

pub struct EntityMatcher<'a> {
    source: &'a dyn HygieneSource,
    config: MatchConfig,
}

impl<'a> EntityMatcher<'a> {
    pub fn new(source: &'a dyn HygieneSource, config: MatchConfig) -> Self {
        Self { source, config }
    }

    pub async fn find_match(&self, ctx: &AdapterContext, query: MatchQuery<'_>) -> Option<FsaMatch> {
        self.lookup(ctx, query).await.matched
    }

    /// Runs the strategies in order and scores the first non-empty candidate
    /// set. A failing strategy counts as zero candidates.
    pub async fn lookup(&self, ctx: &AdapterContext, query: MatchQuery<'_>) -> MatchOutcome {
        let target = comparable_name(query.name);
        let mut outcome = MatchOutcome::default();
        if target.is_empty() {
            return outcome;
        }

        let mut candidates = Vec::new();
        for strategy in search_strategies(query.postcode, query.area) {
            outcome.attempted_strategies += 1;
            match self
                .source
                .search_establishments(ctx, &target, &strategy.address)
                .await
            {
                Ok(found) if found.is_empty() => continue,
                Ok(found) => {
                    outcome.strategy = Some(strategy.label);
                    candidates = found;
                    break;
                }
                Err(err) => {
                    outcome.failed_strategies += 1;
                    warn!(
                        name = query.name,
                        strategy = strategy.label,
                        error = %err,
                        "fsa search failed; trying next strategy"
                    );
                }
            }
        }

        outcome.candidates = candidates.len();
        outcome.matched = select_best(&target, &candidates, &self.config)
            .map(|(establishment, score)| establishment.to_match(score));
        debug!(
            name = query.name,
            strategy = outcome.strategy.unwrap_or("none"),
            candidates = outcome.candidates,
            matched = outcome.matched.is_some(),
            "fsa lookup finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lvd_adapters::AdapterError;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn establishment(fhrsid: u64, name: &str) -> RawFsaEstablishment {
        RawFsaEstablishment {
            fhrsid,
            business_name: name.to_string(),
            rating_value: "5".into(),
            local_authority_name: "Hackney".into(),
            ..Default::default()
        }
    }

    #[test]
    fn cleaning_strips_possessives_and_generic_words() {
        assert_eq!(clean_name("Nando's"), "nando");
        assert_eq!(clean_name("The Dishoom Restaurant Ltd"), "dishoom");
        assert_eq!(clean_name("Fish & Chips  Kitchen"), "fish chips");
        assert_eq!(clean_name("Bar Italia"), "italia");
        assert_eq!(clean_name("The Cafe"), "");
    }

    #[test]
    fn scoring_tiers() {
        let config = MatchConfig::default();
        assert_eq!(score_names("dishoom", "dishoom", &config), 1.0);
        assert_eq!(score_names("dishoom", "dishoom shoreditch", &config), 0.8);
        assert_eq!(score_names("dishoom shoreditch", "dishoom", &config), 0.8);
        // {golden, dragon} vs {golden, dragon, express}: 2/3
        let overlap = score_names("golden dragon soho", "golden dragon express", &config);
        assert!((overlap - 2.0 / 3.0).abs() < 1e-9);
        // short words do not count
        assert_eq!(score_names("la la", "lo la", &config), 0.0);
        assert_eq!(score_names("", "anything", &config), 0.0);
    }

    #[test]
    fn dishoom_beats_nandos() {
        let candidates = vec![
            establishment(1, "Dishoom Shoreditch Ltd"),
            establishment(2, "Nando's"),
        ];
        let config = MatchConfig::default();
        let (best, score) = select_best(&clean_name("Dishoom"), &candidates, &config).unwrap();
        assert_eq!(best.fhrsid, 1);
        assert!(score >= 0.6);
        assert_eq!(
            score_names(&clean_name("Dishoom"), &clean_name("Nando's"), &config),
            0.0
        );
    }

    #[test]
    fn below_threshold_is_no_match_and_ties_keep_first() {
        let config = MatchConfig::default();
        let weak = vec![establishment(1, "Golden Palace Express Takeaway")];
        assert!(select_best("golden dragon", &weak, &config).is_none());

        let tied = vec![
            establishment(1, "Blue Door Cafe Soho"),
            establishment(2, "Blue Door Bar Soho"),
        ];
        let (best, _) = select_best("blue door soho", &tied, &config).unwrap();
        assert_eq!(best.fhrsid, 1);
    }

    #[test]
    fn all_generic_names_compare_on_the_raw_name() {
        let config = MatchConfig::default();
        let candidates = vec![
            establishment(1, "Cafe Nero"),
            establishment(2, "The Cafe"),
        ];
        let target = comparable_name("The Cafe");
        assert_eq!(target, "the cafe");
        let (best, score) = select_best(&target, &candidates, &config).unwrap();
        assert_eq!(best.fhrsid, 2);
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn all_generic_name_matches_through_lookup() {
        let source = ScriptedSource::new(vec![Some(vec![establishment(4, "THE CAFE")])]);
        let matcher = EntityMatcher::new(&source, MatchConfig::default());
        let found = matcher
            .find_match(
                &ctx(),
                MatchQuery {
                    name: "The Cafe",
                    postcode: Some("N1 1AA"),
                    area: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(found.fhrsid, 4);
        assert_eq!(found.match_score, 1.0);
        assert_eq!(source.calls.lock().unwrap()[0].0, "the cafe");
    }

    #[test]
    fn strategies_in_priority_order_without_duplicates() {
        let labels = |s: Vec<SearchStrategy>| s.into_iter().map(|s| s.label).collect::<Vec<_>>();
        assert_eq!(
            labels(search_strategies(Some("E1 6SB"), Some("Shoreditch"))),
            vec!["postcode", "postcode_compact", "area", "name_only"]
        );
        assert_eq!(
            labels(search_strategies(Some("N1"), None)),
            vec!["postcode", "name_only"]
        );
        assert_eq!(labels(search_strategies(None, Some("  "))), vec!["name_only"]);
    }

    /// Answers each call from a script; `None` simulates a failed request.
    struct ScriptedSource {
        responses: Mutex<Vec<Option<Vec<RawFsaEstablishment>>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Option<Vec<RawFsaEstablishment>>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HygieneSource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn search_establishments(
            &self,
            _ctx: &AdapterContext,
            name: &str,
            address: &str,
        ) -> Result<Vec<RawFsaEstablishment>, AdapterError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), address.to_string()));
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.is_empty() {
                Some(Vec::new())
            } else {
                responses.remove(0)
            };
            next.ok_or_else(|| AdapterError::Anyhow(anyhow::anyhow!("timed out")))
        }

        async fn establishment_by_id(
            &self,
            _ctx: &AdapterContext,
            _fhrsid: u64,
        ) -> Result<Option<RawFsaEstablishment>, AdapterError> {
            Ok(None)
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(Uuid::nil())
    }

    #[tokio::test]
    async fn failed_strategy_falls_through_to_next() {
        let source = ScriptedSource::new(vec![
            None,
            Some(vec![]),
            Some(vec![establishment(9, "Dishoom Shoreditch Ltd")]),
        ]);
        let matcher = EntityMatcher::new(&source, MatchConfig::default());
        let outcome = matcher
            .lookup(
                &ctx(),
                MatchQuery {
                    name: "Dishoom",
                    postcode: Some("E2 7JE"),
                    area: Some("Shoreditch"),
                },
            )
            .await;

        assert_eq!(outcome.strategy, Some("area"));
        assert_eq!(outcome.failed_strategies, 1);
        assert!(!outcome.all_failed());
        let matched = outcome.matched.unwrap();
        assert_eq!(matched.fhrsid, 9);
        assert_eq!(matched.match_score, 0.8);

        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("dishoom".to_string(), "E2 7JE".to_string()),
                ("dishoom".to_string(), "E27JE".to_string()),
                ("dishoom".to_string(), "Shoreditch".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn first_non_empty_strategy_is_final() {
        let source = ScriptedSource::new(vec![
            Some(vec![establishment(1, "Somewhere Else Entirely")]),
            Some(vec![establishment(2, "Dishoom")]),
        ]);
        let matcher = EntityMatcher::new(&source, MatchConfig::default());
        let found = matcher
            .find_match(
                &ctx(),
                MatchQuery {
                    name: "Dishoom",
                    postcode: Some("E2 7JE"),
                    area: None,
                },
            )
            .await;
        assert!(found.is_none());
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_strategies_failing_is_reported() {
        let source = ScriptedSource::new(vec![None, None]);
        let matcher = EntityMatcher::new(&source, MatchConfig::default());
        let outcome = matcher
            .lookup(
                &ctx(),
                MatchQuery {
                    name: "Dishoom",
                    postcode: None,
                    area: Some("Soho"),
                },
            )
            .await;
        assert!(outcome.matched.is_none());
        assert!(outcome.all_failed());
    }
}
