//! Sync pipeline orchestration: fetch, normalize, match, merge through the
//! stability layer, report.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use lvd_adapters::{
    normalize_place, AdapterContext, FixtureHygieneSource, FixturePlacesSource, FsaClient,
    GooglePlacesClient, GooglePlacesConfig, HygieneSource, PlacesSource, TextSearchRequest,
    FSA_API_BASE_URL, FSA_SOURCE_ID, GOOGLE_SOURCE_ID,
};
use lvd_core::{CoverageReport, GeoPoint, NormalizedVenue, Venue};
use lvd_storage::{
    BackoffPolicy, FileDatasetBackend, HttpClientConfig, HttpFetcher, MutationOutcome,
    StabilityError, StabilityLayer, DEFAULT_BACKUP_RETENTION,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod matcher;
pub mod merge;

pub use matcher::{EntityMatcher, MatchConfig, MatchOutcome, MatchQuery};
pub use merge::{
    find_duplicate_suspects, merge_batch, DuplicateSuspect, MergeOutcome, SkippedRecord,
    DUPLICATE_SIMILARITY_THRESHOLD,
};

pub const CRATE_NAME: &str = "lvd-sync";

// ---------------------------------------------------------------------------
// Search plan
// ---------------------------------------------------------------------------

fn default_max_pages() -> usize {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub center: Option<GeoPoint>,
    #[serde(default)]
    pub radius_m: Option<u32>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SearchQuery {
    pub fn to_request(&self) -> TextSearchRequest {
        TextSearchRequest {
            query: self.query.clone(),
            location: self.center,
            radius_m: self.radius_m,
            max_pages: self.max_pages.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPlan {
    /// Also call Place Details for every new place (website, phone, hours).
    #[serde(default)]
    pub fetch_details: bool,
    pub queries: Vec<SearchQuery>,
}

impl SearchPlan {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let plan: SearchPlan = serde_yaml::from_str(text).context("parsing search plan")?;
        if plan.enabled_queries().next().is_none() {
            bail!("search plan has no enabled queries");
        }
        Ok(plan)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled_queries(&self) -> impl Iterator<Item = &SearchQuery> {
        self.queries.iter().filter(|q| q.enabled)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub dataset_path: PathBuf,
    pub backups_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub search_plan_path: PathBuf,
    /// Offline mode: serve both sources from captured responses.
    pub fixtures_dir: Option<PathBuf>,
    pub google_api_key: Option<String>,
    pub fsa_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub google_min_interval_ms: u64,
    pub fsa_min_interval_ms: u64,
    pub max_retries: usize,
    pub backup_retention: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

impl SyncConfig {
    /// Paths default to locations under `workspace_root`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let root = workspace_root.into();
        Self {
            dataset_path: root.join("data").join("venues.json"),
            backups_dir: root.join("data").join("backups"),
            reports_dir: root.join("reports"),
            search_plan_path: root.join("search_plan.yaml"),
            workspace_root: root,
            fixtures_dir: None,
            google_api_key: None,
            fsa_base_url: FSA_API_BASE_URL.to_string(),
            user_agent: "lvd-bot/0.1".to_string(),
            http_timeout_secs: 10,
            google_min_interval_ms: 150,
            fsa_min_interval_ms: 300,
            max_retries: 3,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            scheduler_enabled: false,
            sync_cron: "0 5 * * *".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let root = env_path("LVD_WORKSPACE_ROOT", PathBuf::from("."));
        let defaults = Self::for_workspace(root);
        Self {
            dataset_path: env_path("LVD_DATASET_PATH", defaults.dataset_path.clone()),
            backups_dir: env_path("LVD_BACKUPS_DIR", defaults.backups_dir.clone()),
            reports_dir: env_path("LVD_REPORTS_DIR", defaults.reports_dir.clone()),
            google_api_key: std::env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            fsa_base_url: std::env::var("LVD_FSA_BASE_URL")
                .unwrap_or_else(|_| defaults.fsa_base_url.clone()),
            user_agent: std::env::var("LVD_USER_AGENT")
                .unwrap_or_else(|_| defaults.user_agent.clone()),
            http_timeout_secs: env_parse("LVD_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            google_min_interval_ms: env_parse(
                "LVD_GOOGLE_MIN_INTERVAL_MS",
                defaults.google_min_interval_ms,
            ),
            fsa_min_interval_ms: env_parse("LVD_FSA_MIN_INTERVAL_MS", defaults.fsa_min_interval_ms),
            max_retries: env_parse("LVD_MAX_RETRIES", defaults.max_retries),
            backup_retention: env_parse("LVD_BACKUP_RETENTION", defaults.backup_retention),
            scheduler_enabled: std::env::var("LVD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LVD_SYNC_CRON").unwrap_or_else(|_| defaults.sync_cron.clone()),
            ..defaults
        }
    }

    pub fn with_fixtures(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fixtures_dir = Some(dir.into());
        self
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
        .with_source_interval(
            GOOGLE_SOURCE_ID,
            Duration::from_millis(self.google_min_interval_ms),
        )
        .with_source_interval(FSA_SOURCE_ID, Duration::from_millis(self.fsa_min_interval_ms))
    }

    pub fn stability_layer(&self) -> StabilityLayer<FileDatasetBackend> {
        StabilityLayer::new(FileDatasetBackend::new(
            self.dataset_path.clone(),
            self.backups_dir.clone(),
        ))
        .with_retention(self.backup_retention)
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Sync,
    EnrichFsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FsaCounts {
    pub attempted: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub failed: usize,
    /// Venues that already had a match and were left alone.
    pub kept: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_run: usize,
    pub queries_failed: Vec<String>,
    pub places_fetched: usize,
    pub closed_skipped: usize,
    pub details_failed: usize,
    pub records_attempted: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    pub fsa: FsaCounts,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<SkippedRecord>,
    pub renamed_slugs: Vec<merge::SlugRename>,
    pub coverage_before: Option<CoverageReport>,
    pub coverage_after: Option<CoverageReport>,
    pub duplicate_suspects: Vec<DuplicateSuspect>,
    pub backup: Option<String>,
    pub pruned_backups: Vec<String>,
    pub sha256_before: Option<String>,
    pub sha256_after: Option<String>,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    fn start(kind: RunKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            kind,
            status: RunStatus::Succeeded,
            error: None,
            started_at: now,
            finished_at: now,
            queries_run: 0,
            queries_failed: Vec::new(),
            places_fetched: 0,
            closed_skipped: 0,
            details_failed: 0,
            records_attempted: 0,
            records_succeeded: 0,
            records_failed: 0,
            fsa: FsaCounts::default(),
            added: Vec::new(),
            updated: Vec::new(),
            skipped: Vec::new(),
            renamed_slugs: Vec::new(),
            coverage_before: None,
            coverage_after: None,
            duplicate_suspects: Vec::new(),
            backup: None,
            pruned_backups: Vec::new(),
            sha256_before: None,
            sha256_after: None,
            reports_dir: None,
        }
    }

    fn absorb_merge(&mut self, merged: &MergeOutcome) {
        self.added = merged.added.clone();
        self.updated = merged.updated.clone();
        self.skipped = merged.skipped.clone();
        self.renamed_slugs = merged.renamed_slugs.clone();
        self.records_succeeded = merged.added.len() + merged.updated.len();
        self.records_failed = merged.skipped.len();
    }

    fn absorb_commit(&mut self, committed: &MutationOutcome) {
        self.backup = committed.backup.as_ref().map(|b| b.id.clone());
        self.pruned_backups = committed.pruned_backups.clone();
        self.sha256_before = committed.sha256_before.clone();
        self.sha256_after = Some(committed.sha256_after.clone());
        self.coverage_after = Some(committed.dataset.coverage.report());
        self.duplicate_suspects =
            find_duplicate_suspects(&committed.dataset.venues, DUPLICATE_SIMILARITY_THRESHOLD);
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    config: SyncConfig,
    places: Arc<dyn PlacesSource>,
    hygiene: Arc<dyn HygieneSource>,
    stability: StabilityLayer<FileDatasetBackend>,
    match_config: MatchConfig,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    /// Live sources need `GOOGLE_PLACES_API_KEY`; fixture mode needs nothing.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let (places, hygiene): (Arc<dyn PlacesSource>, Arc<dyn HygieneSource>) =
            match &config.fixtures_dir {
                Some(dir) => (
                    Arc::new(FixturePlacesSource::load(dir)?),
                    Arc::new(FixtureHygieneSource::load(dir)?),
                ),
                None => {
                    let api_key = config.google_api_key.clone().context(
                        "GOOGLE_PLACES_API_KEY is not set (use --fixtures for an offline run)",
                    )?;
                    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
                    let mut google = GooglePlacesConfig::new(api_key);
                    google.quota_backoff.max_retries = config.max_retries;
                    (
                        Arc::new(GooglePlacesClient::new(http.clone(), google)),
                        Arc::new(FsaClient::new(http, config.fsa_base_url.clone())),
                    )
                }
            };
        Ok(Self::with_sources(config, places, hygiene))
    }

    pub fn with_sources(
        config: SyncConfig,
        places: Arc<dyn PlacesSource>,
        hygiene: Arc<dyn HygieneSource>,
    ) -> Self {
        let stability = config.stability_layer();
        Self {
            config,
            places,
            hygiene,
            stability,
            match_config: MatchConfig::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stability(&self) -> &StabilityLayer<FileDatasetBackend> {
        &self.stability
    }

    /// One full sync. Waits for any run already in progress.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.sync_locked().await
    }

    /// Like `run_once`, but returns `None` instead of waiting when busy.
    pub async fn try_run_once(&self) -> Result<Option<SyncRunSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Ok(None);
        };
        self.sync_locked().await.map(Some)
    }

    /// Re-matches existing venues against FSA without any Google call.
    /// With `refresh`, venues that already have a match are looked up again.
    pub async fn enrich_fsa(&self, refresh: bool) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let mut summary = SyncRunSummary::start(RunKind::EnrichFsa);
        let span = info_span!("enrich_fsa", run_id = %summary.run_id, refresh);

        let result: Result<()> = async {
            let existing = self
                .stability
                .load()
                .await?
                .ok_or_else(|| {
                    StabilityError::MissingDataset(
                        self.config.dataset_path.display().to_string(),
                    )
                })?;
            summary.coverage_before = Some(existing.coverage.report());

            let ctx = AdapterContext::new(summary.run_id);
            let updates = self
                .fsa_updates(&ctx, &existing.venues, refresh, &mut summary)
                .await;
            summary.records_attempted = updates.len();

            self.commit(&mut summary, "enrich-fsa", true, updates, ctx.fetched_at)
                .await
        }
        .instrument(span)
        .await;

        self.finish(summary, result).await
    }

    async fn sync_locked(&self) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::start(RunKind::Sync);
        let span = info_span!("sync", run_id = %summary.run_id);

        let result: Result<()> = async {
            let plan = SearchPlan::load(&self.config.search_plan_path).await?;
            let existing = self.stability.load().await?;
            summary.coverage_before = existing.as_ref().map(|d| d.coverage.report());
            let known: HashMap<&str, &Venue> = existing
                .as_ref()
                .map(|d| d.venues.iter().map(|v| (v.place_id.as_str(), v)).collect())
                .unwrap_or_default();

            let ctx = AdapterContext::new(summary.run_id);
            let mut batch = self.fetch_places(&ctx, &plan, &known, &mut summary).await;
            self.match_batch(&ctx, &mut batch, &known, &mut summary).await;
            summary.records_attempted = batch.len();

            self.commit(&mut summary, "sync", false, batch, ctx.fetched_at)
                .await
        }
        .instrument(span)
        .await;

        self.finish(summary, result).await
    }

    async fn fetch_places(
        &self,
        ctx: &AdapterContext,
        plan: &SearchPlan,
        known: &HashMap<&str, &Venue>,
        summary: &mut SyncRunSummary,
    ) -> Vec<NormalizedVenue> {
        let mut seen = HashSet::new();
        let mut batch = Vec::new();

        for query in plan.enabled_queries() {
            summary.queries_run += 1;
            let places = match self.places.text_search(ctx, &query.to_request()).await {
                Ok(places) => places,
                Err(err) => {
                    warn!(query = %query.query, error = %err, "text search failed; continuing");
                    summary.queries_failed.push(query.query.clone());
                    continue;
                }
            };
            info!(query = %query.query, results = places.len(), "text search finished");

            for raw in places {
                summary.places_fetched += 1;
                if raw.place_id.trim().is_empty() || !seen.insert(raw.place_id.clone()) {
                    continue;
                }
                if raw.is_permanently_closed() {
                    info!(place_id = %raw.place_id, "permanently closed; skipping");
                    summary.closed_skipped += 1;
                    continue;
                }

                let raw = if plan.fetch_details && !known.contains_key(raw.place_id.as_str()) {
                    match self.places.place_details(ctx, &raw.place_id).await {
                        Ok(Some(details)) => raw.with_details(details),
                        Ok(None) => raw,
                        Err(err) => {
                            warn!(place_id = %raw.place_id, error = %err, "place details failed; using search result");
                            summary.details_failed += 1;
                            raw
                        }
                    }
                } else {
                    raw
                };
                batch.push(normalize_place(&raw, query.area.as_deref(), ctx.fetched_at));
            }
        }
        batch
    }

    async fn match_batch(
        &self,
        ctx: &AdapterContext,
        batch: &mut [NormalizedVenue],
        known: &HashMap<&str, &Venue>,
        summary: &mut SyncRunSummary,
    ) {
        let matcher = EntityMatcher::new(self.hygiene.as_ref(), self.match_config);
        for record in batch.iter_mut() {
            if known
                .get(record.place_id.as_str())
                .is_some_and(|v| v.has_fsa_match())
            {
                summary.fsa.kept += 1;
                continue;
            }
            let Some(name) = record.name.clone() else {
                continue;
            };
            let area = record.area.clone().or_else(|| record.borough.clone());
            let outcome = matcher
                .lookup(
                    ctx,
                    MatchQuery {
                        name: &name,
                        postcode: record.postcode.as_deref(),
                        area: area.as_deref(),
                    },
                )
                .await;
            summary.fsa.record(&outcome);
            info!(
                place_id = %record.place_id,
                name = %name,
                fhrsid = ?outcome.matched.as_ref().map(|m| m.fhrsid),
                "fsa match"
            );
            if let Some(found) = outcome.matched {
                record.fsa = Some(found);
                record.verified_fsa_at = Some(ctx.fetched_at);
            }
        }
    }

    async fn fsa_updates(
        &self,
        ctx: &AdapterContext,
        venues: &[Venue],
        refresh: bool,
        summary: &mut SyncRunSummary,
    ) -> Vec<NormalizedVenue> {
        let matcher = EntityMatcher::new(self.hygiene.as_ref(), self.match_config);
        let mut updates = Vec::new();

        for venue in venues {
            if venue.has_fsa_match() && !refresh {
                summary.fsa.kept += 1;
                continue;
            }

            let found = match venue.fsa_fhrsid {
                Some(fhrsid) => {
                    summary.fsa.attempted += 1;
                    match self.hygiene.establishment_by_id(ctx, fhrsid).await {
                        Ok(Some(establishment)) => {
                            summary.fsa.matched += 1;
                            Some(establishment.to_match(venue.fsa_match_score.unwrap_or(1.0)))
                        }
                        Ok(None) => {
                            warn!(place_id = %venue.place_id, fhrsid, "establishment no longer listed; keeping stored rating");
                            summary.fsa.unmatched += 1;
                            None
                        }
                        Err(err) => {
                            warn!(place_id = %venue.place_id, fhrsid, error = %err, "establishment lookup failed");
                            summary.fsa.failed += 1;
                            None
                        }
                    }
                }
                None => {
                    let area = venue.area.as_deref().or(venue.borough.as_deref());
                    let outcome = matcher
                        .lookup(
                            ctx,
                            MatchQuery {
                                name: &venue.name,
                                postcode: venue.postcode.as_deref(),
                                area,
                            },
                        )
                        .await;
                    summary.fsa.record(&outcome);
                    outcome.matched
                }
            };

            info!(
                place_id = %venue.place_id,
                name = %venue.name,
                matched = found.is_some(),
                "fsa enrichment"
            );
            if let Some(found) = found {
                updates.push(NormalizedVenue::fsa_update(
                    venue.place_id.clone(),
                    found,
                    ctx.fetched_at,
                ));
            }
        }
        updates
    }

    async fn commit(
        &self,
        summary: &mut SyncRunSummary,
        op_name: &str,
        require_existing: bool,
        batch: Vec<NormalizedVenue>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut merged_stats = None;
        let committed = self
            .stability
            .mutate(op_name, require_existing, |current| {
                let existing = current.map(|d| d.venues).unwrap_or_default();
                let merged = merge_batch(existing, batch, now);
                let dataset = merged.dataset.clone();
                merged_stats = Some(merged);
                Ok(dataset)
            })
            .await?;

        if let Some(merged) = &merged_stats {
            summary.absorb_merge(merged);
        }
        summary.absorb_commit(&committed);
        info!(
            op = op_name,
            added = summary.added.len(),
            updated = summary.updated.len(),
            skipped = summary.skipped.len(),
            total = committed.dataset.total_venues,
            "dataset committed"
        );
        Ok(())
    }

    /// Stamps the outcome, writes the run report, and turns a failed run back
    /// into an error once its report is on disk.
    async fn finish(
        &self,
        mut summary: SyncRunSummary,
        result: Result<()>,
    ) -> Result<SyncRunSummary> {
        summary.finished_at = Utc::now();
        if let Err(err) = &result {
            let message = format!("{err:#}");
            error!(run_id = %summary.run_id, error = %message, "run failed");
            summary.status = RunStatus::Failed;
            summary.error = Some(message);
        }

        match write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(run_id = %summary.run_id, error = %message, "could not write run report");
            }
        }

        result.map(|()| summary)
    }
}

impl FsaCounts {
    fn record(&mut self, outcome: &MatchOutcome) {
        self.attempted += 1;
        if outcome.matched.is_some() {
            self.matched += 1;
        } else if outcome.all_failed() {
            self.failed += 1;
        } else {
            self.unmatched += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

fn coverage_line(report: Option<&CoverageReport>, field: &str) -> String {
    report
        .and_then(|r| r.field(field))
        .map(|f| format!("{:.1}% ({})", f.percent, f.count))
        .unwrap_or_else(|| "-".to_string())
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# London Venue Directory Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Kind: {:?}", summary.kind),
        format!("- Status: {:?}", summary.status),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Records: {} attempted, {} succeeded, {} failed",
            summary.records_attempted, summary.records_succeeded, summary.records_failed
        ),
        format!(
            "- Added: {}, updated: {}",
            summary.added.len(),
            summary.updated.len()
        ),
        format!(
            "- FSA: {} attempted, {} matched, {} unmatched, {} failed, {} kept",
            summary.fsa.attempted,
            summary.fsa.matched,
            summary.fsa.unmatched,
            summary.fsa.failed,
            summary.fsa.kept
        ),
    ];
    if let Some(err) = &summary.error {
        lines.push(format!("- Error: {err}"));
    }
    if !summary.queries_failed.is_empty() {
        lines.push(format!("- Failed queries: {}", summary.queries_failed.join(", ")));
    }
    if let Some(backup) = &summary.backup {
        lines.push(format!("- Backup: `{backup}`"));
    }

    lines.push(String::new());
    lines.push("## Coverage".to_string());
    lines.push(String::new());
    lines.push("| field | before | after |".to_string());
    lines.push("|---|---|---|".to_string());
    let fields = summary
        .coverage_after
        .as_ref()
        .or(summary.coverage_before.as_ref())
        .map(|r| r.fields.iter().map(|f| f.field.clone()).collect::<Vec<_>>())
        .unwrap_or_default();
    for field in fields {
        lines.push(format!(
            "| {field} | {} | {} |",
            coverage_line(summary.coverage_before.as_ref(), &field),
            coverage_line(summary.coverage_after.as_ref(), &field)
        ));
    }

    if !summary.duplicate_suspects.is_empty() {
        lines.push(String::new());
        lines.push("## Duplicate suspects".to_string());
        lines.push(String::new());
        for suspect in &summary.duplicate_suspects {
            lines.push(format!(
                "- {} / {} ({}, {:.2}) `{}` `{}`",
                suspect.name_a,
                suspect.name_b,
                suspect.postcode,
                suspect.similarity,
                suspect.place_id_a,
                suspect.place_id_b
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `summary.json` and `brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

/// Markdown digest of the most recent `runs` reports, newest first.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry?;
        let path = entry.path().join("summary.json");
        if !path.is_file() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((path, value));
    }
    summaries.sort_by(|a, b| {
        let started = |v: &serde_json::Value| v["started_at"].as_str().unwrap_or_default().to_string();
        started(&b.1).cmp(&started(&a.1))
    });

    let mut lines = vec!["# London Venue Directory Recent Runs".to_string(), String::new()];
    for (path, value) in summaries.into_iter().take(runs.max(1)) {
        let count = |key: &str| value[key].as_array().map(Vec::len).unwrap_or(0);
        lines.push(format!("## Run `{}`", value["run_id"].as_str().unwrap_or("unknown")));
        lines.push(format!(
            "- {} / {} at {}",
            value["kind"].as_str().unwrap_or("?"),
            value["status"].as_str().unwrap_or("?"),
            value["started_at"].as_str().unwrap_or("?")
        ));
        lines.push(format!(
            "- added {}, updated {}, skipped {}, duplicate suspects {}",
            count("added"),
            count("updated"),
            count("skipped"),
            count("duplicate_suspects")
        ));
        if let Some(err) = value["error"].as_str() {
            lines.push(format!("- error: {err}"));
        }
        lines.push(format!("- summary: `{}`", path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cron-driven syncs. Ticks that land during a run are skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.try_run_once().await {
                Ok(Some(summary)) => info!(
                    run_id = %summary.run_id,
                    added = summary.added.len(),
                    updated = summary.updated.len(),
                    "scheduled sync finished"
                ),
                Ok(None) => warn!("previous sync still running; skipping this tick"),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled sync failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Runs the scheduler until Ctrl-C.
pub async fn run_scheduler(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let Some(mut sched) = build_scheduler(pipeline).await? else {
        bail!("scheduler is disabled (set LVD_SCHEDULER_ENABLED=true)");
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler started; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
