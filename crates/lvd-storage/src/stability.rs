//! Stability layer: every write of the canonical dataset goes through
//! snapshot → execute → validate → commit-or-restore.
//!
//! The protocol is written against [`DatasetBackend`] so the same logic works
//! for the on-disk `venues.json` and for in-memory stores in tests.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lvd_core::validate::{validate_dataset_bytes, ValidationIssue, ValidationReport};
use lvd_core::VenueDataset;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::sha256_hex;

pub const DEFAULT_BACKUP_RETENTION: usize = 10;

const PRE_RESTORE_SUFFIX: &str = "_pre-restore";

/// Why a backup was taken. A pre-restore backup holds the state a restore
/// rolled away from; `restore_latest` never picks one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Mutation,
    PreRestore,
}

impl BackupKind {
    /// The kind is carried in the backup id itself.
    pub fn of_id(id: &str) -> Self {
        let stem = id.strip_suffix(".json").unwrap_or(id);
        if stem.ends_with(PRE_RESTORE_SUFFIX) {
            Self::PreRestore
        } else {
            Self::Mutation
        }
    }

    fn id_suffix(self) -> &'static str {
        match self {
            Self::Mutation => "",
            Self::PreRestore => PRE_RESTORE_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub id: String,
    pub kind: BackupKind,
    pub path: Option<PathBuf>,
    pub byte_size: usize,
}

/// Storage for the current dataset document plus its timestamped backups.
#[async_trait]
pub trait DatasetBackend: Send + Sync {
    fn describe(&self) -> String;

    async fn read_current(&self) -> anyhow::Result<Option<Vec<u8>>>;

    async fn write_current(&self, bytes: &[u8]) -> anyhow::Result<()>;

    async fn remove_current(&self) -> anyhow::Result<()>;

    async fn create_backup(
        &self,
        bytes: &[u8],
        taken_at: DateTime<Utc>,
        kind: BackupKind,
    ) -> anyhow::Result<BackupInfo>;

    async fn read_backup(&self, id: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Oldest first.
    async fn list_backups(&self) -> anyhow::Result<Vec<BackupInfo>>;

    async fn delete_backup(&self, id: &str) -> anyhow::Result<()>;
}

/// `venues.json` on disk with sibling backups named
/// `<stem>_<YYYYMMDD_HHMMSS_mmm>_<seq>[_pre-restore].json`, so lexical order
/// is age order. A sequence number is used by at most one kind.
#[derive(Debug, Clone)]
pub struct FileDatasetBackend {
    dataset_path: PathBuf,
    backups_dir: PathBuf,
}

impl FileDatasetBackend {
    pub fn new(dataset_path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    fn backup_prefix(&self) -> String {
        let stem = self
            .dataset_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string());
        format!("{stem}_")
    }

    fn backup_info(&self, id: &str, byte_size: usize) -> BackupInfo {
        BackupInfo {
            id: id.to_string(),
            kind: BackupKind::of_id(id),
            path: Some(self.backups_dir.join(id)),
            byte_size,
        }
    }
}

#[async_trait]
impl DatasetBackend for FileDatasetBackend {
    fn describe(&self) -> String {
        self.dataset_path.display().to_string()
    }

    async fn read_current(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match fs::read(&self.dataset_path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading {}", self.dataset_path.display()))
            }
        }
    }

    /// Temp file in the same directory, then rename over the real path.
    async fn write_current(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = self
            .dataset_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating dataset directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp dataset file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp dataset file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp dataset file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.dataset_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.dataset_path.display()
                )
            });
        }
        Ok(())
    }

    async fn remove_current(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.dataset_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing {}", self.dataset_path.display()))
            }
        }
    }

    async fn create_backup(
        &self,
        bytes: &[u8],
        taken_at: DateTime<Utc>,
        kind: BackupKind,
    ) -> anyhow::Result<BackupInfo> {
        fs::create_dir_all(&self.backups_dir)
            .await
            .with_context(|| format!("creating backups directory {}", self.backups_dir.display()))?;

        let stamp = taken_at.format("%Y%m%d_%H%M%S_%3f").to_string();
        for seq in 0..1000u32 {
            let base = format!("{}{stamp}_{seq:03}", self.backup_prefix());
            let other = match kind {
                BackupKind::Mutation => BackupKind::PreRestore,
                BackupKind::PreRestore => BackupKind::Mutation,
            };
            let sibling = self
                .backups_dir
                .join(format!("{base}{}.json", other.id_suffix()));
            if fs::try_exists(&sibling).await.unwrap_or(false) {
                continue;
            }
            let id = format!("{base}{}.json", kind.id_suffix());
            let path = self.backups_dir.join(&id);
            let opened = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .await;
            let mut file = match opened {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("creating backup {}", path.display()))
                }
            };
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing backup {}", path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing backup {}", path.display()))?;
            return Ok(self.backup_info(&id, bytes.len()));
        }
        Err(anyhow!("too many backups taken at {stamp}"))
    }

    async fn read_backup(&self, id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.backups_dir.join(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading backup {}", path.display())),
        }
    }

    async fn list_backups(&self) -> anyhow::Result<Vec<BackupInfo>> {
        let mut entries = match fs::read_dir(&self.backups_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing {}", self.backups_dir.display()))
            }
        };

        let prefix = self.backup_prefix();
        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.backups_dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let byte_size = entry.metadata().await.map(|m| m.len() as usize).unwrap_or(0);
            backups.push(self.backup_info(&name, byte_size));
        }
        backups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backups)
    }

    async fn delete_backup(&self, id: &str) -> anyhow::Result<()> {
        let path = self.backups_dir.join(id);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting backup {}", path.display()))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<Vec<u8>>,
    backups: Vec<(String, Vec<u8>)>,
    sequence: u64,
}

/// Backend kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDatasetBackend {
    state: Mutex<MemoryState>,
}

impl MemoryDatasetBackend {
    pub fn new(initial: Option<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                current: initial,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl DatasetBackend for MemoryDatasetBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn read_current(&self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().await.current.clone())
    }

    async fn write_current(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.state.lock().await.current = Some(bytes.to_vec());
        Ok(())
    }

    async fn remove_current(&self) -> anyhow::Result<()> {
        self.state.lock().await.current = None;
        Ok(())
    }

    async fn create_backup(
        &self,
        bytes: &[u8],
        taken_at: DateTime<Utc>,
        kind: BackupKind,
    ) -> anyhow::Result<BackupInfo> {
        let mut state = self.state.lock().await;
        state.sequence += 1;
        let id = format!(
            "memory_{}_{:06}{}",
            taken_at.format("%Y%m%d_%H%M%S_%3f"),
            state.sequence,
            kind.id_suffix()
        );
        state.backups.push((id.clone(), bytes.to_vec()));
        Ok(BackupInfo {
            id,
            kind,
            path: None,
            byte_size: bytes.len(),
        })
    }

    async fn read_backup(&self, id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state
            .backups
            .iter()
            .find(|(backup_id, _)| backup_id == id)
            .map(|(_, bytes)| bytes.clone()))
    }

    async fn list_backups(&self) -> anyhow::Result<Vec<BackupInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .backups
            .iter()
            .map(|(id, bytes)| BackupInfo {
                id: id.clone(),
                kind: BackupKind::of_id(id),
                path: None,
                byte_size: bytes.len(),
            })
            .collect())
    }

    async fn delete_backup(&self, id: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .backups
            .retain(|(backup_id, _)| backup_id != id);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StabilityError {
    #[error("dataset not found at {0}; run a sync first")]
    MissingDataset(String),
    #[error("operation `{op}` failed before the store was touched: {source:#}")]
    Operation {
        op: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "post-validation of `{op}` failed, store restored from {}: {}",
        .restored_from.as_deref().unwrap_or("<no previous dataset>"),
        join_issues(.issues)
    )]
    PostValidation {
        op: String,
        issues: Vec<ValidationIssue>,
        restored_from: Option<String>,
    },
    #[error("backup {0} not found")]
    BackupNotFound(String),
    #[error("backup {id} is not a valid dataset: {summary}")]
    InvalidBackup { id: String, summary: String },
    #[error("restoring after failed `{op}` did not complete: {source:#}")]
    RollbackFailed {
        op: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("storage backend error: {0:#}")]
    Backend(#[source] anyhow::Error),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// What a committed mutation did to the store.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub op: String,
    pub backup: Option<BackupInfo>,
    pub pre_validation: Option<ValidationReport>,
    pub post_validation: ValidationReport,
    pub sha256_before: Option<String>,
    pub sha256_after: String,
    pub pruned_backups: Vec<String>,
    pub dataset: VenueDataset,
}

/// The only writer of the canonical dataset.
#[derive(Debug)]
pub struct StabilityLayer<B> {
    backend: B,
    retention: usize,
}

impl<B: DatasetBackend> StabilityLayer<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            retention: DEFAULT_BACKUP_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Loads the current dataset without mutating anything.
    pub async fn load(&self) -> Result<Option<VenueDataset>, StabilityError> {
        let Some(bytes) = self.backend.read_current().await.map_err(StabilityError::Backend)?
        else {
            return Ok(None);
        };
        VenueDataset::from_json_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", self.backend.describe()))
            .map_err(StabilityError::Backend)
    }

    pub async fn validate_current(&self) -> Result<Option<ValidationReport>, StabilityError> {
        let current = self.backend.read_current().await.map_err(StabilityError::Backend)?;
        Ok(current.as_deref().map(validate_dataset_bytes))
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>, StabilityError> {
        self.backend.list_backups().await.map_err(StabilityError::Backend)
    }

    /// Applies `op` to the current dataset under the backup/validate/restore
    /// protocol. `op` runs in memory; the store is only written once it returns.
    pub async fn mutate<F>(
        &self,
        op_name: &str,
        require_existing: bool,
        op: F,
    ) -> Result<MutationOutcome, StabilityError>
    where
        F: FnOnce(Option<VenueDataset>) -> anyhow::Result<VenueDataset>,
    {
        let current = self.backend.read_current().await.map_err(StabilityError::Backend)?;
        if current.is_none() && require_existing {
            return Err(StabilityError::MissingDataset(self.backend.describe()));
        }

        let (pre_validation, backup) = self
            .snapshot(op_name, current.as_deref(), BackupKind::Mutation)
            .await?;

        let parsed = match current.as_deref() {
            Some(bytes) => Some(VenueDataset::from_json_slice(bytes).map_err(|err| {
                StabilityError::Operation {
                    op: op_name.to_string(),
                    source: anyhow!(err).context("current dataset cannot be parsed"),
                }
            })?),
            None => None,
        };

        let next = op(parsed).map_err(|source| StabilityError::Operation {
            op: op_name.to_string(),
            source,
        })?;
        let bytes = next.to_json_vec().map_err(|err| StabilityError::Operation {
            op: op_name.to_string(),
            source: anyhow!(err).context("serializing dataset"),
        })?;

        self.commit(op_name, current.as_deref(), pre_validation, backup, bytes)
            .await
    }

    /// Puts a backup back in place, itself under the same protocol.
    pub async fn restore(&self, backup_id: &str) -> Result<MutationOutcome, StabilityError> {
        let op_name = format!("restore {backup_id}");
        let bytes = self
            .backend
            .read_backup(backup_id)
            .await
            .map_err(StabilityError::Backend)?
            .ok_or_else(|| StabilityError::BackupNotFound(backup_id.to_string()))?;
        let report = validate_dataset_bytes(&bytes);
        if !report.is_valid() {
            return Err(StabilityError::InvalidBackup {
                id: backup_id.to_string(),
                summary: report.summary(),
            });
        }

        let current = self.backend.read_current().await.map_err(StabilityError::Backend)?;
        let (pre_validation, backup) = self
            .snapshot(&op_name, current.as_deref(), BackupKind::PreRestore)
            .await?;
        self.commit(&op_name, current.as_deref(), pre_validation, backup, bytes)
            .await
    }

    /// Steps back one state. When the current dataset is itself a restored
    /// mutation backup, the backup before it is restored; otherwise the newest
    /// one. Pre-restore backups are never picked.
    pub async fn restore_latest(&self) -> Result<MutationOutcome, StabilityError> {
        let current = self.backend.read_current().await.map_err(StabilityError::Backend)?;
        let mut history = self.list_backups().await?;
        history.retain(|b| b.kind == BackupKind::Mutation);

        let mut end = history.len();
        if let Some(current) = current.as_deref() {
            for (index, backup) in history.iter().enumerate().rev() {
                let bytes = self
                    .backend
                    .read_backup(&backup.id)
                    .await
                    .map_err(StabilityError::Backend)?;
                if bytes.as_deref() == Some(current) {
                    end = index;
                    break;
                }
            }
        }

        let target = end
            .checked_sub(1)
            .and_then(|index| history.get(index))
            .ok_or_else(|| StabilityError::BackupNotFound("<latest>".to_string()))?;
        self.restore(&target.id).await
    }

    async fn snapshot(
        &self,
        op_name: &str,
        current: Option<&[u8]>,
        kind: BackupKind,
    ) -> Result<(Option<ValidationReport>, Option<BackupInfo>), StabilityError> {
        let Some(bytes) = current else {
            info!(op = op_name, "no existing dataset; skipping backup");
            return Ok((None, None));
        };

        let report = validate_dataset_bytes(bytes);
        if !report.is_valid() {
            warn!(op = op_name, issues = %report.summary(), "pre-validation failed; continuing behind backup");
        }

        let backup = self
            .backend
            .create_backup(bytes, Utc::now(), kind)
            .await
            .map_err(StabilityError::Backend)?;
        info!(op = op_name, backup = %backup.id, "dataset backed up");
        Ok((Some(report), Some(backup)))
    }

    async fn commit(
        &self,
        op_name: &str,
        previous: Option<&[u8]>,
        pre_validation: Option<ValidationReport>,
        backup: Option<BackupInfo>,
        bytes: Vec<u8>,
    ) -> Result<MutationOutcome, StabilityError> {
        if let Err(err) = self.backend.write_current(&bytes).await {
            self.roll_back(op_name, backup.as_ref()).await?;
            return Err(StabilityError::Backend(err));
        }

        let written = match self.backend.read_current().await {
            Ok(written) => written,
            Err(err) => {
                self.roll_back(op_name, backup.as_ref()).await?;
                return Err(StabilityError::Backend(err));
            }
        };
        let post_validation = match written.as_deref() {
            Some(written) => validate_dataset_bytes(written),
            None => ValidationReport {
                venue_count: 0,
                issues: vec![ValidationIssue::InvalidJson {
                    message: "dataset missing after write".to_string(),
                }],
            },
        };

        if !post_validation.is_valid() {
            warn!(op = op_name, issues = %post_validation.summary(), "post-validation failed; restoring");
            self.roll_back(op_name, backup.as_ref()).await?;
            return Err(StabilityError::PostValidation {
                op: op_name.to_string(),
                issues: post_validation.issues,
                restored_from: backup.map(|b| b.id),
            });
        }

        let dataset = VenueDataset::from_json_slice(&bytes).map_err(|err| {
            StabilityError::Backend(anyhow!(err).context("re-reading committed dataset"))
        })?;
        let pruned_backups = self.prune().await?;
        info!(
            op = op_name,
            venues = dataset.total_venues,
            pruned = pruned_backups.len(),
            "dataset committed"
        );

        Ok(MutationOutcome {
            op: op_name.to_string(),
            backup,
            pre_validation,
            post_validation,
            sha256_before: previous.map(sha256_hex),
            sha256_after: sha256_hex(&bytes),
            pruned_backups,
            dataset,
        })
    }

    async fn roll_back(
        &self,
        op_name: &str,
        backup: Option<&BackupInfo>,
    ) -> Result<(), StabilityError> {
        let result = match backup {
            Some(backup) => match self.backend.read_backup(&backup.id).await {
                Ok(Some(bytes)) => self.backend.write_current(&bytes).await,
                Ok(None) => Err(anyhow!("backup {} disappeared", backup.id)),
                Err(err) => Err(err),
            },
            None => self.backend.remove_current().await,
        };
        result.map_err(|source| StabilityError::RollbackFailed {
            op: op_name.to_string(),
            source,
        })?;
        warn!(
            op = op_name,
            restored_from = backup.map(|b| b.id.as_str()).unwrap_or("<none>"),
            "store rolled back"
        );
        Ok(())
    }

    /// Deletes the oldest backups beyond the retention count.
    async fn prune(&self) -> Result<Vec<String>, StabilityError> {
        let backups = self.list_backups().await?;
        let excess = backups.len().saturating_sub(self.retention);
        let mut pruned = Vec::with_capacity(excess);
        for backup in backups.into_iter().take(excess) {
            self.backend
                .delete_backup(&backup.id)
                .await
                .map_err(StabilityError::Backend)?;
            pruned.push(backup.id);
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lvd_core::Venue;
    use serde_json::json;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn venue(place_id: &str) -> Venue {
        serde_json::from_value(json!({
            "place_id": place_id,
            "slug": format!("venue-{place_id}"),
            "name": format!("Venue {place_id}"),
            "createdAt": "2026-03-01T10:00:00Z",
            "updatedAt": "2026-03-01T10:00:00Z",
        }))
        .unwrap()
    }

    fn dataset(ids: &[&str]) -> VenueDataset {
        VenueDataset::new(ids.iter().map(|id| venue(id)).collect(), now())
    }

    fn file_layer(root: &Path) -> StabilityLayer<FileDatasetBackend> {
        StabilityLayer::new(FileDatasetBackend::new(
            root.join("data/venues.json"),
            root.join("data/backups"),
        ))
    }

    #[tokio::test]
    async fn first_run_writes_without_backup() {
        let dir = tempdir().expect("tempdir");
        let layer = file_layer(dir.path());

        let outcome = layer
            .mutate("seed", false, |current| {
                assert!(current.is_none());
                Ok(dataset(&["a"]))
            })
            .await
            .expect("seed");

        assert!(outcome.backup.is_none());
        assert!(outcome.sha256_before.is_none());
        assert!(layer.backend().dataset_path().exists());
        assert!(layer.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_place_id_rolls_back_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let layer = file_layer(dir.path());
        layer
            .mutate("seed", false, |_| Ok(dataset(&["a", "b"])))
            .await
            .expect("seed");
        let before = std::fs::read(layer.backend().dataset_path()).unwrap();

        let err = layer
            .mutate("buggy-merge", true, |current| {
                let mut current = current.expect("existing");
                let mut dup = current.venues[0].clone();
                dup.slug = "another-slug".into();
                current.venues.push(dup);
                Ok(VenueDataset::new(current.venues, now()))
            })
            .await
            .expect_err("post-validation must fail");

        match &err {
            StabilityError::PostValidation {
                issues,
                restored_from,
                ..
            } => {
                assert!(issues.contains(&ValidationIssue::DuplicatePlaceId {
                    place_id: "a".into()
                }));
                assert!(restored_from.is_some());
            }
            other => panic!("unexpected error {other:?}"),
        }

        let after = std::fs::read(layer.backend().dataset_path()).unwrap();
        assert_eq!(before, after);
        let backups = layer.list_backups().await.unwrap();
        let backup_bytes = std::fs::read(backups[0].path.as_ref().unwrap()).unwrap();
        assert_eq!(backup_bytes, after);
    }

    #[tokio::test]
    async fn failed_first_run_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let layer = file_layer(dir.path());

        let err = layer
            .mutate("bad-seed", false, |_| {
                let mut broken = dataset(&["a"]);
                broken.total_venues = 7;
                Ok(broken)
            })
            .await
            .expect_err("count mismatch");

        assert!(matches!(
            err,
            StabilityError::PostValidation {
                restored_from: None,
                ..
            }
        ));
        assert!(!layer.backend().dataset_path().exists());
    }

    #[tokio::test]
    async fn operation_error_never_touches_store() {
        let dir = tempdir().expect("tempdir");
        let layer = file_layer(dir.path());
        layer
            .mutate("seed", false, |_| Ok(dataset(&["a"])))
            .await
            .expect("seed");
        let before = std::fs::read(layer.backend().dataset_path()).unwrap();

        let err = layer
            .mutate("explodes", true, |_| Err(anyhow!("boom")))
            .await
            .expect_err("op error");
        assert!(matches!(err, StabilityError::Operation { .. }));
        assert_eq!(before, std::fs::read(layer.backend().dataset_path()).unwrap());
    }

    #[tokio::test]
    async fn missing_dataset_fails_fast_when_required() {
        let dir = tempdir().expect("tempdir");
        let layer = file_layer(dir.path());
        let err = layer
            .mutate("enrich", true, |_| Ok(dataset(&["a"])))
            .await
            .expect_err("missing");
        assert!(matches!(err, StabilityError::MissingDataset(_)));
        assert!(!layer.backend().dataset_path().exists());
    }

    #[tokio::test]
    async fn backups_are_pruned_to_retention() {
        let dir = tempdir().expect("tempdir");
        let layer = file_layer(dir.path());
        for round in 0..13 {
            let id = format!("v{round}");
            layer
                .mutate("grow", false, move |current| {
                    let mut venues = current.map(|d| d.venues).unwrap_or_default();
                    venues.push(venue(&id));
                    Ok(VenueDataset::new(venues, now()))
                })
                .await
                .expect("grow");
        }

        let backups = layer.list_backups().await.unwrap();
        assert_eq!(backups.len(), DEFAULT_BACKUP_RETENTION);
        let newest = std::fs::read(backups.last().unwrap().path.as_ref().unwrap()).unwrap();
        let newest = VenueDataset::from_json_slice(&newest).unwrap();
        assert_eq!(newest.total_venues, 12);
    }

    #[tokio::test]
    async fn restore_latest_reverts_last_commit() {
        let layer = StabilityLayer::new(MemoryDatasetBackend::default());
        layer
            .mutate("seed", false, |_| Ok(dataset(&["a"])))
            .await
            .unwrap();
        layer
            .mutate("grow", true, |_| Ok(dataset(&["a", "b"])))
            .await
            .unwrap();

        let outcome = layer.restore_latest().await.expect("restore");
        assert_eq!(outcome.dataset.total_venues, 1);
        assert_eq!(layer.load().await.unwrap().unwrap().total_venues, 1);
    }

    #[tokio::test]
    async fn repeated_rollbacks_keep_stepping_back() {
        let workspace = tempdir().unwrap();
        let layer = file_layer(workspace.path());
        layer
            .mutate("seed", false, |_| Ok(dataset(&["a"])))
            .await
            .unwrap();
        layer
            .mutate("grow", true, |_| Ok(dataset(&["a", "b"])))
            .await
            .unwrap();
        layer
            .mutate("grow", true, |_| Ok(dataset(&["a", "b", "c"])))
            .await
            .unwrap();

        let first = layer.restore_latest().await.unwrap();
        assert_eq!(first.dataset.total_venues, 2);
        assert_eq!(first.backup.as_ref().unwrap().kind, BackupKind::PreRestore);

        let second = layer.restore_latest().await.unwrap();
        assert_eq!(second.dataset.total_venues, 1);
        assert_eq!(layer.load().await.unwrap().unwrap().total_venues, 1);

        // nothing older than the first backup
        assert!(matches!(
            layer.restore_latest().await,
            Err(StabilityError::BackupNotFound(_))
        ));

        let backups = layer.list_backups().await.unwrap();
        let kinds = backups.iter().map(|b| b.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                BackupKind::Mutation,
                BackupKind::Mutation,
                BackupKind::PreRestore,
                BackupKind::PreRestore,
            ]
        );

        // an explicit restore can still undo a rollback
        let undo = layer.restore(&backups[2].id).await.unwrap();
        assert_eq!(undo.dataset.total_venues, 3);
    }

    #[test]
    fn backup_kind_comes_from_the_id() {
        assert_eq!(
            BackupKind::of_id("venues_20260301_120000_000_000.json"),
            BackupKind::Mutation
        );
        assert_eq!(
            BackupKind::of_id("venues_20260301_120000_000_001_pre-restore.json"),
            BackupKind::PreRestore
        );
        assert_eq!(
            BackupKind::of_id("memory_20260301_120000_000_000003_pre-restore"),
            BackupKind::PreRestore
        );
    }

    #[tokio::test]
    async fn memory_backend_rolls_back_too() {
        let layer = StabilityLayer::new(MemoryDatasetBackend::new(Some(
            dataset(&["a"]).to_json_vec().unwrap(),
        )));
        let before = layer.backend().read_current().await.unwrap();

        let result = layer
            .mutate("bad", true, |_| {
                let mut d = dataset(&["a", "b"]);
                d.venues[1].slug = d.venues[0].slug.clone();
                Ok(d)
            })
            .await;
        assert!(matches!(result, Err(StabilityError::PostValidation { .. })));
        assert_eq!(before, layer.backend().read_current().await.unwrap());
    }
}
