//! Consolidation engine: incremental batch import, edit-triggered sync,
//! duplicate grouping and the administrative operations around them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use mrc_adapters::{MasterTable, MemoryMasterTable, SourceProvider, TableError, WorkbookDirectory};
use mrc_core::{columns, DateContext, KeyBuilder, LinkToken, LogEntry, MasterRecord, ReasonCode};
use mrc_storage::{
    CursorStore, DedupFlagStore, DocumentLock, FileLock, JsonFileKvStore, JsonlLogSink, KvStore, LockGuard,
    LockProvider, LogSink, MokaTtlCache, TtlCache,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

mod admin;
mod edit;
mod error;
mod grouper;
mod guard;
mod identity;
mod importer;

pub use admin::{FlagResetSummary, ManualEntry, ManualEntryOutcome, SeedSummary, MANUAL_SHEET, MANUAL_SOURCE_ID};
pub use edit::EditSyncSummary;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use grouper::GroupingSummary;
pub use guard::ConcurrencyGuard;
pub use identity::IdentityIndex;
pub use importer::ImportRunSummary;

pub const CRATE_NAME: &str = "mrc-sync";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<SourceConfig> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub master_offset: FixedOffset,
    pub edit_lock_wait: Duration,
    pub batch_lock_wait: Duration,
    pub debounce_window: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub link_base: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            master_offset: Utc.fix(),
            edit_lock_wait: Duration::from_secs(15),
            batch_lock_wait: Duration::from_secs(15),
            debounce_window: Duration::from_secs(3),
            scheduler_enabled: false,
            sync_cron: "0 0 2 * * *".to_string(),
            link_base: "https://docs.google.com/spreadsheets".to_string(),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// `+05:30`, `-0500`, `Z` or `UTC`.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }
    let (sign, rest) = match *value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("MRC_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            master_offset: std::env::var("MRC_MASTER_UTC_OFFSET")
                .ok()
                .and_then(|v| parse_utc_offset(&v))
                .unwrap_or(defaults.master_offset),
            edit_lock_wait: env_secs("MRC_EDIT_LOCK_WAIT_SECS", defaults.edit_lock_wait),
            batch_lock_wait: env_secs("MRC_BATCH_LOCK_WAIT_SECS", defaults.batch_lock_wait),
            debounce_window: env_secs("MRC_DEBOUNCE_SECS", defaults.debounce_window),
            scheduler_enabled: std::env::var("MRC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("MRC_SYNC_CRON").unwrap_or(defaults.sync_cron),
            link_base: std::env::var("MRC_LINK_BASE").unwrap_or(defaults.link_base),
        }
    }
}

/// What an entry point did. Entry points never return errors; failures are
/// logged and reported here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome<T> {
    Completed(T),
    Ignored { reason: String },
    LockTimeout { waited_ms: u64 },
    Failed { kind: ErrorKind, message: String },
}

impl<T> RunOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

pub struct Consolidator {
    config: SyncConfig,
    sources: Vec<SourceConfig>,
    provider: Arc<dyn SourceProvider>,
    master: Arc<dyn MasterTable>,
    log: Arc<dyn LogSink>,
    kv: Arc<dyn KvStore>,
    cursors: CursorStore,
    flags: DedupFlagStore,
    guard: ConcurrencyGuard,
}

impl Consolidator {
    pub fn new(
        config: SyncConfig,
        sources: Vec<SourceConfig>,
        provider: Arc<dyn SourceProvider>,
        master: Arc<dyn MasterTable>,
        log: Arc<dyn LogSink>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let guard = ConcurrencyGuard::new(
            Arc::new(DocumentLock::new("master")),
            Arc::new(MokaTtlCache::default()),
            config.debounce_window,
        );
        Self {
            config,
            sources,
            provider,
            master,
            log,
            cursors: CursorStore::new(Arc::clone(&kv)),
            flags: DedupFlagStore::new(Arc::clone(&kv)),
            kv,
            guard,
        }
    }

    /// Replace the lock and debounce cache, e.g. to share them across instances.
    pub fn with_guard(mut self, lock: Arc<dyn LockProvider>, debounce: Arc<dyn TtlCache>) -> Self {
        self.guard = ConcurrencyGuard::new(lock, debounce, self.config.debounce_window);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn flags(&self) -> &DedupFlagStore {
        &self.flags
    }

    /// Key builder pinned to today's date in the master timezone.
    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(DateContext::new(self.config.master_offset))
    }

    pub fn row_link(&self, token: &LinkToken) -> String {
        token.to_url(&self.config.link_base, columns::RELEVANT.len())
    }

    /// Takes the master lock, then reloads every store another holder of the
    /// lock may have written.
    async fn lock_master(&self, wait: Duration) -> SyncResult<LockGuard> {
        let lock = self.guard.acquire(wait).await?;
        self.kv.reload().await?;
        self.provider.reload().await?;
        self.master.reload().await?;
        Ok(lock)
    }

    /// Writes source identities and master rows through to storage. Sources
    /// go first so a crash never leaves master rows without their identity.
    async fn flush_tables(&self) -> SyncResult<()> {
        self.provider.flush().await?;
        self.master.flush().await?;
        Ok(())
    }

    /// Appends one record and returns the row it landed on.
    async fn append_master_row(&self, record: MasterRecord) -> SyncResult<usize> {
        let rows = self.master.append_rows(vec![record]).await?;
        match rows.as_slice() {
            [row] => Ok(*row),
            other => Err(TableError::Message(format!(
                "master append of one record reported {} rows",
                other.len()
            ))
            .into()),
        }
    }

    /// Single top-level handler: every failure becomes a `sync_error` log
    /// entry (lock timeouts only warn), and nothing propagates further.
    async fn conclude<T>(&self, operation: &str, triggered_by: &str, result: SyncResult<T>) -> RunOutcome<T> {
        match result {
            Ok(value) => RunOutcome::Completed(value),
            Err(SyncError::LockTimeout(waited)) => {
                warn!(operation, waited_ms = waited.as_millis() as u64, "skipped: master is locked");
                RunOutcome::LockTimeout {
                    waited_ms: waited.as_millis() as u64,
                }
            }
            Err(err) => {
                error!(operation, kind = ?err.kind(), error = %err, "sync failed");
                let entry = LogEntry::new(ReasonCode::SyncError(format!("{operation}: {err}")))
                    .triggered_by(triggered_by);
                if let Err(log_err) = self.log.write(&[entry]).await {
                    warn!(operation, error = %log_err, "could not record sync error");
                }
                RunOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        }
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let this = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                match this.run_batch_import(mrc_core::SYSTEM_USER).await {
                    RunOutcome::Completed(summary) => info!(
                        appended = summary.appended,
                        logged = summary.logged,
                        "scheduled import finished"
                    ),
                    other => warn!(outcome = status_of(&other), "scheduled import did not complete"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn status_of<T>(outcome: &RunOutcome<T>) -> &'static str {
    match outcome {
        RunOutcome::Completed(_) => "completed",
        RunOutcome::Ignored { .. } => "ignored",
        RunOutcome::LockTimeout { .. } => "lock_timeout",
        RunOutcome::Failed { .. } => "failed",
    }
}

pub const LOCK_FILE: &str = "state/master.lock";

/// File-backed deployment rooted at `SyncConfig::workspace_root`:
/// `sources.yaml`, `sources/<id>.json`, `master.json`,
/// `state/properties.json`, `state/master.lock` and
/// `logs/consolidation.jsonl`.
///
/// Every operation runs under the lock file and writes its tables back
/// before returning, so processes sharing the directory see each other's work.
pub struct Workspace {
    pub root: PathBuf,
    pub consolidator: Arc<Consolidator>,
    pub directory: Arc<WorkbookDirectory>,
    pub master: Arc<MemoryMasterTable>,
    pub log: Arc<JsonlLogSink>,
}

impl Workspace {
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let root = config.workspace_root.clone();
        let registry = SourceRegistry::load(&root.join("sources.yaml")).await?;
        let sources = registry.enabled();
        let ids: Vec<String> = sources.iter().map(|s| s.source_id.clone()).collect();

        let directory = Arc::new(WorkbookDirectory::load_from_dir(&root.join("sources"), &ids).await);
        let master = Arc::new(MemoryMasterTable::open(root.join("master.json"))?);
        let log = Arc::new(JsonlLogSink::new(root.join("logs").join("consolidation.jsonl")));
        let kv = JsonFileKvStore::open(root.join("state").join("properties.json"))
            .await
            .context("opening property store")?;

        let consolidator = Consolidator::new(
            config,
            sources,
            directory.clone(),
            master.clone(),
            log.clone(),
            Arc::new(kv),
        )
        .with_guard(
            Arc::new(FileLock::new(root.join(LOCK_FILE))),
            Arc::new(MokaTtlCache::default()),
        );
        Ok(Self {
            root,
            consolidator: Arc::new(consolidator),
            directory,
            master,
            log,
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }
}

pub async fn run_once_from_env() -> Result<RunOutcome<ImportRunSummary>> {
    let workspace = Workspace::open(SyncConfig::from_env()).await?;
    Ok(workspace.consolidator.run_batch_import(mrc_core::SYSTEM_USER).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn utc_offsets_parse_in_common_forms() {
        assert_eq!(parse_utc_offset("+05:30"), FixedOffset::east_opt(5 * 3600 + 30 * 60));
        assert_eq!(parse_utc_offset("-05:00"), FixedOffset::west_opt(5 * 3600));
        assert_eq!(parse_utc_offset("utc"), Some(Utc.fix()));
        assert_eq!(parse_utc_offset("Z"), Some(Utc.fix()));
        assert_eq!(parse_utc_offset("eastern"), None);
    }

    #[tokio::test]
    async fn registry_keeps_enabled_sources() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - source_id: clinic-a\n    display_name: Clinic A\n  - source_id: clinic-b\n    display_name: Clinic B\n    enabled: false\n",
        )
        .expect("write registry");

        let registry = SourceRegistry::load(&path).await.expect("registry");
        let enabled = registry.enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source_id, "clinic-a");
    }

    #[test]
    fn outcomes_serialize_with_a_status_tag() {
        let outcome: RunOutcome<GroupingSummary> = RunOutcome::LockTimeout { waited_ms: 5 };
        let json = serde_json::to_value(&outcome).expect("json");
        assert_eq!(json["status"], "lock_timeout");
        assert_eq!(json["waited_ms"], 5);
        assert!(!outcome.is_completed());

        let done = RunOutcome::Completed(GroupingSummary::default());
        assert_eq!(serde_json::to_value(&done).expect("json")["status"], "completed");
    }
}
