//! Persistent state for MRC: key-value properties, cursors, dedup flags,
//! the debounce cache, the master document lock, and the audit log sink.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use moka::Expiry;
use mrc_core::{GroupKey, LogEntry, TableId};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mrc-storage";

pub const CURSOR_PREFIX: &str = "consolidate_lastRow_";
pub const DEDUP_PREFIX: &str = "dup_logged_";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid state file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> StorageError + 'a {
    move |source| StorageError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(io_err("creating directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp file", &temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err("renaming temp file onto", path)(err));
    }
    Ok(())
}

/// String-valued property store shared by cursors and dedup flags.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set(&self, key: &str, value: String) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
    /// Re-reads backing storage another process may have changed.
    async fn reload(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Properties kept in one JSON object on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

async fn read_entries(path: &Path) -> StorageResult<BTreeMap<String, String>> {
    match fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(io_err("reading", path)(err)),
    }
}

impl JsonFileKvStore {
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let entries = read_entries(&path).await?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl KvStore for JsonFileKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(&entries).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn reload(&self) -> StorageResult<()> {
        let fresh = read_entries(&self.path).await?;
        *self.entries.lock().await = fresh;
        Ok(())
    }
}

/// Short-lived suppression markers.
pub trait TtlCache: Send + Sync {
    fn contains(&self, key: &str) -> bool;
    fn put(&self, key: &str, ttl: Duration);
}

struct PerEntryTtl;

impl Expiry<String, Duration> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, ttl: &Duration, _created_at: Instant) -> Option<Duration> {
        Some(*ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        ttl: &Duration,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(*ttl)
    }
}

pub struct MokaTtlCache {
    cache: Cache<String, Duration>,
}

impl MokaTtlCache {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MokaTtlCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TtlCache for MokaTtlCache {
    fn contains(&self, key: &str) -> bool {
        self.cache.get(key).is_some()
    }

    fn put(&self, key: &str, ttl: Duration) {
        self.cache.insert(key.to_string(), ttl);
    }
}

/// Held while the master document is locked; dropping it releases the lock.
pub struct LockGuard {
    name: String,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, held: impl Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            _held: Box::new(held),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(lock = %self.name, "lock released");
    }
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// `None` when the lock could not be taken within `wait`.
    async fn try_acquire(&self, wait: Duration) -> Option<LockGuard>;
}

/// In-process mutual exclusion scoped to one master document.
#[derive(Debug, Clone)]
pub struct DocumentLock {
    name: String,
    inner: Arc<Mutex<()>>,
}

impl DocumentLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl LockProvider for DocumentLock {
    async fn try_acquire(&self, wait: Duration) -> Option<LockGuard> {
        match tokio::time::timeout(wait, Arc::clone(&self.inner).lock_owned()).await {
            Ok(held) => {
                debug!(lock = %self.name, "lock acquired");
                Some(LockGuard::new(&self.name, held))
            }
            Err(_) => {
                warn!(lock = %self.name, wait_ms = wait.as_millis() as u64, "lock wait timed out");
                None
            }
        }
    }
}

const FILE_LOCK_POLL: Duration = Duration::from_millis(25);

/// Advisory lock on a file, shared by every process working on one workspace.
///
/// The OS lock is held by a dedicated thread until the returned [`LockGuard`]
/// is dropped.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

fn hold_file_lock(
    path: PathBuf,
    wait: Duration,
    acquired: oneshot::Sender<std::io::Result<()>>,
    release: mpsc::Receiver<()>,
) {
    let file = match open_lock_file(&path) {
        Ok(file) => file,
        Err(err) => {
            let _ = acquired.send(Err(err));
            return;
        }
    };
    let mut lock = fd_lock::RwLock::new(file);
    let deadline = Instant::now() + wait;
    loop {
        match lock.try_write() {
            Ok(_held) => {
                if acquired.send(Ok(())).is_ok() {
                    // Returns once the guard's sender is dropped.
                    let _ = release.recv();
                }
                return;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    let _ = acquired.send(Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "lock file is held elsewhere",
                    )));
                    return;
                }
                std::thread::sleep(FILE_LOCK_POLL);
            }
            Err(err) => {
                let _ = acquired.send(Err(err));
                return;
            }
        }
    }
}

#[async_trait]
impl LockProvider for FileLock {
    async fn try_acquire(&self, wait: Duration) -> Option<LockGuard> {
        let (acquired_tx, acquired_rx) = oneshot::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let path = self.path.clone();
        std::thread::spawn(move || hold_file_lock(path, wait, acquired_tx, release_rx));

        let name = self.path.display().to_string();
        match acquired_rx.await {
            Ok(Ok(())) => {
                debug!(lock = %name, "file lock acquired");
                Some(LockGuard::new(name, release_tx))
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::TimedOut => {
                warn!(lock = %name, wait_ms = wait.as_millis() as u64, "lock wait timed out");
                None
            }
            Ok(Err(err)) => {
                warn!(lock = %name, error = %err, "lock file unusable");
                None
            }
            Err(_) => None,
        }
    }
}

/// Append-only audit trail.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, entries: &[LogEntry]) -> StorageResult<()>;
    async fn entries(&self) -> StorageResult<Vec<LogEntry>>;
    /// Administrative rebuild only.
    async fn clear(&self) -> StorageResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, entries: &[LogEntry]) -> StorageResult<()> {
        self.entries.lock().await.extend_from_slice(entries);
        Ok(())
    }

    async fn entries(&self) -> StorageResult<Vec<LogEntry>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.entries.lock().await.clear();
        Ok(())
    }
}

/// One JSON object per line.
#[derive(Debug)]
pub struct JsonlLogSink {
    path: PathBuf,
    append: Mutex<()>,
}

impl JsonlLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: Mutex::new(()),
        }
    }
}

#[async_trait]
impl LogSink for JsonlLogSink {
    async fn write(&self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let _held = self.append.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(io_err("creating directory", parent))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err("opening log", &self.path))?;
        file.write_all(&buf)
            .await
            .map_err(io_err("appending to log", &self.path))?;
        file.flush().await.map_err(io_err("flushing log", &self.path))
    }

    async fn entries(&self) -> StorageResult<Vec<LogEntry>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err("reading log", &self.path)(err)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StorageError::Decode {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }

    async fn clear(&self) -> StorageResult<()> {
        let _held = self.append.lock().await;
        write_atomic(&self.path, b"").await
    }
}

/// Per-(source, table) last processed row.
#[derive(Clone)]
pub struct CursorStore {
    kv: Arc<dyn KvStore>,
}

impl CursorStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn key(source_id: &str, table_id: TableId) -> String {
        format!("{CURSOR_PREFIX}{source_id}_{table_id}")
    }

    pub async fn get(&self, source_id: &str, table_id: TableId) -> StorageResult<usize> {
        let key = Self::key(source_id, table_id);
        Ok(match self.kv.get(&key).await? {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(%key, value = %raw, "ignoring unreadable cursor");
                0
            }),
            None => 0,
        })
    }

    /// Index 0 is the default, so it is stored as no key at all.
    pub async fn set(&self, source_id: &str, table_id: TableId, index: usize) -> StorageResult<()> {
        let key = Self::key(source_id, table_id);
        if index == 0 {
            return self.kv.delete(&key).await;
        }
        self.kv.set(&key, index.to_string()).await
    }

    /// Moves forward to `new_index`; only moves back when the table has shrunk
    /// below the stored cursor. Never exceeds `table_rows`.
    pub async fn advance(
        &self,
        source_id: &str,
        table_id: TableId,
        new_index: usize,
        table_rows: usize,
    ) -> StorageResult<usize> {
        let current = self.get(source_id, table_id).await?;
        let next = current.max(new_index).min(table_rows);
        if next != current {
            self.set(source_id, table_id, next).await?;
        }
        Ok(next)
    }

    pub async fn reset_all(&self) -> StorageResult<usize> {
        let keys = self.kv.keys_with_prefix(CURSOR_PREFIX).await?;
        for key in &keys {
            self.kv.delete(key).await?;
        }
        Ok(keys.len())
    }
}

/// Remembers which duplicate groups have already been reported.
#[derive(Clone)]
pub struct DedupFlagStore {
    kv: Arc<dyn KvStore>,
}

impl DedupFlagStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn key(group: &GroupKey) -> String {
        format!("{DEDUP_PREFIX}{}", sha256_hex(group.to_string().as_bytes()))
    }

    pub async fn notified_at(&self, group: &GroupKey) -> StorageResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.kv.get(&Self::key(group)).await? else {
            return Ok(None);
        };
        // Any stored value counts as notified, even one we cannot parse.
        Ok(Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        ))
    }

    pub async fn mark(&self, group: &GroupKey, at: DateTime<Utc>) -> StorageResult<()> {
        self.kv.set(&Self::key(group), at.to_rfc3339()).await
    }

    pub async fn reset_all(&self) -> StorageResult<usize> {
        let keys = self.kv.keys_with_prefix(DEDUP_PREFIX).await?;
        for key in &keys {
            self.kv.delete(key).await?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrc_core::ReasonCode;
    use tempfile::tempdir;

    fn group(first: &str) -> GroupKey {
        GroupKey {
            first: first.into(),
            last: "DOE".into(),
            dob: "1990-05-02".into(),
        }
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn json_kv_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("properties.json");
        {
            let kv = JsonFileKvStore::open(&path).await.expect("open");
            kv.set("consolidate_lastRow_a_0", "12".into()).await.expect("set");
            kv.set("dup_logged_x", "ts".into()).await.expect("set");
            kv.delete("dup_logged_x").await.expect("delete");
        }
        let kv = JsonFileKvStore::open(&path).await.expect("reopen");
        assert_eq!(kv.get("consolidate_lastRow_a_0").await.expect("get").as_deref(), Some("12"));
        assert_eq!(kv.get("dup_logged_x").await.expect("get"), None);
    }

    #[tokio::test]
    async fn cursor_advances_monotonically_and_clamps_on_shrink() {
        let kv = Arc::new(MemoryKvStore::new());
        let cursors = CursorStore::new(kv.clone());
        assert_eq!(cursors.get("src", 0).await.expect("get"), 0);

        assert_eq!(cursors.advance("src", 0, 10, 10).await.expect("advance"), 10);
        // Older index is a no-op while the table still has the rows.
        assert_eq!(cursors.advance("src", 0, 4, 12).await.expect("advance"), 10);
        // Table shrank below the cursor.
        assert_eq!(cursors.advance("src", 0, 6, 6).await.expect("advance"), 6);
        assert_eq!(cursors.advance("src", 0, 0, 0).await.expect("advance"), 0);
        assert_eq!(kv.get(&CursorStore::key("src", 0)).await.expect("get"), None);

        // Other tables are independent.
        assert_eq!(cursors.advance("src", 7, 3, 3).await.expect("advance"), 3);
        assert_eq!(cursors.reset_all().await.expect("reset"), 1);
        assert_eq!(cursors.get("src", 7).await.expect("get"), 0);
    }

    #[tokio::test]
    async fn cursor_shrink_sequence_matches_min_of_last_and_rows() {
        let cursors = CursorStore::new(Arc::new(MemoryKvStore::new()));
        let mut last = 0usize;
        for rows in [5usize, 9, 3, 3, 8, 1, 0, 4] {
            let expected = last.max(rows).min(rows);
            last = cursors.advance("s", 1, rows, rows).await.expect("advance");
            assert_eq!(last, expected);
            assert!(last <= rows);
        }
    }

    #[tokio::test]
    async fn dedup_flags_mark_and_reset() {
        let flags = DedupFlagStore::new(Arc::new(MemoryKvStore::new()));
        let jane = group("JANE");
        assert!(flags.notified_at(&jane).await.expect("read").is_none());

        let at = DateTime::parse_from_rfc3339("2024-02-01T10:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        flags.mark(&jane, at).await.expect("mark");
        assert_eq!(flags.notified_at(&jane).await.expect("read"), Some(at));
        assert!(flags.notified_at(&group("JOHN")).await.expect("read").is_none());
        assert!(DedupFlagStore::key(&jane).starts_with(DEDUP_PREFIX));

        assert_eq!(flags.reset_all().await.expect("reset"), 1);
        assert!(flags.notified_at(&jane).await.expect("read").is_none());
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let cache = MokaTtlCache::new(16);
        cache.put("a", Duration::from_millis(40));
        cache.put("b", Duration::from_secs(60));
        assert!(cache.contains("a"));
        std::thread::sleep(Duration::from_millis(120));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[tokio::test]
    async fn document_lock_times_out_while_held_and_frees_on_drop() {
        let lock = DocumentLock::new("master");
        let guard = lock
            .try_acquire(Duration::from_millis(50))
            .await
            .expect("first acquire");
        assert_eq!(guard.name(), "master");
        assert!(lock.try_acquire(Duration::from_millis(50)).await.is_none());
        drop(guard);
        assert!(lock.try_acquire(Duration::from_millis(50)).await.is_some());
    }

    #[tokio::test]
    async fn json_kv_store_reload_sees_other_writers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("properties.json");
        let ours = JsonFileKvStore::open(&path).await.expect("open");
        let theirs = JsonFileKvStore::open(&path).await.expect("open");

        theirs.set("consolidate_lastRow_a_0", "7".into()).await.expect("set");
        assert_eq!(ours.get("consolidate_lastRow_a_0").await.expect("get"), None);
        ours.reload().await.expect("reload");
        assert_eq!(ours.get("consolidate_lastRow_a_0").await.expect("get").as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn file_lock_excludes_other_handles_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("master.lock");
        let first = FileLock::new(&path);
        let second = FileLock::new(&path);

        let guard = first
            .try_acquire(Duration::from_millis(100))
            .await
            .expect("first acquire");
        assert!(second.try_acquire(Duration::from_millis(100)).await.is_none());
        drop(guard);
        assert!(second.try_acquire(Duration::from_secs(2)).await.is_some());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn jsonl_log_sink_appends_and_clears() {
        let dir = tempdir().expect("tempdir");
        let sink = JsonlLogSink::new(dir.path().join("logs").join("consolidation.jsonl"));
        assert!(sink.entries().await.expect("empty").is_empty());

        sink.write(&[LogEntry::new(ReasonCode::NoData).at_row(2)])
            .await
            .expect("write");
        sink.write(&[
            LogEntry::new(ReasonCode::PotentialDuplicate),
            LogEntry::new(ReasonCode::CouldNotBuildKey),
        ])
        .await
        .expect("write");

        let entries = sink.entries().await.expect("entries");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].row_number, Some(2));
        assert_eq!(entries[2].reason, "could_not_build_key");

        sink.clear().await.expect("clear");
        assert!(sink.entries().await.expect("entries").is_empty());
    }
}
