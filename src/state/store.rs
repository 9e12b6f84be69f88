//! Durable snapshot stores.
//!
//! Each plan is persisted as one [`Snapshot`] keyed by plan id. Writes are
//! compare-and-swap on the snapshot `version`, so two executors resuming the
//! same plan cannot both commit a transition.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::util::blocking;
use crate::workflow::{PlanId, PlanStatus, SessionId, Snapshot};

/// Listing entry returned by [`DurableStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: PlanId,
    pub session_id: SessionId,
    pub status: PlanStatus,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Snapshot> for PlanSummary {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            plan_id: snapshot.plan.plan_id,
            session_id: snapshot.plan.session_id,
            status: snapshot.plan.status,
            version: snapshot.version,
            updated_at: snapshot.plan.updated_at,
        }
    }
}

/// Key-value persistence for plan snapshots.
///
/// Implementations must be safe to share between concurrently running plans.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load(&self, plan_id: PlanId) -> Result<Option<Snapshot>>;

    /// Write `snapshot` if the stored version still equals `snapshot.version`
    /// (0 meaning "not stored yet") and return the new version.
    ///
    /// Returns `Error::VersionConflict` when another writer got there first.
    async fn save(&self, snapshot: &Snapshot) -> Result<u64>;

    async fn list(&self) -> Result<Vec<PlanSummary>>;
}

/// In-process store, used by tests and embedders without durability needs.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<PlanId, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self, plan_id: PlanId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().await.get(&plan_id).cloned())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<u64> {
        let mut snapshots = self.snapshots.write().await;
        let plan_id = snapshot.plan_id();
        let actual = snapshots.get(&plan_id).map(|s| s.version).unwrap_or(0);
        if actual != snapshot.version {
            return Err(Error::VersionConflict {
                plan_id,
                expected: snapshot.version,
                actual,
            });
        }
        let mut stored = snapshot.clone();
        stored.version = actual + 1;
        snapshots.insert(plan_id, stored);
        Ok(actual + 1)
    }

    async fn list(&self) -> Result<Vec<PlanSummary>> {
        let mut summaries: Vec<PlanSummary> = self
            .snapshots
            .read()
            .await
            .values()
            .map(PlanSummary::from)
            .collect();
        summaries.sort_by_key(|s| s.updated_at);
        Ok(summaries)
    }
}

/// How long a save waits for another process's lock on the same plan.
const LOCK_WAIT: Duration = Duration::from_secs(15);
/// A lock file older than this was left behind by a crashed writer.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(10);

/// One pretty-printed JSON file per plan under a directory.
///
/// Files are replaced atomically (write to `.tmp`, then rename). The CAS
/// check holds `<plan_id>.lock`, created exclusively, from the version read
/// to the rename, so processes sharing the directory serialize their
/// writes to a plan.
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    lock_wait: Duration,
    stale_lock_after: Duration,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
            lock_wait: LOCK_WAIT,
            stale_lock_after: STALE_LOCK_AFTER,
        }
    }

    /// Override how long a save waits for a held plan lock, and the age at
    /// which a lock is treated as abandoned.
    pub fn with_lock_timing(mut self, wait: Duration, stale_after: Duration) -> Self {
        self.lock_wait = wait;
        self.stale_lock_after = stale_after;
        self
    }

    pub fn snapshot_path(&self, plan_id: PlanId) -> PathBuf {
        self.dir.join(format!("{plan_id}.json"))
    }

    pub fn lock_path(&self, plan_id: PlanId) -> PathBuf {
        self.dir.join(format!("{plan_id}.lock"))
    }
}

/// Exclusive hold on one plan's snapshot, shared by every process using the
/// directory. Removed on drop.
struct PlanFileLock {
    path: PathBuf,
}

impl PlanFileLock {
    fn acquire(path: PathBuf, wait: Duration, stale_after: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(mut file) => {
                    let lock = Self { path };
                    file.write_all(std::process::id().to_string().as_bytes())?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&path).is_some_and(|age| age >= stale_after) {
                        tracing::warn!(path = %path.display(), "removing stale snapshot lock");
                        if let Err(e) = fs::remove_file(&path) {
                            tracing::debug!(path = %path.display(), error = %e, "stale lock already gone");
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::PersistenceFailure(format!(
                            "{} is held by another writer",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for PlanFileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release snapshot lock");
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self, plan_id: PlanId) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(plan_id);
        blocking(move || read_snapshot(&path)).await
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let plan_id = snapshot.plan_id();
        let path = self.snapshot_path(plan_id);
        let lock_path = self.lock_path(plan_id);
        let (wait, stale_after) = (self.lock_wait, self.stale_lock_after);
        let dir = self.dir.clone();
        let mut stored = snapshot.clone();

        blocking(move || {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
            let _lock = PlanFileLock::acquire(lock_path, wait, stale_after)?;

            let actual = read_snapshot(&path)?.map(|s| s.version).unwrap_or(0);
            if actual != stored.version {
                return Err(Error::VersionConflict {
                    plan_id,
                    expected: stored.version,
                    actual,
                });
            }
            stored.version = actual + 1;

            let contents = serde_json::to_string_pretty(&stored)?;
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, contents)
                .map_err(|e| Error::PersistenceFailure(format!("{}: {e}", temp_path.display())))?;
            fs::rename(&temp_path, &path)
                .map_err(|e| Error::PersistenceFailure(format!("{}: {e}", path.display())))?;
            tracing::debug!(plan_id = %plan_id, version = stored.version, "snapshot saved");
            Ok(stored.version)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<PlanSummary>> {
        let dir = self.dir.clone();
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut summaries = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_snapshot(&path) {
                    Ok(Some(snapshot)) => summaries.push(PlanSummary::from(&snapshot)),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                    }
                }
            }
            summaries.sort_by_key(|s| s.updated_at);
            Ok(summaries)
        })
        .await
    }
}
