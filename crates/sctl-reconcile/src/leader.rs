//! # Leader Election
//!
//! Exactly one instance of a fleet reconciles and sweeps at a time. The
//! instances compete for a [`LeaseRecord`] held in a [`LeaseStore`]:
//!
//! - the holder renews the record every renew interval;
//! - any instance may take over a record whose holder has not renewed
//!   within the lease duration;
//! - a holder that cannot renew for two thirds of the lease duration steps
//!   down on its own, before anyone else can take over.
//!
//! All writes are compare-and-swap against the record last read, so two
//! contenders racing for an expired lease cannot both win.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sctl_core::LeaderSignal;

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default renew / retry period.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// A lock file older than this is assumed to belong to a crashed holder.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// The shared lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Identity of the holder; empty once released.
    pub holder: String,
    /// When the current holder acquired the lease.
    pub acquired_at: DateTime<Utc>,
    /// When the holder last renewed.
    pub renewed_at: DateTime<Utc>,
    /// Seconds after `renewed_at` at which the lease lapses.
    pub lease_duration_secs: u64,
    /// Number of holder changes.
    pub transitions: u64,
}

impl LeaseRecord {
    /// Instant after which others may take over.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.lease_duration_secs).unwrap_or(i64::MAX);
        self.renewed_at
            .checked_add_signed(chrono::Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the lease can be taken by anyone at `now`.
    pub fn is_free_at(&self, now: DateTime<Utc>) -> bool {
        self.holder.is_empty() || now >= self.expires_at()
    }
}

/// Lease persistence errors.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Reading or writing the lease failed.
    #[error("lease I/O error at {path}: {source}")]
    Io {
        /// Path touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The stored record does not parse.
    #[error("corrupt lease record at {path}: {source}")]
    Corrupt {
        /// Record path.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Storage for the lease record.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// The current record, if any.
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Store `new` if the current record equals `expected`. Returns
    /// whether the swap happened.
    async fn compare_and_swap(
        &self,
        expected: Option<&LeaseRecord>,
        new: LeaseRecord,
    ) -> Result<bool, LeaseError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Lease store shared between electors in one process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    record: Arc<Mutex<Option<LeaseRecord>>>,
}

impl InMemoryLeaseStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self.record.lock().clone())
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&LeaseRecord>,
        new: LeaseRecord,
    ) -> Result<bool, LeaseError> {
        let mut record = self.record.lock();
        if record.as_ref() != expected {
            return Ok(false);
        }
        *record = Some(new);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Lease record kept as JSON in a directory shared by the fleet.
///
/// Swaps are serialized by a lock file created with `create_new`; the
/// record itself is replaced by write-to-temp and rename. Both files are
/// dot-prefixed so the static responder never serves them.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
    record_path: PathBuf,
    lock_path: PathBuf,
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lease lock");
        }
    }
}

impl FileLeaseStore {
    /// A store for lease `name` in `dir`.
    pub fn new(dir: impl Into<PathBuf>, name: &str) -> Self {
        let dir = dir.into();
        Self {
            record_path: dir.join(format!(".leader-{name}.json")),
            lock_path: dir.join(format!(".leader-{name}.lock")),
            dir,
        }
    }

    /// Path of the record file.
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    async fn lock(&self) -> Result<Option<LockGuard>, LeaseError> {
        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    return Ok(Some(LockGuard {
                        path: self.lock_path.clone(),
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !self.lock_is_stale().await {
                        return Ok(None);
                    }
                    tracing::warn!(path = %self.lock_path.display(), "removing stale lease lock");
                    let _ = tokio::fs::remove_file(&self.lock_path).await;
                }
                Err(e) => {
                    return Err(LeaseError::Io {
                        path: self.lock_path.clone(),
                        source: e,
                    })
                }
            }
        }
        Ok(None)
    }

    async fn lock_is_stale(&self) -> bool {
        tokio::fs::metadata(&self.lock_path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > STALE_LOCK_AFTER)
    }

    async fn read(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        match tokio::fs::read(&self.record_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| LeaseError::Corrupt {
                    path: self.record_path.clone(),
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LeaseError::Io {
                path: self.record_path.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        self.read().await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&LeaseRecord>,
        new: LeaseRecord,
    ) -> Result<bool, LeaseError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| LeaseError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let Some(_guard) = self.lock().await? else {
            return Ok(false);
        };
        if self.read().await?.as_ref() != expected {
            return Ok(false);
        }

        let body = serde_json::to_vec_pretty(&new).map_err(|source| LeaseError::Corrupt {
            path: self.record_path.clone(),
            source,
        })?;
        let tmp = self.dir.join(format!(".leader-{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| LeaseError::Io {
                path: tmp.clone(),
                source,
            })?;
        if let Err(source) = tokio::fs::rename(&tmp, &self.record_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LeaseError::Io {
                path: self.record_path.clone(),
                source,
            });
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Elector
// ---------------------------------------------------------------------------

/// Keeps a [`LeaderSignal`] in step with the shared lease.
pub struct LeaderElector {
    identity: String,
    store: Arc<dyn LeaseStore>,
    lease_duration: Duration,
    renew_interval: Duration,
    signal: LeaderSignal,
}

impl LeaderElector {
    /// Create an elector competing as `identity`.
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        lease_duration: Duration,
        renew_interval: Duration,
        signal: LeaderSignal,
    ) -> Self {
        Self {
            identity: identity.into(),
            store,
            lease_duration,
            renew_interval,
            signal,
        }
    }

    /// This instance's identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The signal this elector drives.
    pub fn signal(&self) -> &LeaderSignal {
        &self.signal
    }

    /// One election round at `now`: renew if held, take over if free.
    /// Returns whether this instance holds the lease afterwards.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let current = self.store.get().await?;
        let new = match &current {
            Some(record) if record.holder == self.identity => LeaseRecord {
                renewed_at: now,
                lease_duration_secs: self.lease_duration.as_secs(),
                ..record.clone()
            },
            Some(record) if !record.is_free_at(now) => return Ok(false),
            other => LeaseRecord {
                holder: self.identity.clone(),
                acquired_at: now,
                renewed_at: now,
                lease_duration_secs: self.lease_duration.as_secs(),
                transitions: other.as_ref().map_or(0, |r| r.transitions + 1),
            },
        };
        self.store.compare_and_swap(current.as_ref(), new).await
    }

    /// Whether the stored record still names this instance. A read
    /// failure counts as yes; the renew deadline bounds how long that lasts.
    async fn still_named_holder(&self) -> bool {
        match self.store.get().await {
            Ok(Some(record)) => record.holder == self.identity,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "cannot re-read lease");
                true
            }
        }
    }

    /// Give the lease up if this instance holds it.
    pub async fn release(&self) -> Result<(), LeaseError> {
        let Some(current) = self.store.get().await? else {
            return Ok(());
        };
        if current.holder != self.identity {
            return Ok(());
        }
        let released = LeaseRecord {
            holder: String::new(),
            ..current.clone()
        };
        self.store.compare_and_swap(Some(&current), released).await?;
        Ok(())
    }

    /// Run election rounds until `cancel` fires, then release the lease.
    pub async fn run(self, cancel: CancellationToken) {
        let renew_deadline = self.lease_duration * 2 / 3;
        let mut last_renewed: Option<Instant> = None;
        tracing::info!(
            identity = %self.identity,
            lease_duration_secs = self.lease_duration.as_secs(),
            "starting leader election"
        );

        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    last_renewed = Some(Instant::now());
                    self.signal.set(true);
                }
                Ok(false) => {
                    let within_deadline = last_renewed.is_some_and(|at| at.elapsed() < renew_deadline);
                    if within_deadline && self.still_named_holder().await {
                        tracing::debug!(identity = %self.identity, "lease renewal contended, keeping leadership");
                    } else {
                        last_renewed = None;
                        self.signal.set(false);
                    }
                }
                Err(e) => {
                    tracing::warn!(identity = %self.identity, error = %e, "lease update failed");
                    if last_renewed.is_some_and(|at| at.elapsed() >= renew_deadline) {
                        tracing::error!(identity = %self.identity, "lease renewal deadline passed, stepping down");
                        last_renewed = None;
                        self.signal.set(false);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.renew_interval) => {}
            }
        }

        if self.signal.is_leader() {
            self.signal.set(false);
            if let Err(e) = self.release().await {
                tracing::warn!(identity = %self.identity, error = %e, "failed to release lease");
            }
        }
        tracing::info!(identity = %self.identity, "leader election stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sctl_core::leadership_channel;

    fn elector(id: &str, store: Arc<dyn LeaseStore>) -> LeaderElector {
        let (signal, _) = leadership_channel(false);
        LeaderElector::new(id, store, Duration::from_secs(15), Duration::from_secs(5), signal)
    }

    #[tokio::test]
    async fn only_one_contender_wins() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let a = elector("a", store.clone());
        let b = elector("b", store.clone());
        let now = Utc::now();
        assert!(a.try_acquire_or_renew(now).await.unwrap());
        assert!(!b.try_acquire_or_renew(now).await.unwrap());
        assert!(a.try_acquire_or_renew(now + chrono::Duration::seconds(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let a = elector("a", store.clone());
        let b = elector("b", store.clone());
        let now = Utc::now();
        assert!(a.try_acquire_or_renew(now).await.unwrap());
        let later = now + chrono::Duration::seconds(16);
        assert!(b.try_acquire_or_renew(later).await.unwrap());
        assert!(!a.try_acquire_or_renew(later).await.unwrap());

        let record = store.get().await.unwrap().unwrap();
        assert_eq!(record.holder, "b");
        assert_eq!(record.transitions, 1);
    }

    #[tokio::test]
    async fn released_lease_is_free_immediately() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
        let a = elector("a", store.clone());
        let b = elector("b", store.clone());
        let now = Utc::now();
        assert!(a.try_acquire_or_renew(now).await.unwrap());
        a.release().await.unwrap();
        assert!(b.try_acquire_or_renew(now).await.unwrap());
    }

    #[tokio::test]
    async fn stale_expectation_loses_the_swap() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        let record = LeaseRecord {
            holder: "a".into(),
            acquired_at: now,
            renewed_at: now,
            lease_duration_secs: 15,
            transitions: 0,
        };
        assert!(store.compare_and_swap(None, record.clone()).await.unwrap());
        assert!(!store.compare_and_swap(None, record).await.unwrap());
    }

    // ── FileLeaseStore ───────────────────────────────────────────────

    #[tokio::test]
    async fn file_store_round_trip_and_cas() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(tmp.path(), "305740c0.fluxcd.io");
        assert!(store.get().await.unwrap().is_none());

        let now = Utc::now();
        let record = LeaseRecord {
            holder: "pod-a".into(),
            acquired_at: now,
            renewed_at: now,
            lease_duration_secs: 15,
            transitions: 0,
        };
        assert!(store.compare_and_swap(None, record.clone()).await.unwrap());
        assert_eq!(store.get().await.unwrap(), Some(record.clone()));
        assert!(!store.compare_and_swap(None, record.clone()).await.unwrap());

        let renewed = LeaseRecord {
            renewed_at: now + chrono::Duration::seconds(5),
            ..record.clone()
        };
        assert!(store.compare_and_swap(Some(&record), renewed).await.unwrap());
        assert!(!store.lock_path.exists(), "lock must be released");
        assert!(store
            .record_path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with('.'));
    }

    #[tokio::test]
    async fn held_lock_makes_swap_lose() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(tmp.path(), "test");
        std::fs::write(&store.lock_path, b"").unwrap();
        let now = Utc::now();
        let record = LeaseRecord {
            holder: "pod-a".into(),
            acquired_at: now,
            renewed_at: now,
            lease_duration_secs: 15,
            transitions: 0,
        };
        assert!(!store.compare_and_swap(None, record).await.unwrap());
    }

    /// Delegates reads, and refuses every swap after the first `allowed`.
    struct BusyStore {
        inner: InMemoryLeaseStore,
        allowed: Mutex<usize>,
    }

    #[async_trait]
    impl LeaseStore for BusyStore {
        async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
            self.inner.get().await
        }

        async fn compare_and_swap(
            &self,
            expected: Option<&LeaseRecord>,
            new: LeaseRecord,
        ) -> Result<bool, LeaseError> {
            {
                let mut allowed = self.allowed.lock();
                if *allowed == 0 {
                    return Ok(false);
                }
                *allowed -= 1;
            }
            self.inner.compare_and_swap(expected, new).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn contended_renewal_keeps_leadership_until_deadline() {
        let store = Arc::new(BusyStore {
            inner: InMemoryLeaseStore::new(),
            allowed: Mutex::new(1),
        });
        let (signal, watch) = leadership_channel(false);
        let elector = LeaderElector::new(
            "a",
            store.clone(),
            Duration::from_secs(15),
            Duration::from_secs(4),
            signal,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(elector.run(cancel.clone()));

        let mut acquired = watch.clone();
        assert!(acquired.wait_for_leadership().await);

        // Rounds at 4s and 8s fail to swap but stay inside the 10s deadline.
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(watch.is_leader(), "a busy lease store is not a lost lease");

        // The 12s round is past the deadline.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!watch.is_leader());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lease_taken_by_another_drops_leadership() {
        let store = Arc::new(BusyStore {
            inner: InMemoryLeaseStore::new(),
            allowed: Mutex::new(1),
        });
        let (signal, watch) = leadership_channel(false);
        let elector = LeaderElector::new(
            "a",
            store.clone(),
            Duration::from_secs(15),
            Duration::from_secs(4),
            signal,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(elector.run(cancel.clone()));
        let mut acquired = watch.clone();
        assert!(acquired.wait_for_leadership().await);

        let mut record = store.get().await.unwrap().unwrap();
        record.holder = "b".into();
        *store.inner.record.lock() = Some(record);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!watch.is_leader());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_releases_on_cancel() {
        let store = InMemoryLeaseStore::new();
        let (signal, watch) = leadership_channel(false);
        let elector = LeaderElector::new(
            "a",
            Arc::new(store.clone()),
            Duration::from_secs(15),
            Duration::from_millis(10),
            signal,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(elector.run(cancel.clone()));
        let mut acquired = watch.clone();
        tokio::time::timeout(Duration::from_secs(1), acquired.wait_for_leadership())
            .await
            .unwrap();
        cancel.cancel();
        handle.await.unwrap();
        assert!(!watch.is_leader());
        assert_eq!(store.get().await.unwrap().unwrap().holder, "");
    }
}
