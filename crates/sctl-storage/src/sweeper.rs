//! # Retention Sweeper
//!
//! Periodically deletes artifacts older than the retention TTL. The
//! artifact named by an owner's current pointer is never deleted, whatever
//! its age. Leftover temporary files from interrupted writes are removed
//! under the same TTL.
//!
//! Sweeps are serialized and only run while this instance holds
//! leadership. Leadership is re-checked before every deletion, so losing
//! the lease mid-sweep stops further deletions immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sctl_core::{LeaderWatch, ObjectRef};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::{Storage, StoredEntry};
use crate::error::StorageError;

/// Counter of artifacts deleted by sweeps.
pub const SWEEP_DELETED_COUNTER: &str = "sctl_sweep_deleted_total";

/// Default sweep interval and retention TTL.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// How often to sweep and how long to keep non-current artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Time between sweeps.
    pub interval: Duration,
    /// Minimum age before a non-current artifact is deleted.
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETENTION,
            ttl: DEFAULT_RETENTION,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Owner directories scanned.
    pub owners_scanned: usize,
    /// Files deleted.
    pub deleted: usize,
    /// Bytes reclaimed.
    pub bytes_reclaimed: u64,
    /// Files kept because they are current.
    pub retained_current: usize,
    /// Deletions that failed; left for the next sweep.
    pub failed: usize,
    /// Whether the sweep stopped early because leadership was lost.
    pub aborted: bool,
}

/// The storage operations a sweep uses.
#[async_trait]
pub trait SweepTarget: Send + Sync {
    /// Every owner with an artifact directory.
    async fn list_owners(&self) -> Result<Vec<ObjectRef>, StorageError>;

    /// File name the owner's current pointer names.
    async fn current(&self, owner: &ObjectRef) -> Result<Option<String>, StorageError>;

    /// Files in the owner directory, excluding the pointer.
    async fn list_entries(&self, owner: &ObjectRef) -> Result<Vec<StoredEntry>, StorageError>;

    /// Delete one file. Returns whether it existed.
    async fn remove_entry(&self, owner: &ObjectRef, file_name: &str) -> Result<bool, StorageError>;
}

#[async_trait]
impl SweepTarget for Storage {
    async fn list_owners(&self) -> Result<Vec<ObjectRef>, StorageError> {
        Storage::list_owners(self).await
    }

    async fn current(&self, owner: &ObjectRef) -> Result<Option<String>, StorageError> {
        Storage::current(self, owner).await
    }

    async fn list_entries(&self, owner: &ObjectRef) -> Result<Vec<StoredEntry>, StorageError> {
        Storage::list_entries(self, owner).await
    }

    async fn remove_entry(&self, owner: &ObjectRef, file_name: &str) -> Result<bool, StorageError> {
        Storage::remove_entry(self, owner, file_name).await
    }
}

/// The retention sweeper.
pub struct Sweeper {
    storage: Arc<dyn SweepTarget>,
    policy: RetentionPolicy,
    running: Mutex<()>,
}

impl Sweeper {
    /// Create a sweeper over `storage`.
    pub fn new(storage: Arc<dyn SweepTarget>, policy: RetentionPolicy) -> Self {
        Self {
            storage,
            policy,
            running: Mutex::new(()),
        }
    }

    /// The configured policy.
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Run one sweep as of `now`.
    ///
    /// Each owner's current pointer is read once, before its directory is
    /// listed, and that snapshot is the exclusion set for the whole owner.
    /// Failures are logged and counted; none of them end the sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>, leader: &LeaderWatch) -> SweepReport {
        let _serialized = self.running.lock().await;
        let mut report = SweepReport::default();

        if !leader.is_leader() {
            report.aborted = true;
            return report;
        }

        let cutoff = chrono::Duration::from_std(self.policy.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let owners = match self.storage.list_owners().await {
            Ok(owners) => owners,
            Err(e) => {
                tracing::error!(error = %e, "sweep could not list artifact owners");
                return report;
            }
        };

        for owner in owners {
            report.owners_scanned += 1;

            let current = match self.storage.current(&owner).await {
                Ok(current) => current,
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "skipping owner: unreadable current pointer");
                    continue;
                }
            };
            let entries = match self.storage.list_entries(&owner).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "skipping owner: cannot list artifacts");
                    continue;
                }
            };

            for entry in entries {
                if current.as_deref() == Some(entry.file_name.as_str()) {
                    report.retained_current += 1;
                    continue;
                }
                if entry.modified > cutoff {
                    continue;
                }
                if !leader.is_leader() {
                    tracing::warn!(owner = %owner, "leadership lost, aborting sweep");
                    report.aborted = true;
                    self.record(&report);
                    return report;
                }
                match self.storage.remove_entry(&owner, &entry.file_name).await {
                    Ok(true) => {
                        report.deleted += 1;
                        report.bytes_reclaimed += entry.size;
                        tracing::debug!(
                            owner = %owner,
                            file = %entry.file_name,
                            temporary = entry.temporary,
                            "swept stale artifact"
                        );
                    }
                    Ok(false) => {}
                    Err(StorageError::CurrentArtifact(_)) => report.retained_current += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            owner = %owner,
                            file = %entry.file_name,
                            error = %e,
                            "failed to delete stale artifact; will retry next sweep"
                        );
                    }
                }
            }
        }

        self.record(&report);
        report
    }

    fn record(&self, report: &SweepReport) {
        metrics::counter!(SWEEP_DELETED_COUNTER).increment(report.deleted as u64);
        if report.deleted > 0 || report.failed > 0 {
            tracing::info!(
                owners = report.owners_scanned,
                deleted = report.deleted,
                bytes = report.bytes_reclaimed,
                failed = report.failed,
                "artifact sweep finished"
            );
        }
    }

    /// Sweep every interval until `cancel` fires. Ticks are skipped while
    /// this instance is a standby.
    pub async fn run(self: Arc<Self>, leader: LeaderWatch, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.policy.interval.as_secs(),
            ttl_secs = self.policy.ttl.as_secs(),
            "retention sweeper started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !leader.is_leader() {
                        tracing::debug!("standby, skipping sweep");
                        continue;
                    }
                    self.sweep_once(Utc::now(), &leader).await;
                }
            }
        }
        tracing::info!("retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::UrlResolver;
    use sctl_core::{leadership_channel, ArtifactKey, LeaderSignal, ResourceKind, Revision};

    fn setup() -> (tempfile::TempDir, Arc<Storage>) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path().join("root"), UrlResolver::new("localhost:9090"));
        storage.initialize().unwrap();
        (tmp, Arc::new(storage))
    }

    fn key(rev: &str) -> ArtifactKey {
        ArtifactKey::new(
            ObjectRef::new(ResourceKind::HelmChart, "default", "nginx").unwrap(),
            Revision::new(rev).unwrap(),
        )
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn sweep_keeps_current_and_deletes_stale() {
        let (_tmp, storage) = setup();
        for rev in ["1.0.0", "1.1.0", "1.2.0"] {
            storage.write_bytes(&key(rev), rev.as_bytes()).await.unwrap();
        }
        storage.mark_current(&key("1.1.0")).await.unwrap();

        let sweeper = Sweeper::new(storage.clone(), RetentionPolicy::default());
        let report = sweeper.sweep_once(later(), &LeaderWatch::always()).await;

        assert_eq!(report.deleted, 2);
        assert_eq!(report.retained_current, 1);
        assert!(storage.exists(&key("1.1.0")).await.unwrap());
        assert!(!storage.exists(&key("1.0.0")).await.unwrap());
        assert!(!storage.exists(&key("1.2.0")).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_spares_recent_artifacts() {
        let (_tmp, storage) = setup();
        storage.write_bytes(&key("1.0.0"), b"x").await.unwrap();
        let sweeper = Sweeper::new(storage.clone(), RetentionPolicy::default());
        let report = sweeper.sweep_once(Utc::now(), &LeaderWatch::always()).await;
        assert_eq!(report.deleted, 0);
        assert!(storage.exists(&key("1.0.0")).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_stale_temp_files() {
        let (_tmp, storage) = setup();
        let owner = key("1.0.0").owner;
        let dir = storage.owner_dir(&owner);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(".tmp-crashed-write"), b"partial").unwrap();

        let sweeper = Sweeper::new(storage.clone(), RetentionPolicy::default());
        let report = sweeper.sweep_once(later(), &LeaderWatch::always()).await;
        assert_eq!(report.deleted, 1);
        assert!(storage.list_entries(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn standby_performs_no_deletions() {
        let (_tmp, storage) = setup();
        storage.write_bytes(&key("1.0.0"), b"x").await.unwrap();
        let (_signal, standby) = leadership_channel(false);

        let sweeper = Sweeper::new(storage.clone(), RetentionPolicy::default());
        let report = sweeper.sweep_once(later(), &standby).await;
        assert!(report.aborted);
        assert_eq!(report.deleted, 0);
        assert!(storage.exists(&key("1.0.0")).await.unwrap());
    }

    /// Steps down right after its first successful deletion.
    struct StepDownAfterDelete {
        storage: Arc<Storage>,
        signal: LeaderSignal,
    }

    #[async_trait]
    impl SweepTarget for StepDownAfterDelete {
        async fn list_owners(&self) -> Result<Vec<ObjectRef>, StorageError> {
            self.storage.list_owners().await
        }

        async fn current(&self, owner: &ObjectRef) -> Result<Option<String>, StorageError> {
            self.storage.current(owner).await
        }

        async fn list_entries(&self, owner: &ObjectRef) -> Result<Vec<StoredEntry>, StorageError> {
            self.storage.list_entries(owner).await
        }

        async fn remove_entry(&self, owner: &ObjectRef, file_name: &str) -> Result<bool, StorageError> {
            let removed = self.storage.remove_entry(owner, file_name).await?;
            self.signal.set(false);
            Ok(removed)
        }
    }

    #[tokio::test]
    async fn leadership_lost_mid_sweep_stops_deletions() {
        let (_tmp, storage) = setup();
        for rev in ["1.0.0", "1.1.0", "1.2.0", "2.0.0"] {
            storage.write_bytes(&key(rev), rev.as_bytes()).await.unwrap();
        }
        storage.mark_current(&key("2.0.0")).await.unwrap();

        let (signal, leader) = leadership_channel(true);
        let target = Arc::new(StepDownAfterDelete {
            storage: storage.clone(),
            signal,
        });
        let sweeper = Sweeper::new(target, RetentionPolicy::default());
        let report = sweeper.sweep_once(later(), &leader).await;

        assert!(report.aborted);
        assert_eq!(report.deleted, 1);
        let left = storage.list_entries(&key("2.0.0").owner).await.unwrap();
        assert_eq!(left.len(), 3, "two stale artifacts survive next to the current one");
        assert!(storage.exists(&key("2.0.0")).await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (_tmp, storage) = setup();
        let sweeper = Arc::new(Sweeper::new(
            storage,
            RetentionPolicy {
                interval: Duration::from_millis(10),
                ttl: Duration::from_secs(60),
            },
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(LeaderWatch::always(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
