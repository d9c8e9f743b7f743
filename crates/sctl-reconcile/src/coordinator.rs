//! # Reconciliation Coordinator
//!
//! One coordinator runs per resource kind. It watches the source store,
//! queues changed objects, and reconciles each one:
//!
//! ```text
//! Pending ─▶ Fetching ─▶ Storing ─▶ Publishing ─▶ Done
//!    │          │           │            │
//!    └──────────┴───────────┴────────────┴──▶ Failed
//! ```
//!
//! - `Fetching` asks the kind's [`Fetcher`] for the upstream revision. A
//!   revision equal to the last published one short-circuits the task, as
//!   does one already rejected as too large at the current generation.
//! - `Storing` writes the artifact and moves the current pointer. The
//!   owner is re-read first; a deleted owner is never written for.
//! - `Publishing` writes URL, checksum, and revision back to the source.
//!
//! A failed task is not retried in place. It is requeued: with backoff
//! for transient kinds, after the resync interval for permanent ones.
//!
//! New tasks are only dispatched while this instance leads, and at most
//! `max_concurrent` run at once. Losing leadership lets in-flight tasks
//! finish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sctl_core::source::DEFAULT_INTERVAL_SECS;
use sctl_core::{
    Artifact, ArtifactKey, ArtifactStatus, ConditionReason, ConditionStatus, ErrorKind, LeaderWatch,
    ObjectRef, Outcome, ReconcileEvent, RejectedRevision, ResourceKind, Revision, SourceObject,
};
use sctl_storage::Storage;

use crate::error::{FetchError, ReconcileError};
use crate::fetcher::{FetchResult, Fetcher};
use crate::forwarder::EventForwarder;
use crate::limiter::ConcurrencyLimiter;
use crate::queue::WorkQueue;
use crate::store::SourceStore;

/// Counter of finished tasks, labelled by kind and outcome.
pub const RECONCILE_TOTAL: &str = "sctl_reconcile_total";

/// Histogram of task durations in seconds, labelled by kind.
pub const RECONCILE_DURATION: &str = "sctl_reconcile_duration_seconds";

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// Stage of a reconciliation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Dequeued, not yet started.
    Pending,
    /// Resolving the upstream revision and content.
    Fetching,
    /// Writing the artifact and moving the current pointer.
    Storing,
    /// Writing status back to the source.
    Publishing,
    /// Finished successfully.
    Done,
    /// A stage failed.
    Failed,
}

impl TaskPhase {
    /// Whether the task has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the task occupies a concurrency slot in this phase.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Fetching | Self::Storing | Self::Publishing)
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Fetching => "Fetching",
            Self::Storing => "Storing",
            Self::Publishing => "Publishing",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One reconciliation attempt for one object.
#[derive(Debug, Clone)]
pub struct ReconcileTask {
    /// The object being reconciled.
    pub id: ObjectRef,
    /// Current stage.
    pub phase: TaskPhase,
    /// Revision the upstream reported, once known.
    pub desired_revision: Option<Revision>,
}

impl ReconcileTask {
    fn new(id: ObjectRef) -> Self {
        Self {
            id,
            phase: TaskPhase::Pending,
            desired_revision: None,
        }
    }

    fn advance(&mut self, next: TaskPhase) {
        tracing::trace!(object = %self.id, from = %self.phase, to = %next, "task phase");
        self.phase = next;
    }
}

/// How a successful task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new artifact was stored and published.
    Stored {
        /// The stored artifact.
        artifact: Artifact,
        /// Resync interval of the source.
        interval: Duration,
    },
    /// Upstream unchanged since the last published revision.
    Unchanged {
        /// The unchanged revision.
        revision: Revision,
        /// Resync interval of the source.
        interval: Duration,
    },
    /// Upstream still at a revision rejected as too large; nothing written.
    Rejected {
        /// The rejected revision.
        revision: Revision,
        /// Resync interval of the source.
        interval: Duration,
    },
    /// The owner is gone; its artifacts were removed.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Control loop for one resource kind.
pub struct Coordinator {
    kind: ResourceKind,
    storage: Arc<Storage>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn SourceStore>,
    events: EventForwarder,
    queue: WorkQueue,
    limiter: ConcurrencyLimiter,
}

impl Coordinator {
    /// Create a coordinator for `kind`.
    pub fn new(
        kind: ResourceKind,
        storage: Arc<Storage>,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn SourceStore>,
        events: EventForwarder,
        max_concurrent: usize,
    ) -> Self {
        Self {
            kind,
            storage,
            fetcher,
            store,
            events,
            queue: WorkQueue::new(),
            limiter: ConcurrencyLimiter::new(max_concurrent),
        }
    }

    /// The kind this coordinator reconciles.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The work queue, for inspection.
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// The concurrency limiter, for inspection.
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Reconcile `id` once.
    pub async fn reconcile(&self, id: &ObjectRef) -> Result<ReconcileOutcome, ReconcileError> {
        let mut task = ReconcileTask::new(id.clone());
        let result = self.run_task(&mut task).await;
        if let Err(err) = &result {
            task.advance(TaskPhase::Failed);
            if err.kind() == ErrorKind::SizeExceeded {
                if let Some(revision) = &task.desired_revision {
                    self.mark_rejected(id, revision).await;
                }
            }
        }
        result
    }

    async fn run_task(&self, task: &mut ReconcileTask) -> Result<ReconcileOutcome, ReconcileError> {
        let id = task.id.clone();
        let source = match self.store.get(&id).await? {
            Some(source) if !source.deletion_requested => source,
            _ => return self.clean_up(&id).await,
        };
        let interval = source.spec.interval();

        task.advance(TaskPhase::Fetching);
        let rejected = source.status.rejected_at(source.generation).cloned();
        let last = rejected
            .clone()
            .or_else(|| source.status.last_revision().cloned());
        let mut fetched = self.fetcher.fetch(&source, last.as_ref()).await?;

        if let FetchResult::Unchanged(revision) = &fetched {
            task.desired_revision = Some(revision.clone());
            if rejected.as_ref() == Some(revision) {
                task.advance(TaskPhase::Done);
                return Ok(ReconcileOutcome::Rejected {
                    revision: revision.clone(),
                    interval,
                });
            }
            let key = ArtifactKey::new(id.clone(), revision.clone());
            if self.storage.exists(&key).await? {
                if !source.status.is_ready() || source.status.observed_generation != source.generation {
                    task.advance(TaskPhase::Publishing);
                    let artifact = self.storage.stat(&key).await?;
                    self.storage.mark_current(&key).await?;
                    self.publish_ready(&source, &key, &artifact).await?;
                }
                task.advance(TaskPhase::Done);
                return Ok(ReconcileOutcome::Unchanged {
                    revision: revision.clone(),
                    interval,
                });
            }
            tracing::info!(
                controller = %self.kind,
                object = %id,
                revision = %revision,
                "published artifact missing from storage, fetching again"
            );
            fetched = self.fetcher.fetch(&source, None).await?;
        }

        let FetchResult::Fetched { revision, content } = fetched else {
            return Err(FetchError::NoContent(self.kind).into());
        };
        task.desired_revision = Some(revision.clone());
        if rejected.as_ref() == Some(&revision) {
            task.advance(TaskPhase::Done);
            return Ok(ReconcileOutcome::Rejected { revision, interval });
        }

        // The owner may have been deleted while fetching.
        match self.store.get(&id).await? {
            Some(current) if !current.deletion_requested => {}
            _ => return self.clean_up(&id).await,
        }

        task.advance(TaskPhase::Storing);
        let key = ArtifactKey::new(id.clone(), revision);
        let artifact = self.storage.write(&key, content.as_ref()).await?;
        self.storage.mark_current(&key).await?;

        task.advance(TaskPhase::Publishing);
        self.publish_ready(&source, &key, &artifact).await?;

        task.advance(TaskPhase::Done);
        Ok(ReconcileOutcome::Stored { artifact, interval })
    }

    async fn publish_ready(
        &self,
        source: &SourceObject,
        key: &ArtifactKey,
        artifact: &Artifact,
    ) -> Result<(), ReconcileError> {
        let mut status = source.status.clone();
        status.artifact = Some(ArtifactStatus {
            url: self.storage.artifact_url(key),
            checksum: artifact.checksum,
            revision: key.revision.clone(),
            last_updated: artifact.created_at,
        });
        status.set_ready(
            ConditionStatus::True,
            ConditionReason::Succeeded,
            format!("stored artifact for revision {}", key.revision),
            Utc::now(),
        );
        status.observed_generation = source.generation;
        status.rejected = None;
        self.store.publish_status(&source.id, status).await?;
        Ok(())
    }

    /// Remember that `revision` is too large, so resyncs at the same
    /// generation skip it.
    async fn mark_rejected(&self, id: &ObjectRef, revision: &Revision) {
        let source = match self.store.get(id).await {
            Ok(Some(source)) => source,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(controller = %self.kind, object = %id, error = %e, "cannot read source to record rejection");
                return;
            }
        };
        let mut status = source.status.clone();
        status.rejected = Some(RejectedRevision {
            revision: revision.clone(),
            generation: source.generation,
        });
        if let Err(e) = self.store.publish_status(id, status).await {
            tracing::warn!(controller = %self.kind, object = %id, error = %e, "failed to record rejected revision");
        }
    }

    async fn clean_up(&self, id: &ObjectRef) -> Result<ReconcileOutcome, ReconcileError> {
        self.storage.delete_owner(id).await?;
        Ok(ReconcileOutcome::Cancelled)
    }

    /// Record a failure on the source's `Ready` condition. Returns the
    /// source's resync interval.
    async fn publish_failure(&self, id: &ObjectRef, err: &ReconcileError) -> Duration {
        let source = match self.store.get(id).await {
            Ok(Some(source)) => source,
            Ok(None) => return Duration::from_secs(DEFAULT_INTERVAL_SECS),
            Err(e) => {
                tracing::warn!(controller = %self.kind, object = %id, error = %e, "cannot read source to record failure");
                return Duration::from_secs(DEFAULT_INTERVAL_SECS);
            }
        };
        let mut status = source.status.clone();
        status.set_ready(
            ConditionStatus::False,
            ConditionReason::for_error(err.kind()),
            err.to_string(),
            Utc::now(),
        );
        status.observed_generation = source.generation;
        if let Err(e) = self.store.publish_status(id, status).await {
            tracing::warn!(controller = %self.kind, object = %id, error = %e, "failed to publish failure status");
        }
        source.spec.interval()
    }

    /// Reconcile `id`, then record metrics, emit an event, and requeue.
    pub async fn handle(&self, id: ObjectRef) {
        let kind = self.kind.as_str();
        let started = Instant::now();
        let result = self.reconcile(&id).await;
        metrics::histogram!(RECONCILE_DURATION, "kind" => kind).record(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(ReconcileOutcome::Stored { artifact, interval }) => {
                tracing::info!(
                    controller = kind,
                    namespace = id.namespace(),
                    name = id.name(),
                    revision = %artifact.revision,
                    checksum = %artifact.checksum,
                    "stored artifact"
                );
                self.queue.forget(&id);
                self.queue.add_after(id.clone(), interval);
                self.events.forward(
                    ReconcileEvent::new(&id, Outcome::Succeeded, format!("stored artifact for revision {}", artifact.revision))
                        .with_revision(artifact.revision),
                );
                Outcome::Succeeded
            }
            Ok(ReconcileOutcome::Unchanged { revision, interval }) => {
                tracing::debug!(
                    controller = kind,
                    namespace = id.namespace(),
                    name = id.name(),
                    revision = %revision,
                    "artifact up to date"
                );
                self.queue.forget(&id);
                self.queue.add_after(id.clone(), interval);
                Outcome::Unchanged
            }
            Ok(ReconcileOutcome::Rejected { revision, interval }) => {
                tracing::debug!(
                    controller = kind,
                    namespace = id.namespace(),
                    name = id.name(),
                    revision = %revision,
                    "revision was rejected as too large, waiting for a new one"
                );
                self.queue.forget(&id);
                self.queue.add_after(id.clone(), interval);
                Outcome::Unchanged
            }
            Ok(ReconcileOutcome::Cancelled) => {
                tracing::info!(
                    controller = kind,
                    namespace = id.namespace(),
                    name = id.name(),
                    "source deleted, artifacts removed"
                );
                self.queue.forget(&id);
                self.events
                    .forward(ReconcileEvent::new(&id, Outcome::Cancelled, "source deleted"));
                Outcome::Cancelled
            }
            Err(err) => {
                let error_kind = err.kind();
                let interval = self.publish_failure(&id, &err).await;
                self.events
                    .forward(ReconcileEvent::new(&id, Outcome::Failed, err.to_string()));
                match error_kind {
                    ErrorKind::Cancelled => self.queue.forget(&id),
                    k if k.is_retryable() => {
                        let delay = self.queue.add_rate_limited(id.clone());
                        tracing::warn!(
                            controller = kind,
                            namespace = id.namespace(),
                            name = id.name(),
                            error = %err,
                            error_kind = %error_kind,
                            retry_in_secs = delay.as_secs(),
                            "reconciliation failed"
                        );
                    }
                    _ => {
                        self.queue.forget(&id);
                        self.queue.add_after(id.clone(), interval);
                        tracing::error!(
                            controller = kind,
                            namespace = id.namespace(),
                            name = id.name(),
                            error = %err,
                            error_kind = %error_kind,
                            "reconciliation failed permanently for this revision"
                        );
                    }
                }
                Outcome::Failed
            }
        };

        metrics::counter!(RECONCILE_TOTAL, "kind" => kind, "outcome" => outcome.as_str()).increment(1);
        self.queue.done(&id);
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Watch the store and dispatch tasks until `cancel` fires, then wait
    /// for in-flight tasks.
    pub async fn run(self: Arc<Self>, leader: LeaderWatch, cancel: CancellationToken) {
        tracing::info!(
            controller = %self.kind,
            max_concurrent = self.limiter.max(),
            "starting coordinator"
        );
        let watch = self.clone().watch_loop(cancel.clone());
        let dispatch = self.clone().dispatch_loop(leader, cancel);
        tokio::join!(watch, dispatch);
        tracing::info!(controller = %self.kind, "coordinator stopped");
    }

    async fn enqueue_all(&self) {
        match self.store.list(self.kind).await {
            Ok(ids) => {
                for id in ids {
                    self.queue.add(id);
                }
            }
            Err(e) => tracing::error!(controller = %self.kind, error = %e, "failed to list sources"),
        }
    }

    async fn watch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.store.subscribe();
        self.enqueue_all().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(id) if id.kind() == self.kind => self.queue.add(id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(controller = %self.kind, missed, "watch lagged, relisting");
                        self.enqueue_all().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut leader: LeaderWatch, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(controller = %self.kind, error = %e, "reconcile task panicked");
                }
            }

            if !leader.is_leader() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    leading = leader.wait_for_leadership() => {
                        if !leading {
                            break;
                        }
                    }
                }
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.limiter.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };
            let id = tokio::select! {
                _ = cancel.cancelled() => break,
                id = self.queue.get() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            // Leadership may have moved while waiting for work.
            if !leader.is_leader() {
                self.queue.done(&id);
                self.queue.add(id);
                continue;
            }

            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.handle(id).await;
            });
        }

        self.queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(controller = %self.kind, error = %e, "reconcile task panicked");
            }
        }
    }
}
