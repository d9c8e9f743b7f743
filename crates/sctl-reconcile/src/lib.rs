//! # sctl-reconcile — Reconciliation Orchestration
//!
//! Runs one [`Coordinator`] per resource kind against the shared artifact
//! storage. Each coordinator drives tasks through
//! `Pending → Fetching → Storing → Publishing → Done` (or `Failed`):
//!
//! ```text
//! SourceStore ──watch──▶ WorkQueue ──▶ dispatch ──(leader? permit?)──▶ task
//!                                                                      │
//!        Fetcher ◀── GetterRegistry              Storage.write + mark_current
//!                                                                      │
//!                          SourceStore.publish_status ◀────────────────┘
//!                                                                      │
//!                                                 EventForwarder (best effort)
//! ```
//!
//! ## Collaborators
//!
//! - [`SourceStore`]: where declared sources live and where status is
//!   published. [`InMemorySourceStore`] backs local mode and tests.
//! - [`Fetcher`]: per-kind upstream logic. [`IndexFetcher`] and
//!   [`ChartFetcher`] go through the [`GetterRegistry`].
//! - [`LeaderElector`]: keeps the [`sctl_core::LeaderWatch`] that gates
//!   dispatch and sweeping in sync with a [`LeaseStore`].

pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod forwarder;
pub mod getter;
pub mod leader;
pub mod limiter;
pub mod queue;
pub mod store;

pub use coordinator::{Coordinator, ReconcileOutcome, ReconcileTask, TaskPhase};
pub use error::{FetchError, ReconcileError, StoreError};
pub use fetcher::{
    default_fetcher, ArchiveFetcher, ChartFetcher, FetchResult, Fetcher, IndexFetcher,
};
pub use forwarder::{EventForwarder, ForwarderWorker};
pub use getter::{Getter, GetterRegistry, HttpGetter};
pub use leader::{
    FileLeaseStore, InMemoryLeaseStore, LeaderElector, LeaseError, LeaseRecord, LeaseStore,
};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use queue::WorkQueue;
pub use store::{InMemorySourceStore, SourceStore};
