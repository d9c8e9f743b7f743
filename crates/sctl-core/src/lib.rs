#![deny(missing_docs)]

//! # sctl-core — Foundational Types for the Source Controller
//!
//! This crate defines the types every other crate in the workspace shares.
//! It has no internal crate dependencies.
//!
//! ## Design Principles
//!
//! 1. **Validated identities.** [`ObjectRef`] and [`Revision`] check their
//!    input at construction time, so a value that reaches the storage layer
//!    can never escape the artifact root through its path.
//!
//! 2. **One path codec.** [`ArtifactKey::relative_path()`] is the only
//!    mapping from (owner, revision) to a storage-relative path.
//!
//! 3. **Explicit kind registry.** Known resource kinds live in a
//!    [`KindRegistry`] built once at startup and passed by reference.
//!    There is no process-wide mutable table.
//!
//! 4. **Shared error taxonomy.** Every error type in the workspace maps to
//!    an [`ErrorKind`], which drives requeue policy and status reasons.

pub mod artifact;
pub mod digest;
pub mod error;
pub mod event;
pub mod identity;
pub mod kind;
pub mod leadership;
pub mod source;

// Re-export primary types at crate root for ergonomic imports.
pub use artifact::Artifact;
pub use digest::{sha256_digest, ContentDigest, Sha256Accumulator};
pub use error::{ErrorKind, ValidationError};
pub use event::{Outcome, ReconcileEvent};
pub use identity::{ArtifactKey, ObjectRef, Revision};
pub use kind::{KindRegistry, ResourceKind};
pub use leadership::{leadership_channel, LeaderSignal, LeaderWatch};
pub use source::{
    ArtifactStatus, Condition, ConditionReason, ConditionStatus, RejectedRevision, SourceObject,
    SourceSpec, SourceStatus,
};
