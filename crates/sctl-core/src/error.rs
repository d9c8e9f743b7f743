//! # Error Taxonomy
//!
//! [`ErrorKind`] is the cross-crate classification of failures. Each crate
//! keeps its own `thiserror` enum with diagnostic context and exposes a
//! `kind()` accessor returning one of these variants.
//!
//! [`ValidationError`] covers malformed identities and digests rejected at
//! construction time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, shared by every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Storage unusable or a filesystem operation failed.
    Io,
    /// Artifact larger than the configured maximum.
    SizeExceeded,
    /// Read of an artifact that does not exist.
    NotFound,
    /// Malformed identity or hostname input.
    Configuration,
    /// The upstream getter failed.
    Fetch,
    /// Writing status back to the resource failed.
    Publish,
    /// Malformed object identity, revision, or spec.
    Validation,
    /// The owning resource was deleted while the task was in flight.
    Cancelled,
}

impl ErrorKind {
    /// Return the snake_case name used in logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::SizeExceeded => "size_exceeded",
            Self::NotFound => "not_found",
            Self::Configuration => "configuration",
            Self::Fetch => "fetch",
            Self::Publish => "publish",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a task failing with this kind should be retried with backoff.
    ///
    /// Permanent kinds (`SizeExceeded`, `Validation`, `Configuration`) are
    /// not retried for the same revision; the task waits for the next spec
    /// change or resync. `Cancelled` tasks are dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io | Self::NotFound | Self::Fetch | Self::Publish)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation errors for identities, revisions, and digests.
///
/// Each variant carries the rejected input so operators can diagnose a
/// misconfigured resource without guesswork.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A namespace or name is not a valid DNS-1123 subdomain.
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidName {
        /// Which field was rejected ("namespace" or "name").
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A revision is empty or contains control characters.
    #[error("invalid revision {0:?}: must be non-empty, at most 1024 bytes, without control characters")]
    InvalidRevision(String),

    /// A digest string is not 64 lowercase hex characters.
    #[error("invalid SHA-256 digest {0:?}: expected 64 hex characters")]
    InvalidDigest(String),

    /// A resource kind name is not registered.
    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),

    /// A resource kind was registered twice.
    #[error("resource kind {0} is already registered")]
    DuplicateKind(String),
}

impl ValidationError {
    /// Every validation error classifies as [`ErrorKind::Validation`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}
