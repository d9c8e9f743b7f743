//! Reconciliation error types.
//!
//! Each stage has its own error enum; [`ReconcileError`] wraps them and
//! maps to an [`ErrorKind`], which decides whether the task is retried
//! with backoff, parked until resync, or dropped.

use sctl_core::{ErrorKind, ObjectRef, ResourceKind, ValidationError};
use sctl_storage::StorageError;
use thiserror::Error;

/// Errors fetching upstream content.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The source URL does not parse.
    #[error("invalid source URL {url:?}: {source}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },

    /// No getter handles the URL scheme.
    #[error("no getter registered for scheme {scheme:?} (url {url})")]
    UnsupportedScheme {
        /// The unhandled scheme.
        scheme: String,
        /// The URL being fetched.
        url: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Transport failure.
    #[error("HTTP error fetching {url}: {source}")]
    Http {
        /// The URL being fetched.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The upstream answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status {
        /// The URL being fetched.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// The upstream content is malformed.
    #[error("invalid content at {url}: {reason}")]
    InvalidContent {
        /// The URL being fetched.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The response body is larger than the configured limit.
    #[error("{url} exceeds the maximum artifact size of {limit} bytes")]
    TooLarge {
        /// The URL being fetched.
        url: String,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// The source spec lacks a field this kind needs.
    #[error("source spec is incomplete: {0}")]
    IncompleteSpec(String),

    /// The fetcher reported no change without a previous revision to
    /// compare against.
    #[error("fetcher for {0} returned no content")]
    NoContent(ResourceKind),

    /// The upstream reported a revision string that is not valid.
    #[error(transparent)]
    Revision(#[from] ValidationError),
}

impl FetchError {
    /// Cross-crate classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl { .. } | Self::IncompleteSpec(_) => ErrorKind::Validation,
            Self::Client(_) => ErrorKind::Configuration,
            Self::TooLarge { .. } => ErrorKind::SizeExceeded,
            _ => ErrorKind::Fetch,
        }
    }
}

/// Errors reading sources or publishing their status.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The object does not exist.
    #[error("source {0} not found")]
    NotFound(ObjectRef),

    /// The backing store rejected the operation.
    #[error("source store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Cross-crate classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Backend(_) => ErrorKind::Publish,
        }
    }
}

/// A failed reconciliation task.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The `Fetching` stage failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The `Storing` stage failed.
    #[error("storage operation failed: {0}")]
    Storage(#[from] StorageError),

    /// Reading the source or publishing its status failed.
    #[error("status publish failed: {0}")]
    Publish(#[from] StoreError),
}

impl ReconcileError {
    /// Cross-crate classification, which drives requeue policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Publish(_) => ErrorKind::Publish,
        }
    }
}
